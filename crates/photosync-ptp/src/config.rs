//! Tethering configuration, loaded from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::sync::SyncMode;

/// Every field has a default, so a partial file (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherConfig {
    /// Where downloads land. Created if missing.
    pub download_dir: PathBuf,
    /// Requested sync mode. Event-only cameras override it.
    pub sync_mode: SyncMode,
    pub poll_interval_ms: u64,
    /// Upper bound for a single wait on the event endpoint.
    pub event_wait_ms: u64,
    /// Upper bound for a single USB call.
    pub operation_timeout_ms: u64,
    pub close_timeout_ms: u64,
    /// Bytes per bulk read during a download.
    pub chunk_size: usize,
    /// Treat photos already on the card at session start as synced.
    pub skip_existing: bool,
}

const MIN_POLL_INTERVAL_MS: u64 = 100;
const MIN_EVENT_WAIT_MS: u64 = 10;
const MIN_OPERATION_TIMEOUT_MS: u64 = 100;
const MIN_CLOSE_TIMEOUT_MS: u64 = 100;
// Must stay a multiple of the largest bulk packet size (1024 for SuperSpeed).
const MIN_CHUNK_SIZE: usize = 1024;
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            sync_mode: SyncMode::Polling,
            poll_interval_ms: 1000,
            event_wait_ms: 250,
            operation_timeout_ms: 5000,
            close_timeout_ms: 3000,
            chunk_size: 64 * 1024,
            skip_existing: false,
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("photosync")
}

impl TetherConfig {
    /// Clamps values into workable ranges and rounds the chunk size to whole packets.
    pub fn normalized(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        self.event_wait_ms = self.event_wait_ms.max(MIN_EVENT_WAIT_MS);
        self.operation_timeout_ms = self.operation_timeout_ms.max(MIN_OPERATION_TIMEOUT_MS);
        self.close_timeout_ms = self.close_timeout_ms.max(MIN_CLOSE_TIMEOUT_MS);
        let chunk = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.chunk_size = chunk - chunk % MIN_CHUNK_SIZE;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn event_wait(&self) -> Duration {
        Duration::from_millis(self.event_wait_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Loads the config file. Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_config(path: &Path) -> TetherConfig {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return TetherConfig::default(),
        Err(e) => {
            warn!("Couldn't read config {}: {}, using defaults", path.display(), e);
            return TetherConfig::default();
        }
    };

    match serde_json::from_str::<TetherConfig>(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("Couldn't parse config {}: {}, using defaults", path.display(), e);
            TetherConfig::default()
        }
    }
}

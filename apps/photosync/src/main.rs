//! `photosync`: tether a USB camera and download photos as they are taken.
//!
//! Lists cameras with `--list` and what was synced so far with `--history`. Otherwise opens a session on the first supported
//! camera (or the one picked with `--device vid:pid`), prints transfer progress,
//! catalogs every downloaded RAW/JPEG file, and closes on Ctrl-C or unplug.

// Diagnostics go through log::*; only user-facing output is printed.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod catalog;
mod media;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::DateTime;
use clap::{Parser, ValueEnum};
use log::{debug, info, warn};
use photosync_ptp::usb::{self, CameraWatcher, DeviceChange, NusbTransportFactory};
use photosync_ptp::{
    CameraSession, CapabilityResolver, DeviceDescriptor, ObjectHandle, SyncMode, TetherConfig, TetherEvent,
    load_config,
};

use crate::catalog::Catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// List the card periodically
    Polling,
    /// Wait for object-added events from the camera
    Events,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Polling => SyncMode::Polling,
            ModeArg::Events => SyncMode::EventDriven,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "photosync", version, about = "Tether a USB camera and download new photos")]
struct Cli {
    /// List connected cameras and exit
    #[arg(long)]
    list: bool,

    /// Print cataloged cameras and photos and exit
    #[arg(long)]
    history: bool,

    /// Camera to tether, as hex vendor:product (for example 04a9:32d9)
    #[arg(long, value_parser = parse_device_id)]
    device: Option<(u16, u16)>,

    /// Where photos are saved (overrides the config file)
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Discovery strategy (overrides the config file)
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Only download photos taken after the session opens
    #[arg(long)]
    skip_existing: bool,

    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use alternate catalog database
    #[arg(long)]
    catalog: Option<PathBuf>,
}

fn parse_device_id(value: &str) -> Result<(u16, u16), String> {
    let (vendor, product) = value
        .split_once(':')
        .ok_or_else(|| format!("expected vid:pid, got {value:?}"))?;
    let parse = |part: &str| {
        u16::from_str_radix(part.trim_start_matches("0x"), 16).map_err(|e| format!("bad ID {part:?}: {e}"))
    };
    Ok((parse(vendor)?, parse(product)?))
}

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join("photosync")
}

/// Config file, then CLI flags on top, then clamped.
fn build_config(cli: &Cli) -> TetherConfig {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| app_dir(dirs::config_dir()).join("config.json"));
    let mut config = load_config(&path);
    if let Some(dir) = &cli.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(mode) = cli.mode {
        config.sync_mode = mode.into();
    }
    if cli.skip_existing {
        config.skip_existing = true;
    }
    config.normalized()
}

fn pick_device(cameras: Vec<DeviceDescriptor>, wanted: Option<(u16, u16)>) -> Option<DeviceDescriptor> {
    cameras
        .into_iter()
        .find(|d| wanted.is_none_or(|(vid, pid)| d.vendor_id == vid && d.product_id == pid))
}

#[allow(clippy::print_stdout, reason = "CLI output")]
fn list(resolver: &CapabilityResolver) {
    let cameras = usb::list_devices();
    if cameras.is_empty() {
        println!("No cameras found.");
        return;
    }
    for camera in cameras {
        println!(
            "{:<8} {:04x}:{:04x}  {:<28} {} variant",
            camera.location,
            camera.vendor_id,
            camera.product_id,
            camera.display_name(),
            resolver.variant_for(&camera)
        );
    }
}

fn open_catalog(cli: &Cli) -> Result<Catalog> {
    let path = cli
        .catalog
        .clone()
        .unwrap_or_else(|| app_dir(dirs::data_dir()).join("catalog.db"));
    Catalog::open(&path).with_context(|| format!("opening {}", path.display()))
}

fn format_millis(millis: Option<i64>) -> String {
    millis
        .and_then(DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn history_lines(catalog: &Catalog) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for device in catalog.devices()? {
        lines.push(format!(
            "{}{}  [{}]",
            device.display_name,
            if device.is_syncing { " (syncing)" } else { "" },
            device.name
        ));
        lines.push(format!(
            "  {:04x}:{:04x}, firmware {}, serial {}",
            device.vendor_id,
            device.product_id,
            device.version.as_deref().unwrap_or("?"),
            device.serial_number.as_deref().unwrap_or("?")
        ));
        lines.push(format!(
            "  {} photo(s) synced, last sync {}, first seen {}, updated {}",
            device.synced_handles.len(),
            format_millis(device.synced_at),
            format_millis(Some(device.created_at)),
            format_millis(Some(device.updated_at))
        ));
    }
    let photos = catalog.photos()?;
    lines.push(format!("{} photo(s) cataloged", photos.len()));
    for photo in photos {
        lines.push(format!(
            "  {}  {}  {}",
            format_millis(Some(photo.created_at)),
            photo.name.as_deref().unwrap_or("?"),
            photo.path.display()
        ));
    }
    Ok(lines)
}

#[allow(clippy::print_stdout, reason = "CLI output")]
fn history(catalog: &Catalog) -> Result<()> {
    for line in history_lines(catalog)? {
        println!("{}", line);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let resolver = CapabilityResolver::new();

    if cli.list {
        list(&resolver);
        return Ok(());
    }
    if cli.history {
        return history(&open_catalog(&cli)?);
    }

    let config = build_config(&cli);
    let device = match pick_device(usb::list_devices(), cli.device) {
        Some(device) => device,
        None => match cli.device {
            Some((vid, pid)) => bail!("No camera {:04x}:{:04x} connected", vid, pid),
            None => bail!("No camera connected"),
        },
    };
    let catalog = open_catalog(&cli)?;

    let session = resolver.resolve(device, Arc::new(NusbTransportFactory), config)?;
    tether(session, catalog).await
}

/// Runs one session to completion: open, react to events, close.
async fn tether(session: CameraSession, catalog: Catalog) -> Result<()> {
    let device = session.descriptor().clone();
    let name = device.unique_name();
    catalog.upsert_device(&device, None)?;
    session.set_known_handles(catalog.synced_handles(&name)?);

    let mut events = session.subscribe();
    let clearer = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || clearer.clear_status()).await? {
        warn!("Clear status failed: {}", e.user_message());
    }
    let mode = session.set_sync_mode(session.config().sync_mode)?;

    let opener = session.clone();
    tokio::task::spawn_blocking(move || opener.open())
        .await?
        .map_err(|e| anyhow!("{}", e.user_message()))?;
    if let Some(info) = session.device_info() {
        catalog.upsert_device(&device, Some(&info.device_version))?;
    }
    catalog.set_syncing(&name, true)?;
    info!(
        "Tethered to {} ({} sync), saving to {}",
        device.display_name(),
        mode,
        session.config().download_dir.display()
    );

    let mut watcher = match usb::watch_hotplug() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Hotplug watching unavailable, unplug won't be noticed early: {}", e);
            None
        }
    };
    let mut progress = ProgressPrinter::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !handle_event(&event, &catalog, &name, &mut progress) {
                    break;
                }
            }
            change = next_change(&mut watcher) => match change {
                Some(DeviceChange::Detached(gone)) if gone.location == device.location => {
                    let detached = session.clone();
                    tokio::task::spawn_blocking(move || detached.notify_detached()).await?;
                }
                Some(change) => debug!("Ignoring {:?}", change),
                None => watcher = None,
            },
        }
    }

    if let Err(e) = catalog.set_syncing(&name, false) {
        warn!("Couldn't clear the syncing flag: {}", e);
    }
    let closer = session.clone();
    tokio::task::spawn_blocking(move || closer.close()).await?;
    Ok(())
}

async fn next_change(watcher: &mut Option<CameraWatcher>) -> Option<DeviceChange> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

/// Returns false once the session is over.
#[allow(clippy::print_stdout, reason = "CLI output")]
fn handle_event(event: &TetherEvent, catalog: &Catalog, device: &str, progress: &mut ProgressPrinter) -> bool {
    match event {
        TetherEvent::ObjectDiscovered { handle, mode } => debug!("New object {} ({})", handle, mode),
        TetherEvent::TransferProgress(p) => progress.update(p.handle, p.percent),
        TetherEvent::TransferCompleted {
            handle,
            path,
            bytes,
            elapsed,
        } => {
            progress.finish(*handle);
            println!("Saved {} ({} bytes, {:.1}s)", path.display(), bytes, elapsed.as_secs_f64());
            if media::is_photo(path)
                && let Err(e) = catalog.record_photo(path)
            {
                warn!("Couldn't catalog {}: {}", path.display(), e);
            }
            if let Err(e) = catalog.add_synced_handle(device, *handle) {
                warn!("Couldn't remember {} as synced: {}", handle, e);
            }
        }
        TetherEvent::TransferFailed { handle, cause } => {
            progress.finish(*handle);
            println!("Download of {} failed: {}", handle, cause.user_message());
        }
        TetherEvent::DiscoveryFailed { error } => warn!("Discovery failed: {}", error),
        TetherEvent::SyncModeChanged { requested, effective } => {
            if requested != effective {
                println!("This camera only supports {} sync", effective);
            }
        }
        TetherEvent::SessionFaulted { error } => {
            println!("Session failed: {}", error.user_message());
            return false;
        }
        TetherEvent::SessionClosed { reason } => {
            info!("Session closed ({:?})", reason);
            return false;
        }
    }
    true
}

/// Prints a progress line every 25%.
#[derive(Default)]
struct ProgressPrinter {
    last: HashMap<ObjectHandle, u8>,
}

impl ProgressPrinter {
    #[allow(clippy::print_stdout, reason = "CLI output")]
    fn update(&mut self, handle: ObjectHandle, percent: u8) {
        let step = percent / 25;
        let last = self.last.entry(handle).or_insert(0);
        if step > *last / 25 {
            println!("  {} {:>3}%", handle, percent);
            *last = percent;
        }
    }

    fn finish(&mut self, handle: ObjectHandle) {
        self.last.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photosync_ptp::InterfaceDescriptor;

    fn camera(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id,
            product_id,
            class: 0,
            subclass: 0,
            protocol: 0,
            serial_number: None,
            manufacturer: None,
            product: None,
            interfaces: vec![InterfaceDescriptor {
                number: 0,
                class: 6,
                subclass: 1,
                protocol: 1,
                name: None,
            }],
            location: format!("1-{}", product_id & 0x7f),
        }
    }

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("04a9:32d9"), Ok((0x04a9, 0x32d9)));
        assert_eq!(parse_device_id("0x054c:0x0994"), Ok((0x054c, 0x0994)));
        assert!(parse_device_id("04a9").is_err());
        assert!(parse_device_id("zz:01").is_err());
    }

    #[test]
    fn test_pick_device() {
        let cameras = vec![camera(0x04a9, 1), camera(0x054c, 2)];
        assert_eq!(pick_device(cameras.clone(), None).map(|d| d.vendor_id), Some(0x04a9));
        assert_eq!(
            pick_device(cameras.clone(), Some((0x054c, 2))).map(|d| d.vendor_id),
            Some(0x054c)
        );
        assert_eq!(pick_device(cameras, Some((0x04b0, 1))), None);
    }

    #[test]
    fn test_cli_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"syncMode":"eventDriven","pollIntervalMs":5}"#).unwrap();

        let cli = Cli::parse_from([
            "photosync",
            "--config",
            config_path.to_str().unwrap(),
            "--download-dir",
            "/tmp/shots",
            "--skip-existing",
        ]);
        let config = build_config(&cli);
        assert_eq!(config.sync_mode, SyncMode::EventDriven);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/shots"));
        assert!(config.skip_existing);
        assert_eq!(config.poll_interval_ms, 100, "clamped to the minimum");

        let cli = Cli::parse_from(["photosync", "--config", config_path.to_str().unwrap(), "--mode", "polling"]);
        assert_eq!(build_config(&cli).sync_mode, SyncMode::Polling);
    }

    #[test]
    fn test_history_lists_cameras_and_photos() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("c.db")).unwrap();
        assert_eq!(history_lines(&catalog).unwrap(), vec!["0 photo(s) cataloged".to_string()]);

        let mut device = camera(0x04a9, 0x32d9);
        device.product = Some("Canon EOS R6".to_string());
        let name = device.unique_name();
        catalog.upsert_device(&device, Some("1.8.1")).unwrap();
        catalog.add_synced_handle(&name, ObjectHandle(7)).unwrap();
        catalog.record_photo(&dir.path().join("IMG_0007.CR3")).unwrap();

        let lines = history_lines(&catalog).unwrap();
        assert!(lines[0].starts_with("Canon EOS R6  ["), "{lines:?}");
        assert_eq!(lines[1], "  04a9:32d9, firmware 1.8.1, serial ?");
        assert!(lines[2].starts_with("  1 photo(s) synced, last sync 20"), "{lines:?}");
        assert_eq!(lines[3], "1 photo(s) cataloged");
        assert!(lines[4].contains("IMG_0007.CR3"));
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(None), "never");
        assert_eq!(format_millis(Some(0)), "1970-01-01 00:00 UTC");
    }

    #[test]
    fn test_progress_printer_steps() {
        let mut printer = ProgressPrinter::default();
        printer.update(ObjectHandle(1), 10);
        assert_eq!(printer.last.get(&ObjectHandle(1)), Some(&0));
        printer.update(ObjectHandle(1), 30);
        assert_eq!(printer.last.get(&ObjectHandle(1)), Some(&30));
        printer.update(ObjectHandle(1), 40);
        assert_eq!(printer.last.get(&ObjectHandle(1)), Some(&30));
        printer.finish(ObjectHandle(1));
        assert!(printer.last.is_empty());
    }

    #[test]
    fn test_session_end_events_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("c.db")).unwrap();
        let mut printer = ProgressPrinter::default();
        let closed = TetherEvent::SessionClosed {
            reason: photosync_ptp::events::CloseReason::Detached,
        };
        assert!(!handle_event(&closed, &catalog, "cam", &mut printer));
        let mode = TetherEvent::SyncModeChanged {
            requested: SyncMode::Polling,
            effective: SyncMode::EventDriven,
        };
        assert!(handle_event(&mode, &catalog, "cam", &mut printer));
    }
}

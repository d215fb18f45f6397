//! Download pipeline: one object from the camera to one file on disk.
//!
//! Data is written to `<name>.part` and renamed once the data phase and response
//! completed, so a file with the final name is always complete. Any failure or
//! cancellation removes the partial file. Progress is reported at 0 and after every
//! chunk. There is no automatic retry.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::ObjectHandle;
use crate::connection::DataSink;
use crate::dataset::ObjectInfo;
use crate::error::PtpError;

/// Suffix of in-flight downloads.
pub const PART_EXTENSION: &str = "part";

/// Upper bound on `-N` suffixes tried before giving up on a name.
const MAX_NAME_SUFFIX: u32 = 10_000;

/// Percentage of `transferred` out of `total`, floored and clamped to `0..=100`.
/// A total of 0 reports 0.
pub fn progress_percent(total: u64, transferred: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = u128::from(transferred) * 100 / u128::from(total);
    percent.min(100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub handle: ObjectHandle,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub percent: u8,
}

impl TransferProgress {
    fn new(handle: ObjectHandle, total_bytes: u64, transferred_bytes: u64) -> Self {
        Self {
            handle,
            total_bytes,
            transferred_bytes,
            percent: progress_percent(total_bytes, transferred_bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed {
        handle: ObjectHandle,
        path: PathBuf,
        bytes: u64,
        elapsed: Duration,
    },
    Failed {
        handle: ObjectHandle,
        cause: PtpError,
    },
    /// Nothing to download, for example a folder.
    Skipped {
        handle: ObjectHandle,
        reason: String,
    },
}

impl TransferOutcome {
    pub fn handle(&self) -> ObjectHandle {
        match self {
            Self::Completed { handle, .. } | Self::Failed { handle, .. } | Self::Skipped { handle, .. } => *handle,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// What the pipeline needs from the device. Implemented by the PTP connection.
pub(crate) trait ObjectSource {
    fn object_info(&mut self, handle: ObjectHandle) -> Result<ObjectInfo, PtpError>;
    fn read_object(&mut self, handle: ObjectHandle, sink: &mut dyn DataSink) -> Result<(), PtpError>;
}

// ============================================================================
// Destination naming
// ============================================================================

/// Strips path separators, control characters, and characters Windows rejects. A name
/// that ends up empty (or only dots) becomes `object-{handle:08x}`.
pub fn sanitize_filename(name: &str, handle: ObjectHandle) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.chars().all(|c| c == '.') {
        return format!("object-{:08x}", handle.0);
    }
    cleaned.to_string()
}

/// Picks a path in `dir` that neither exists nor has a leftover partial file. On a
/// collision, `-1`, `-2`, ... is inserted before the extension.
pub fn allocate_destination(dir: &Path, file_name: &str) -> Result<PathBuf, PtpError> {
    let candidate = dir.join(file_name);
    if is_free(&candidate) {
        return Ok(candidate);
    }

    let as_path = Path::new(file_name);
    let stem = as_path.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
    let extension = as_path.extension().and_then(|e| e.to_str());
    for n in 1..=MAX_NAME_SUFFIX {
        let name = match extension {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = dir.join(name);
        if is_free(&candidate) {
            return Ok(candidate);
        }
    }
    Err(PtpError::Io {
        path: dir.join(file_name).display().to_string(),
        message: "no free file name".to_string(),
    })
}

fn is_free(path: &Path) -> bool {
    !path.exists() && !part_path(path).exists()
}

/// `IMG_0001.CR3` → `IMG_0001.CR3.part`
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(PART_EXTENSION);
    path.with_file_name(name)
}

// ============================================================================
// Pipeline
// ============================================================================

/// Writes the data phase to the partial file, checking for cancellation before each
/// chunk and reporting progress after it.
struct FileSink<'a> {
    handle: ObjectHandle,
    writer: BufWriter<File>,
    path: &'a Path,
    /// From ObjectInfo; `None` means "use the data header length".
    total: Option<u64>,
    transferred: u64,
    cancelled: &'a AtomicBool,
    on_progress: &'a mut dyn FnMut(TransferProgress),
}

impl FileSink<'_> {
    fn check_cancelled(&self) -> Result<(), PtpError> {
        if self.cancelled.load(Ordering::Relaxed) {
            info!(
                "transfer: cancellation detected for {} after {} bytes",
                self.handle, self.transferred
            );
            return Err(PtpError::Cancelled);
        }
        Ok(())
    }

    fn report(&mut self) {
        let progress = TransferProgress::new(self.handle, self.total.unwrap_or(0), self.transferred);
        (self.on_progress)(progress);
    }
}

impl DataSink for FileSink<'_> {
    fn begin(&mut self, total: Option<u64>) -> Result<(), PtpError> {
        if self.total.is_none() {
            self.total = total;
        } else if let (Some(info_size), Some(header_size)) = (self.total, total)
            && info_size != header_size
        {
            debug!(
                "transfer: {} ObjectInfo says {} bytes, data phase says {}",
                self.handle, info_size, header_size
            );
            self.total = Some(header_size);
        }
        self.report();
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), PtpError> {
        self.check_cancelled()?;
        self.writer.write_all(chunk).map_err(|e| PtpError::io(self.path, e))?;
        self.transferred += chunk.len() as u64;
        self.report();
        Ok(())
    }
}

/// Downloads `handle` into `dest_dir`.
pub(crate) fn download(
    source: &mut dyn ObjectSource,
    handle: ObjectHandle,
    dest_dir: &Path,
    cancelled: &AtomicBool,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> TransferOutcome {
    let started = Instant::now();
    if cancelled.load(Ordering::Relaxed) {
        return TransferOutcome::Failed {
            handle,
            cause: PtpError::Cancelled,
        };
    }

    let info = match source.object_info(handle) {
        Ok(info) => info,
        Err(cause) => return TransferOutcome::Failed { handle, cause },
    };
    if info.is_association() {
        debug!("transfer: skipping association {} ({})", handle, info.filename);
        return TransferOutcome::Skipped {
            handle,
            reason: format!("{} is a folder", info.filename),
        };
    }

    match write_object(source, handle, &info, dest_dir, cancelled, on_progress) {
        Ok((path, bytes)) => {
            let elapsed = started.elapsed();
            info!(
                "transfer: {} saved to {} ({} bytes in {:?})",
                handle,
                path.display(),
                bytes,
                elapsed
            );
            TransferOutcome::Completed {
                handle,
                path,
                bytes,
                elapsed,
            }
        }
        Err(cause) => {
            warn!("transfer: {} failed: {}", handle, cause);
            TransferOutcome::Failed { handle, cause }
        }
    }
}

fn write_object(
    source: &mut dyn ObjectSource,
    handle: ObjectHandle,
    info: &ObjectInfo,
    dest_dir: &Path,
    cancelled: &AtomicBool,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<(PathBuf, u64), PtpError> {
    fs::create_dir_all(dest_dir).map_err(|e| PtpError::io(dest_dir, e))?;
    let final_path = allocate_destination(dest_dir, &sanitize_filename(&info.filename, handle))?;
    let part = part_path(&final_path);

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&part)
        .map_err(|e| PtpError::io(&part, e))?;

    let mut sink = FileSink {
        handle,
        writer: BufWriter::new(file),
        path: &part,
        total: info.size(),
        transferred: 0,
        cancelled,
        on_progress,
    };

    let result = source
        .read_object(handle, &mut sink)
        .and_then(|()| sink.writer.flush().map_err(|e| PtpError::io(&part, e)));
    let transferred = sink.transferred;
    drop(sink);

    if let Err(e) = result {
        remove_partial(&part);
        return Err(e);
    }
    if let Err(e) = fs::rename(&part, &final_path) {
        remove_partial(&part);
        return Err(PtpError::io(&final_path, e));
    }
    Ok((final_path, transferred))
}

fn remove_partial(part: &Path) {
    if let Err(e) = fs::remove_file(part)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("transfer: couldn't remove partial file {}: {}", part.display(), e);
    }
}

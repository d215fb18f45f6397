//! Which downloaded files count as photos for the catalog.

use std::path::Path;

const JPEG_EXTENSIONS: &[&str] = &["jpg", "jpeg"];

const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "cr3", // Canon
    "arw", "sr2", // Sony
    "nef", "nrw", // Nikon
    "raf", // Fujifilm
    "rw2", // Panasonic
    "dng", // Adobe
    "orf", // Olympus
    "srw", // Samsung
    "pef", // Pentax
    "rwl", // Leica
    "3fr", // Hasselblad
    "mos", // Leaf
    "kdc", "mrw", "mef", "iiq", "x3f",
];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

pub fn is_jpeg(path: &Path) -> bool {
    extension(path).is_some_and(|e| JPEG_EXTENSIONS.contains(&e.as_str()))
}

pub fn is_raw(path: &Path) -> bool {
    extension(path).is_some_and(|e| RAW_EXTENSIONS.contains(&e.as_str()))
}

/// RAW or JPEG. Videos, sidecars, and anything without an extension are not.
pub fn is_photo(path: &Path) -> bool {
    is_jpeg(path) || is_raw(path)
}

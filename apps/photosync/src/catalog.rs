//! SQLite catalog of downloaded photos and of the cameras they came from.
//!
//! `photos` is keyed by path, so recording the same download twice is harmless.
//! `sync_devices` remembers, per camera, which object handles were already
//! downloaded; the next session seeds its seen set from that list.

use std::path::{Path, PathBuf};

use chrono::Utc;
use photosync_ptp::{DeviceDescriptor, ObjectHandle};
use rusqlite::{Connection, OptionalExtension, params};

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRecord {
    pub path: PathBuf,
    pub name: Option<String>,
    /// Unix millis.
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDeviceRecord {
    /// [`DeviceDescriptor::unique_name`].
    pub name: String,
    pub display_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub version: Option<String>,
    pub synced_handles: Vec<ObjectHandle>,
    pub is_syncing: bool,
    pub synced_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CatalogError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Corrupt { device: String, message: String },
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Sqlite(err)
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            CatalogError::Io(e) => write!(f, "I/O error: {e}"),
            CatalogError::Corrupt { device, message } => {
                write!(f, "Corrupt synced-handle list for {device}: {message}")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

// ── Schema ───────────────────────────────────────────────────────────

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS photos (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        path       TEXT    NOT NULL UNIQUE,
        name       TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_devices (
        name           TEXT PRIMARY KEY,
        display_name   TEXT    NOT NULL,
        vendor_id      INTEGER NOT NULL,
        product_id     INTEGER NOT NULL,
        serial_number  TEXT,
        version        TEXT,
        synced_handles TEXT    NOT NULL DEFAULT '[]',
        is_syncing     INTEGER NOT NULL DEFAULT 0,
        synced_at      INTEGER,
        created_at     INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL
    ) WITHOUT ROWID;
";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Catalog ──────────────────────────────────────────────────────────

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (or creates) the catalog at `db_path`, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(Self { conn })
    }

    // ── Photos ───────────────────────────────────────────────────────

    /// Inserts a photo unless its path is already cataloged. Returns whether a row
    /// was added.
    pub fn record_photo(&self, path: &Path) -> Result<bool, CatalogError> {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO photos (path, name, created_at) VALUES (?1, ?2, ?3)",
            params![path.to_string_lossy(), name, now_millis()],
        )?;
        Ok(inserted > 0)
    }

    /// Oldest first.
    pub fn photos(&self) -> Result<Vec<PhotoRecord>, CatalogError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT path, name, created_at FROM photos ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(PhotoRecord {
                path: PathBuf::from(row.get::<_, String>(0)?),
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Creates or refreshes the row for `device`, keeping its synced handles.
    pub fn upsert_device(&self, device: &DeviceDescriptor, version: Option<&str>) -> Result<(), CatalogError> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO sync_devices
                 (name, display_name, vendor_id, product_id, serial_number, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(name) DO UPDATE SET
                 display_name = excluded.display_name,
                 serial_number = excluded.serial_number,
                 version = COALESCE(excluded.version, version),
                 updated_at = excluded.updated_at",
            params![
                device.unique_name(),
                device.display_name(),
                device.vendor_id,
                device.product_id,
                device.serial_number,
                version,
                now
            ],
        )?;
        Ok(())
    }

    pub fn device(&self, name: &str) -> Result<Option<SyncDeviceRecord>, CatalogError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM sync_devices WHERE name = ?1"),
                params![name],
                device_row,
            )
            .optional()?;
        row.map(finish_device).transpose()
    }

    /// Every camera ever tethered, most recently updated first.
    pub fn devices(&self) -> Result<Vec<SyncDeviceRecord>, CatalogError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {DEVICE_COLUMNS} FROM sync_devices ORDER BY updated_at DESC, name ASC"
        ))?;
        let rows = stmt.query_map([], device_row)?.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_device).collect()
    }

    /// Handles already downloaded from this camera. Empty for an unknown camera.
    pub fn synced_handles(&self, name: &str) -> Result<Vec<ObjectHandle>, CatalogError> {
        Ok(self.device(name)?.map(|d| d.synced_handles).unwrap_or_default())
    }

    /// Appends `handle` to the camera's synced list and stamps `synced_at`.
    pub fn add_synced_handle(&self, name: &str, handle: ObjectHandle) -> Result<(), CatalogError> {
        let mut handles = self.synced_handles(name)?;
        if handles.contains(&handle) {
            return Ok(());
        }
        handles.push(handle);
        let json = serde_json::to_string(&handles).map_err(|e| CatalogError::Corrupt {
            device: name.to_string(),
            message: e.to_string(),
        })?;
        let now = now_millis();
        self.conn.execute(
            "UPDATE sync_devices SET synced_handles = ?2, synced_at = ?3, updated_at = ?3 WHERE name = ?1",
            params![name, json, now],
        )?;
        Ok(())
    }

    pub fn set_syncing(&self, name: &str, syncing: bool) -> Result<(), CatalogError> {
        self.conn.execute(
            "UPDATE sync_devices SET is_syncing = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, syncing, now_millis()],
        )?;
        Ok(())
    }
}

const DEVICE_COLUMNS: &str = "name, display_name, vendor_id, product_id, serial_number, version, \
     synced_handles, is_syncing, synced_at, created_at, updated_at";

/// The record plus its raw handle list, parsed by [`finish_device`].
fn device_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(SyncDeviceRecord, String)> {
    Ok((
        SyncDeviceRecord {
            name: row.get(0)?,
            display_name: row.get(1)?,
            vendor_id: row.get(2)?,
            product_id: row.get(3)?,
            serial_number: row.get(4)?,
            version: row.get(5)?,
            synced_handles: Vec::new(),
            is_syncing: row.get(7)?,
            synced_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        },
        row.get(6)?,
    ))
}

fn finish_device((mut record, handles): (SyncDeviceRecord, String)) -> Result<SyncDeviceRecord, CatalogError> {
    record.synced_handles = parse_handles(&record.name, &handles)?;
    Ok(record)
}

fn parse_handles(device: &str, json: &str) -> Result<Vec<ObjectHandle>, CatalogError> {
    serde_json::from_str(json).map_err(|e| CatalogError::Corrupt {
        device: device.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use photosync_ptp::InterfaceDescriptor;

    fn canon() -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x04a9,
            product_id: 0x32d9,
            class: 0,
            subclass: 0,
            protocol: 0,
            serial_number: Some("0123456789".to_string()),
            manufacturer: Some("Canon Inc.".to_string()),
            product: Some("Canon EOS R6".to_string()),
            interfaces: vec![InterfaceDescriptor {
                number: 0,
                class: 6,
                subclass: 1,
                protocol: 1,
                name: None,
            }],
            location: "1-4".to_string(),
        }
    }

    #[test]
    fn test_record_photo_is_idempotent() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.record_photo(Path::new("/photos/IMG_0001.CR3")).unwrap());
        assert!(!catalog.record_photo(Path::new("/photos/IMG_0001.CR3")).unwrap());
        assert!(catalog.record_photo(Path::new("/photos/IMG_0002.CR3")).unwrap());

        let photos = catalog.photos().unwrap();
        assert_eq!(photos.len(), 2);
        assert_eq!(photos[0].path, PathBuf::from("/photos/IMG_0001.CR3"));
        assert_eq!(photos[0].name.as_deref(), Some("IMG_0001.CR3"));
    }

    #[test]
    fn test_unknown_device_has_no_synced_handles() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert_eq!(catalog.device("nope").unwrap(), None);
        assert!(catalog.synced_handles("nope").unwrap().is_empty());
    }

    #[test]
    fn test_synced_handles_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("catalog.db");
        let device = canon();
        let name = device.unique_name();
        {
            let catalog = Catalog::open(&db).unwrap();
            catalog.upsert_device(&device, Some("1.1.0")).unwrap();
            catalog.add_synced_handle(&name, ObjectHandle(7)).unwrap();
            catalog.add_synced_handle(&name, ObjectHandle(9)).unwrap();
            catalog.add_synced_handle(&name, ObjectHandle(7)).unwrap();
        }

        let catalog = Catalog::open(&db).unwrap();
        assert_eq!(catalog.synced_handles(&name).unwrap(), vec![ObjectHandle(7), ObjectHandle(9)]);
        let record = catalog.device(&name).unwrap().unwrap();
        assert_eq!(record.display_name, "Canon EOS R6");
        assert_eq!(record.vendor_id, 0x04a9);
        assert_eq!(record.version.as_deref(), Some("1.1.0"));
        assert!(record.synced_at.is_some());
    }

    #[test]
    fn test_upsert_keeps_synced_handles_and_version() {
        let catalog = Catalog::open_in_memory().unwrap();
        let device = canon();
        let name = device.unique_name();
        catalog.upsert_device(&device, Some("1.0")).unwrap();
        catalog.add_synced_handle(&name, ObjectHandle(1)).unwrap();

        catalog.upsert_device(&device, None).unwrap();
        let record = catalog.device(&name).unwrap().unwrap();
        assert_eq!(record.synced_handles, vec![ObjectHandle(1)]);
        assert_eq!(record.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_devices_lists_every_camera() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(catalog.devices().unwrap().is_empty());

        let canon = canon();
        let mut sony = canon.clone();
        sony.vendor_id = 0x054c;
        sony.product_id = 0x0994;
        sony.serial_number = Some("S1".to_string());
        sony.product = Some("ILCE-7M3".to_string());
        catalog.upsert_device(&canon, None).unwrap();
        catalog.upsert_device(&sony, None).unwrap();
        catalog.add_synced_handle(&sony.unique_name(), ObjectHandle(4)).unwrap();

        let devices = catalog.devices().unwrap();
        assert_eq!(devices.len(), 2);
        let record = devices.iter().find(|d| d.vendor_id == 0x054c).unwrap();
        assert_eq!(record.synced_handles, vec![ObjectHandle(4)]);
        assert_eq!(record.display_name, "ILCE-7M3");
    }

    #[test]
    fn test_syncing_flag() {
        let catalog = Catalog::open_in_memory().unwrap();
        let device = canon();
        let name = device.unique_name();
        catalog.upsert_device(&device, None).unwrap();
        assert!(!catalog.device(&name).unwrap().unwrap().is_syncing);
        catalog.set_syncing(&name, true).unwrap();
        assert!(catalog.device(&name).unwrap().unwrap().is_syncing);
    }

    #[test]
    fn test_corrupt_handle_list_is_reported() {
        let catalog = Catalog::open_in_memory().unwrap();
        let device = canon();
        let name = device.unique_name();
        catalog.upsert_device(&device, None).unwrap();
        catalog
            .conn
            .execute(
                "UPDATE sync_devices SET synced_handles = 'garbage' WHERE name = ?1",
                params![name],
            )
            .unwrap();
        assert!(matches!(
            catalog.synced_handles(&name),
            Err(CatalogError::Corrupt { .. })
        ));
    }
}

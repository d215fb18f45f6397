//! Vendor session variants.
//!
//! The set of variants is closed. Everything that differs between vendors is declared
//! here so the session and sync code never branch on vendor IDs.

use serde::{Deserialize, Serialize};

use crate::codes::EventCode;
use crate::sync::SyncMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionVariant {
    /// Plain PTP: standard ObjectAdded events, polling works.
    Baseline,
    Canon,
    Nikon,
    /// Firmware only reports new photos through events; the object list is not
    /// refreshed while tethered, so polling never sees new shots.
    Sony,
}

impl SessionVariant {
    pub fn name(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Canon => "canon",
            Self::Nikon => "nikon",
            Self::Sony => "sony",
        }
    }

    pub fn supports_polling(self) -> bool {
        !matches!(self, Self::Sony)
    }

    /// The mode the session will actually run in when `requested` is asked for.
    pub fn effective_sync_mode(self, requested: SyncMode) -> SyncMode {
        if self.supports_polling() {
            requested
        } else {
            SyncMode::EventDriven
        }
    }

    /// Event codes that announce a new object. The first parameter is the handle.
    pub fn object_added_codes(self) -> &'static [EventCode] {
        match self {
            Self::Baseline => &[EventCode::OBJECT_ADDED],
            Self::Canon => &[EventCode::OBJECT_ADDED, EventCode::REQUEST_OBJECT_TRANSFER],
            Self::Nikon => &[EventCode::OBJECT_ADDED, EventCode::NIKON_OBJECT_ADDED_IN_SDRAM],
            Self::Sony => &[EventCode::OBJECT_ADDED, EventCode::SONY_OBJECT_ADDED],
        }
    }

    pub fn is_object_added(self, code: EventCode) -> bool {
        self.object_added_codes().contains(&code)
    }
}

impl std::fmt::Display for SessionVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

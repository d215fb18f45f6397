//! New-photo discovery: polling the object list or listening for object-added events.
//!
//! Both strategies feed the same [`SeenHandles`] set, so a photo is announced once per
//! session no matter how many times (or by which path) the device reports it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ObjectHandle;
use crate::container::{Container, ContainerKind};
use crate::error::PtpError;
use crate::variant::SessionVariant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Periodically diff GetObjectHandles against the seen set.
    #[default]
    Polling,
    /// Read object-added events from the interrupt endpoint.
    EventDriven,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polling => write!(f, "polling"),
            Self::EventDriven => write!(f, "event-driven"),
        }
    }
}

/// Handles already announced in this session.
#[derive(Debug, Default)]
pub struct SeenHandles {
    seen: HashSet<ObjectHandle>,
}

impl SeenHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `handle` as seen. Returns true if it wasn't seen before.
    pub fn insert(&mut self, handle: ObjectHandle) -> bool {
        self.seen.insert(handle)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.seen.contains(&handle)
    }

    pub fn extend(&mut self, handles: impl IntoIterator<Item = ObjectHandle>) {
        self.seen.extend(handles);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    /// Returns the handles in `listing` not seen before, in device order, and marks them
    /// seen. Handles that disappeared from the listing are ignored.
    pub fn diff_listing(&mut self, listing: &[u32]) -> Vec<ObjectHandle> {
        listing
            .iter()
            .map(|raw| ObjectHandle(*raw))
            .filter(|handle| self.seen.insert(*handle))
            .collect()
    }
}

/// Extracts the new object's handle from an event container, if the event announces
/// a new object for this variant.
pub fn object_added_handle(variant: SessionVariant, event: &Container) -> Result<Option<ObjectHandle>, PtpError> {
    if event.kind != ContainerKind::Event {
        return Err(PtpError::malformed(format!(
            "expected an event container on the interrupt endpoint, got {:?}",
            event.kind
        )));
    }
    if !variant.is_object_added(event.event_code()) {
        return Ok(None);
    }
    let params = event.params()?;
    match params.first() {
        Some(raw) => Ok(Some(ObjectHandle(*raw))),
        None => Err(PtpError::malformed(format!(
            "{} event without an object handle",
            event.event_code()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{EventCode, ResponseCode};

    #[test]
    fn test_polling_diff_reports_only_new_handles() {
        let mut seen = SeenHandles::new();
        assert_eq!(seen.diff_listing(&[0xA]), vec![ObjectHandle(0xA)]);
        assert_eq!(seen.diff_listing(&[0xA, 0xB]), vec![ObjectHandle(0xB)]);
        assert!(seen.diff_listing(&[0xA, 0xB]).is_empty());
    }

    #[test]
    fn test_removed_handles_are_not_reported() {
        let mut seen = SeenHandles::new();
        seen.diff_listing(&[1, 2, 3]);
        assert!(seen.diff_listing(&[1, 3]).is_empty());
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_duplicates_within_one_listing() {
        let mut seen = SeenHandles::new();
        assert_eq!(seen.diff_listing(&[5, 5, 6]), vec![ObjectHandle(5), ObjectHandle(6)]);
    }

    #[test]
    fn test_known_handles_are_suppressed() {
        let mut seen = SeenHandles::new();
        seen.extend([ObjectHandle(1), ObjectHandle(2)]);
        assert_eq!(seen.diff_listing(&[1, 2, 3]), vec![ObjectHandle(3)]);
        seen.clear();
        assert!(seen.is_empty());
    }

    #[test]
    fn test_sony_vendor_event_yields_handle() {
        let event = Container::event(EventCode::SONY_OBJECT_ADDED, 0, &[0xC]);
        assert_eq!(
            object_added_handle(SessionVariant::Sony, &event).unwrap(),
            Some(ObjectHandle(0xC))
        );
        assert_eq!(object_added_handle(SessionVariant::Baseline, &event).unwrap(), None);
    }

    #[test]
    fn test_unrelated_event_is_ignored() {
        let event = Container::event(EventCode::DEVICE_PROP_CHANGED, 0, &[0x5001]);
        assert_eq!(object_added_handle(SessionVariant::Nikon, &event).unwrap(), None);
    }

    #[test]
    fn test_object_added_without_params_is_malformed() {
        let event = Container::event(EventCode::OBJECT_ADDED, 0, &[]);
        assert!(object_added_handle(SessionVariant::Baseline, &event).is_err());
    }

    #[test]
    fn test_non_event_container_is_malformed() {
        let response = Container::response(ResponseCode::OK, 1, &[]);
        assert!(object_added_handle(SessionVariant::Baseline, &response).is_err());
    }

    #[test]
    fn test_sync_mode_serialization() {
        assert_eq!(serde_json::to_string(&SyncMode::EventDriven).unwrap(), "\"eventDriven\"");
    }
}

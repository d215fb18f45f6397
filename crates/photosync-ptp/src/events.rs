//! Events delivered to the caller.
//!
//! The caller owns the receiving end of an unbounded channel obtained from
//! [`EventDispatcher::subscribe`]. There is one subscriber per session: subscribing
//! again replaces the previous channel, and the old receiver sees end-of-stream. Events
//! emitted while nobody is subscribed are dropped.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use log::trace;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::ObjectHandle;
use crate::error::PtpError;
use crate::ignore_poison::IgnorePoison;
use crate::sync::SyncMode;
use crate::transfer::TransferProgress;

/// Why a session ended up `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
    /// The caller called `close()`.
    User,
    /// The device was unplugged or the host reported it gone.
    Detached,
    /// An unrecoverable error; a `SessionFaulted` event preceded this one.
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TetherEvent {
    /// A new photo was found on the camera and queued for download.
    #[serde(rename_all = "camelCase")]
    ObjectDiscovered { handle: ObjectHandle, mode: SyncMode },
    TransferProgress(TransferProgress),
    #[serde(rename_all = "camelCase")]
    TransferCompleted {
        handle: ObjectHandle,
        path: PathBuf,
        bytes: u64,
        elapsed: Duration,
    },
    #[serde(rename_all = "camelCase")]
    TransferFailed { handle: ObjectHandle, cause: PtpError },
    /// Polling or event reading failed; the session keeps running.
    #[serde(rename_all = "camelCase")]
    DiscoveryFailed { error: PtpError },
    #[serde(rename_all = "camelCase")]
    SyncModeChanged { requested: SyncMode, effective: SyncMode },
    #[serde(rename_all = "camelCase")]
    SessionFaulted { error: PtpError },
    #[serde(rename_all = "camelCase")]
    SessionClosed { reason: CloseReason },
}

pub type EventReceiver = mpsc::UnboundedReceiver<TetherEvent>;

/// Single-slot fan-out to the current subscriber.
#[derive(Default)]
pub struct EventDispatcher {
    sender: Mutex<Option<mpsc::UnboundedSender<TetherEvent>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh receiver, replacing (and closing) any previous one.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock_ignore_poison() = Some(tx);
        rx
    }

    pub fn emit(&self, event: TetherEvent) {
        let mut sender = self.sender.lock_ignore_poison();
        let Some(tx) = sender.as_ref() else {
            trace!("events: no subscriber, dropping {:?}", event);
            return;
        };
        if tx.send(event).is_err() {
            // Receiver dropped; stop trying until someone subscribes again.
            *sender = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_subscriber() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.subscribe();
        dispatcher.emit(TetherEvent::SessionClosed {
            reason: CloseReason::User,
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            TetherEvent::SessionClosed {
                reason: CloseReason::User
            }
        );
    }

    #[test]
    fn test_resubscribe_replaces_previous_channel() {
        let dispatcher = EventDispatcher::new();
        let mut old = dispatcher.subscribe();
        let mut new = dispatcher.subscribe();

        dispatcher.emit(TetherEvent::ObjectDiscovered {
            handle: ObjectHandle(1),
            mode: SyncMode::Polling,
        });

        assert!(matches!(
            old.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(new.try_recv(), Ok(TetherEvent::ObjectDiscovered { .. })));
    }

    #[test]
    fn test_emit_without_subscriber_is_dropped() {
        let dispatcher = EventDispatcher::new();
        dispatcher.emit(TetherEvent::SessionClosed {
            reason: CloseReason::Detached,
        });
        let mut rx = dispatcher.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_clears_slot() {
        let dispatcher = EventDispatcher::new();
        drop(dispatcher.subscribe());
        dispatcher.emit(TetherEvent::SessionClosed {
            reason: CloseReason::User,
        });
        assert!(dispatcher.sender.lock_ignore_poison().is_none());
    }

    #[test]
    fn test_serialization() {
        let event = TetherEvent::SyncModeChanged {
            requested: SyncMode::Polling,
            effective: SyncMode::EventDriven,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"syncModeChanged","requested":"polling","effective":"eventDriven"}"#
        );

        let event = TetherEvent::TransferProgress(TransferProgress {
            handle: ObjectHandle(3),
            total_bytes: 10,
            transferred_bytes: 5,
            percent: 50,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"transferProgress\""), "JSON: {}", json);
        assert!(json.contains("\"transferredBytes\":5"), "JSON: {}", json);
    }
}

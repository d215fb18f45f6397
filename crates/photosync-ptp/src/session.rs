//! Session state machine and the open/close negotiation with the device.
//!
//! ```text
//! Closed ──open()──▶ Opening ──ok──▶ Open ──close()──▶ Closing ──▶ Closed
//!                       └──error──▶ Closed
//! any state ──device gone / event channel lost──▶ Faulted ──close()──▶ Closed
//! ```

use log::{debug, info, warn};
use serde::Serialize;

use crate::SessionId;
use crate::connection::PtpConnection;
use crate::dataset::DeviceInfo;
use crate::error::PtpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
    Faulted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Session IDs are chosen by the host; any non-zero value works. One session per
/// connection, so a constant suffices.
pub(crate) const SESSION_ID: SessionId = SessionId(1);

/// Guards state transitions. Holds the fault reason so `open()` on a faulted session
/// can say why.
#[derive(Debug)]
pub(crate) struct SessionMachine {
    state: SessionState,
    fault: Option<String>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Closed,
            fault: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn faulted_error(&self) -> PtpError {
        PtpError::Faulted {
            reason: self.fault.clone().unwrap_or_else(|| "session faulted".to_string()),
        }
    }

    /// `Closed → Opening`.
    pub fn begin_open(&mut self) -> Result<(), PtpError> {
        match self.state {
            SessionState::Closed => {
                self.state = SessionState::Opening;
                Ok(())
            }
            SessionState::Faulted => Err(self.faulted_error()),
            SessionState::Opening | SessionState::Open | SessionState::Closing => Err(PtpError::SessionAlreadyOpen),
        }
    }

    /// `Opening → Open` on success, `Opening → Closed` on failure.
    pub fn finish_open(&mut self, ok: bool) {
        debug_assert_eq!(self.state, SessionState::Opening);
        self.state = if ok { SessionState::Open } else { SessionState::Closed };
    }

    /// Moves to `Closing`. Returns false if the session is already closed.
    pub fn begin_close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closing;
        true
    }

    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
        self.fault = None;
    }

    /// `Opening`/`Open` → `Faulted`. Returns false if the session is already faulted or
    /// on its way to `Closed`, so the fault is reported once and never races a close.
    pub fn fault(&mut self, reason: String) -> bool {
        if matches!(
            self.state,
            SessionState::Faulted | SessionState::Closed | SessionState::Closing
        ) {
            return false;
        }
        self.state = SessionState::Faulted;
        self.fault = Some(reason);
        true
    }

    /// Sync mode may change before or while the session is open.
    pub fn check_sync_mode_allowed(&self) -> Result<(), PtpError> {
        match self.state {
            SessionState::Closed | SessionState::Opening | SessionState::Open => Ok(()),
            SessionState::Faulted => Err(self.faulted_error()),
            SessionState::Closing => Err(PtpError::SessionNotOpen),
        }
    }

    pub fn check_open(&self) -> Result<(), PtpError> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Faulted => Err(self.faulted_error()),
            _ => Err(PtpError::SessionNotOpen),
        }
    }

    pub fn check_clear_status_allowed(&self) -> Result<(), PtpError> {
        if self.state == SessionState::Faulted {
            return Err(self.faulted_error());
        }
        Ok(())
    }
}

/// Opens a PTP session on a fresh connection: clear status, GetDeviceInfo, OpenSession.
///
/// A device that still has a session from a previous run answers SessionAlreadyOpen;
/// that stale session is closed and OpenSession retried once.
pub(crate) fn negotiate(conn: &mut PtpConnection) -> Result<DeviceInfo, PtpError> {
    if let Err(e) = conn.clear_status() {
        // Not fatal: some devices don't implement the status request.
        warn!("{}: clear status before open failed: {}", conn.label(), e);
    }

    let info = conn.get_device_info()?;
    debug!(
        "{}: {} {} (PTP {}.{:02}, vendor ext 0x{:08x} {:?})",
        conn.label(),
        info.manufacturer,
        info.model,
        info.standard_version / 100,
        info.standard_version % 100,
        info.vendor_extension_id,
        info.vendor_extension_desc
    );

    match conn.open_session(SESSION_ID.0) {
        Ok(()) => {}
        Err(PtpError::SessionAlreadyOpen) => {
            info!("{}: device has a stale session, closing it and retrying", conn.label());
            // The stale session is closed under our session ID; the device only cares
            // that a CloseSession arrives inside some session.
            conn.open_session_assumed();
            if let Err(e) = conn.close_session() {
                debug!("{}: closing stale session failed: {}", conn.label(), e);
            }
            conn.open_session(SESSION_ID.0)?;
        }
        Err(e) => return Err(e),
    }

    info!("{}: session {} open", conn.label(), SESSION_ID.0);
    Ok(info)
}

/// Best-effort CloseSession. Errors are logged, never returned.
pub(crate) fn teardown(conn: &mut PtpConnection) {
    if let Err(e) = conn.close_session() {
        debug!("{}: CloseSession during teardown failed: {}", conn.label(), e);
    } else {
        info!("{}: session closed", conn.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_cycle() {
        let mut machine = SessionMachine::new();
        assert_eq!(machine.state(), SessionState::Closed);
        machine.begin_open().unwrap();
        assert_eq!(machine.state(), SessionState::Opening);
        machine.finish_open(true);
        assert_eq!(machine.state(), SessionState::Open);
        assert!(machine.begin_close());
        assert_eq!(machine.state(), SessionState::Closing);
        machine.finish_close();
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_second_open_is_an_error() {
        let mut machine = SessionMachine::new();
        machine.begin_open().unwrap();
        machine.finish_open(true);
        assert_eq!(machine.begin_open(), Err(PtpError::SessionAlreadyOpen));
        assert_eq!(machine.state(), SessionState::Open);
    }

    #[test]
    fn test_failed_open_falls_back_to_closed() {
        let mut machine = SessionMachine::new();
        machine.begin_open().unwrap();
        machine.finish_open(false);
        assert_eq!(machine.state(), SessionState::Closed);
        assert!(machine.begin_open().is_ok());
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let mut machine = SessionMachine::new();
        assert!(!machine.begin_close());
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_faulted_blocks_everything_but_close() {
        let mut machine = SessionMachine::new();
        machine.begin_open().unwrap();
        machine.finish_open(true);
        assert!(machine.fault("event channel lost".to_string()));
        assert!(!machine.fault("again".to_string()));

        assert!(matches!(machine.begin_open(), Err(PtpError::Faulted { reason }) if reason == "event channel lost"));
        assert!(machine.check_open().is_err());
        assert!(machine.check_sync_mode_allowed().is_err());
        assert!(machine.check_clear_status_allowed().is_err());

        assert!(machine.begin_close());
        machine.finish_close();
        assert_eq!(machine.state(), SessionState::Closed);
        assert!(machine.check_clear_status_allowed().is_ok());
    }

    #[test]
    fn test_queries_require_open() {
        let machine = SessionMachine::new();
        assert_eq!(machine.check_open(), Err(PtpError::SessionNotOpen));
        assert!(machine.check_sync_mode_allowed().is_ok());
    }
}

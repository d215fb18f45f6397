//! The session handle the caller holds.
//!
//! A [`CameraSession`] is bound to one device. It is cheap to clone; clones share the
//! same session. Public operations may be called from any thread: state transitions
//! are serialized by a session-scoped control mutex, and everything that talks to the
//! device while the session is open goes through the connection slot, which the
//! background worker also uses.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::ObjectHandle;
use crate::codes::OperationCode;
use crate::config::TetherConfig;
use crate::connection::PtpConnection;
use crate::dataset::{DeviceInfo, ObjectInfo};
use crate::device::DeviceDescriptor;
use crate::error::PtpError;
use crate::events::{CloseReason, EventDispatcher, EventReceiver, TetherEvent};
use crate::ignore_poison::IgnorePoison;
use crate::session::{self, SessionMachine, SessionState};
use crate::sync::SyncMode;
use crate::transfer::{ObjectSource, TransferOutcome};
use crate::transport::TransportFactory;
use crate::variant::SessionVariant;
use crate::worker::{self, WorkerCommand, WorkerHandle};

/// CloseSession during teardown never waits longer than this.
pub(crate) const CLOSE_SESSION_TIMEOUT: Duration = Duration::from_millis(500);
const WORKER_JOIN_POLL: Duration = Duration::from_millis(5);
const LINK_LOCK_POLL: Duration = Duration::from_millis(2);

/// The open connection, tagged with the worker generation it belongs to.
pub(crate) struct Link {
    pub generation: u64,
    pub conn: PtpConnection,
}

/// State shared between the handle and its worker.
pub(crate) struct Shared {
    pub descriptor: DeviceDescriptor,
    pub variant: SessionVariant,
    pub config: TetherConfig,
    pub factory: Arc<dyn TransportFactory>,
    pub machine: Mutex<SessionMachine>,
    /// The open connection. `None` while closed, unless a timed-out close left it to
    /// its worker.
    pub link: Mutex<Option<Link>>,
    /// Bumped when a close gives up waiting for its worker. A worker from an older
    /// generation must not touch the session state or a newer connection.
    pub generation: AtomicU64,
    pub dispatcher: EventDispatcher,
    pub requested_mode: Mutex<SyncMode>,
    /// Seeds the seen set of the next session.
    pub known_handles: Mutex<Vec<ObjectHandle>>,
    pub device_info: Mutex<Option<DeviceInfo>>,
    /// Worker threads alive right now, including any a timed-out close left behind.
    pub running_workers: AtomicUsize,
}

impl Shared {
    pub fn label(&self) -> String {
        format!("{} ({})", self.descriptor.display_name(), self.descriptor.location)
    }

    pub fn effective_mode(&self) -> SyncMode {
        self.variant.effective_sync_mode(*self.requested_mode.lock_ignore_poison())
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Runs `f` on the connection if the slot still holds the one of `generation`.
    pub fn with_link<T>(&self, generation: u64, f: impl FnOnce(&mut PtpConnection) -> T) -> Option<T> {
        let mut slot = self.link.lock_ignore_poison();
        match slot.as_mut() {
            Some(link) if link.generation == generation => Some(f(&mut link.conn)),
            _ => None,
        }
    }

    /// Takes the connection of `generation` out of the slot. Leaves any other alone.
    pub fn take_link_of(&self, generation: u64) -> Option<PtpConnection> {
        let mut slot = self.link.lock_ignore_poison();
        if slot.as_ref().is_some_and(|link| link.generation == generation) {
            slot.take().map(|link| link.conn)
        } else {
            None
        }
    }
}

struct Control {
    worker: Option<WorkerHandle>,
}

/// Handle to a camera session. Obtain one from
/// [`CapabilityResolver::resolve`](crate::CapabilityResolver::resolve).
#[derive(Clone)]
pub struct CameraSession {
    shared: Arc<Shared>,
    control: Arc<Mutex<Control>>,
}

impl CameraSession {
    pub(crate) fn new(
        descriptor: DeviceDescriptor,
        variant: SessionVariant,
        factory: Arc<dyn TransportFactory>,
        config: TetherConfig,
    ) -> Self {
        let requested_mode = config.sync_mode;
        Self {
            shared: Arc::new(Shared {
                descriptor,
                variant,
                config,
                factory,
                machine: Mutex::new(SessionMachine::new()),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                dispatcher: EventDispatcher::new(),
                requested_mode: Mutex::new(requested_mode),
                known_handles: Mutex::new(Vec::new()),
                device_info: Mutex::new(None),
                running_workers: AtomicUsize::new(0),
            }),
            control: Arc::new(Mutex::new(Control { worker: None })),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn state(&self) -> SessionState {
        self.shared.machine.lock_ignore_poison().state()
    }

    pub fn variant(&self) -> SessionVariant {
        self.shared.variant
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    pub fn config(&self) -> &TetherConfig {
        &self.shared.config
    }

    /// The mode discovery runs in, after the variant had its say.
    pub fn sync_mode(&self) -> SyncMode {
        self.shared.effective_mode()
    }

    /// DeviceInfo read during `open()`. `None` while closed.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.device_info.lock_ignore_poison().clone()
    }

    pub fn is_worker_running(&self) -> bool {
        self.shared.running_workers.load(Ordering::SeqCst) > 0
    }

    /// Returns a fresh event receiver. Replaces the previous subscriber, whose receiver
    /// then reports end-of-stream.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.dispatcher.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Device status / clear-stall request. Allowed in any state except `Faulted`;
    /// opens the transport just for this call when the session is closed.
    pub fn clear_status(&self) -> Result<(), PtpError> {
        let _control = self.control.lock_ignore_poison();
        self.shared.machine.lock_ignore_poison().check_clear_status_allowed()?;

        let mut link = self.shared.link.lock_ignore_poison();
        if let Some(link) = link.as_mut() {
            return link.conn.clear_status();
        }
        drop(link);

        let mut conn = self.connect()?;
        conn.clear_status()
    }

    /// `Closed → Opening → Open`, then starts the worker.
    pub fn open(&self) -> Result<(), PtpError> {
        let mut control = self.control.lock_ignore_poison();
        self.shared.machine.lock_ignore_poison().begin_open()?;
        let label = self.shared.label();
        info!("{}: opening {} session", label, self.shared.variant);

        if let Some(old) = control.worker.take() {
            old.reap();
        }

        // A close that timed out may have left its connection behind. Close that device
        // session first so the interface is free to claim again.
        match self.take_link(Instant::now() + self.shared.config.close_timeout()) {
            Ok(Some(mut stale)) => {
                debug!("{}: closing a session left over from a timed-out close", label);
                stale.conn.set_timeout(CLOSE_SESSION_TIMEOUT);
                session::teardown(&mut stale.conn);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{}: previous session is still busy", label);
                self.shared.machine.lock_ignore_poison().finish_open(false);
                return Err(e);
            }
        }

        let (conn, info) = match self.connect().and_then(|mut conn| {
            let info = session::negotiate(&mut conn)?;
            Ok((conn, info))
        }) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("{}: open failed: {}", label, e);
                self.shared.machine.lock_ignore_poison().finish_open(false);
                return Err(e);
            }
        };

        *self.shared.device_info.lock_ignore_poison() = Some(info);
        self.shared.machine.lock_ignore_poison().finish_open(true);

        let seeds = self.shared.known_handles.lock_ignore_poison().clone();
        let has_events = conn.has_event_channel();
        // The worker must find the connection in the slot when it starts.
        let generation = self.shared.generation.load(Ordering::SeqCst);
        *self.shared.link.lock_ignore_poison() = Some(Link { generation, conn });

        match worker::spawn(Arc::clone(&self.shared), generation, seeds) {
            Ok(handle) => {
                control.worker = Some(handle);
                debug!("{}: worker started (event channel: {})", label, has_events);
                Ok(())
            }
            Err(e) => {
                warn!("{}: couldn't start worker: {}", label, e);
                if let Some(mut link) = self.shared.link.lock_ignore_poison().take() {
                    session::teardown(&mut link.conn);
                }
                *self.shared.device_info.lock_ignore_poison() = None;
                let mut machine = self.shared.machine.lock_ignore_poison();
                machine.begin_close();
                machine.finish_close();
                Err(PtpError::Faulted {
                    reason: format!("couldn't start session worker: {e}"),
                })
            }
        }
    }

    /// Closes the session from any state. Always ends in `Closed`; teardown errors are
    /// logged and swallowed. A no-op on a closed session.
    pub fn close(&self) {
        self.close_with(CloseReason::User);
    }

    /// The host reports the device is gone. Equivalent to a forced close.
    pub fn notify_detached(&self) {
        info!("{}: device detached", self.shared.label());
        self.close_with(CloseReason::Detached);
    }

    fn close_with(&self, reason: CloseReason) {
        let mut control = self.control.lock_ignore_poison();
        if !self.shared.machine.lock_ignore_poison().begin_close() {
            debug!("{}: close on a closed session", self.shared.label());
            return;
        }
        let label = self.shared.label();
        let deadline = Instant::now() + self.shared.config.close_timeout();

        if let Some(worker) = control.worker.take() {
            worker.cancel();
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(WORKER_JOIN_POLL);
            }
            if worker.is_finished() {
                worker.reap();
            } else {
                warn!(
                    "{}: worker didn't stop within {:?}, leaving it behind",
                    label,
                    self.shared.config.close_timeout()
                );
                // The worker closes the connection itself if it still holds it on exit.
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
            }
        }

        match self.take_link(deadline) {
            Ok(Some(mut link)) => {
                if reason != CloseReason::Detached {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    link.conn.set_timeout(remaining.clamp(Duration::from_millis(10), CLOSE_SESSION_TIMEOUT));
                    session::teardown(&mut link.conn);
                }
            }
            Ok(None) => debug!("{}: no connection to tear down", label),
            Err(_) => warn!("{}: connection still busy at close deadline, left to the worker", label),
        }

        *self.shared.device_info.lock_ignore_poison() = None;
        self.shared.machine.lock_ignore_poison().finish_close();
        info!("{}: session closed ({:?})", label, reason);
        self.shared.dispatcher.emit(TetherEvent::SessionClosed { reason });
    }

    /// Takes the connection out of the slot, waiting for the worker to let go of it
    /// until `deadline`. `DeviceBusy` if it never does.
    fn take_link(&self, deadline: Instant) -> Result<Option<Link>, PtpError> {
        loop {
            if let Some(mut link) = self.shared.link.try_lock_ignore_poison() {
                return Ok(link.take());
            }
            if Instant::now() >= deadline {
                return Err(PtpError::DeviceBusy);
            }
            thread::sleep(LINK_LOCK_POLL);
        }
    }

    fn connect(&self) -> Result<PtpConnection, PtpError> {
        let transport = self.shared.factory.open(&self.shared.descriptor)?;
        Ok(PtpConnection::new(
            transport,
            self.shared.label(),
            self.shared.config.operation_timeout(),
            self.shared.config.chunk_size,
        ))
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Selects the discovery strategy. Allowed before or while the session is open.
    /// Returns the mode that will actually run: event-only cameras turn `Polling` into
    /// `EventDriven` without an error.
    pub fn set_sync_mode(&self, mode: SyncMode) -> Result<SyncMode, PtpError> {
        let control = self.control.lock_ignore_poison();
        self.shared.machine.lock_ignore_poison().check_sync_mode_allowed()?;

        *self.shared.requested_mode.lock_ignore_poison() = mode;
        let effective = self.shared.variant.effective_sync_mode(mode);
        if effective != mode {
            info!(
                "{}: {} cameras don't support {} sync, using {}",
                self.shared.label(),
                self.shared.variant,
                mode,
                effective
            );
        }

        if let Some(worker) = control.worker.as_ref() {
            worker.send(WorkerCommand::SetSyncMode(mode));
        }
        Ok(effective)
    }

    /// Handles to treat as already synced in the next session, typically the list a
    /// catalog persisted for this device. Takes effect at the next `open()`.
    pub fn set_known_handles(&self, handles: impl IntoIterator<Item = ObjectHandle>) {
        *self.shared.known_handles.lock_ignore_poison() = handles.into_iter().collect();
    }

    // ========================================================================
    // Device queries and transfers
    // ========================================================================

    /// All object handles on the device.
    pub fn object_handles(&self) -> Result<Vec<ObjectHandle>, PtpError> {
        let handles = self.with_link(|conn| conn.object_handles())?;
        Ok(handles.into_iter().map(ObjectHandle).collect())
    }

    pub fn object_info(&self, handle: ObjectHandle) -> Result<ObjectInfo, PtpError> {
        self.with_link(|conn| conn.object_info(handle))
    }

    fn with_link<T>(&self, f: impl FnOnce(&mut PtpConnection) -> Result<T, PtpError>) -> Result<T, PtpError> {
        self.shared.machine.lock_ignore_poison().check_open()?;
        let mut link = self.shared.link.lock_ignore_poison();
        let link = link.as_mut().ok_or(PtpError::SessionNotOpen)?;
        f(&mut link.conn)
    }

    /// Downloads `handle` into the configured directory and waits for the outcome.
    /// The request joins the worker's FIFO queue behind discovered photos.
    pub fn download(&self, handle: ObjectHandle) -> Result<TransferOutcome, PtpError> {
        let (reply, outcome) = mpsc::channel();
        self.enqueue(handle, Some(reply))?;
        outcome.recv().map_err(|_| PtpError::Cancelled)
    }

    /// Queues a download without waiting. The outcome arrives as an event.
    pub fn request_download(&self, handle: ObjectHandle) -> Result<(), PtpError> {
        self.enqueue(handle, None)
    }

    fn enqueue(&self, handle: ObjectHandle, reply: Option<mpsc::Sender<TransferOutcome>>) -> Result<(), PtpError> {
        let control = self.control.lock_ignore_poison();
        self.shared.machine.lock_ignore_poison().check_open()?;
        // An empty operation list means the device didn't say.
        if let Some(info) = self.shared.device_info.lock_ignore_poison().as_ref()
            && !info.operations_supported.is_empty()
            && !info.supports_operation(OperationCode::GET_OBJECT)
        {
            return Err(PtpError::OperationUnsupported {
                operation: OperationCode::GET_OBJECT.0,
            });
        }
        let worker = control.worker.as_ref().ok_or(PtpError::SessionNotOpen)?;
        if worker.send(WorkerCommand::Download { handle, reply }) {
            Ok(())
        } else {
            Err(PtpError::SessionNotOpen)
        }
    }
}

//! Background worker, one per open session.
//!
//! The worker owns discovery (polling or event reading) and runs every transfer from
//! a single FIFO queue, so downloads never overlap on the wire. Commands from the
//! session handle arrive on a channel; a polling wait doubles as the command wait, so
//! `Stop` and new downloads are picked up without sleeping out the interval.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::ObjectHandle;
use crate::camera::{CLOSE_SESSION_TIMEOUT, Shared};
use crate::error::PtpError;
use crate::events::{CloseReason, TetherEvent};
use crate::ignore_poison::IgnorePoison;
use crate::session::{self, SessionState};
use crate::sync::{self, SeenHandles, SyncMode};
use crate::transfer::{self, TransferOutcome};

pub(crate) enum WorkerCommand {
    /// Queue a download. `reply` receives the outcome for synchronous callers.
    Download {
        handle: ObjectHandle,
        reply: Option<mpsc::Sender<TransferOutcome>>,
    },
    SetSyncMode(SyncMode),
    Stop,
}

pub(crate) struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    cancelled: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Returns false if the worker has already exited.
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Aborts the in-flight transfer at the next chunk and asks the worker to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.commands.send(WorkerCommand::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Joins a finished worker. Logs instead of propagating a worker panic.
    pub fn reap(self) {
        if !self.thread.is_finished() {
            return;
        }
        let name = self.thread.thread().name().unwrap_or("session worker").to_string();
        if self.thread.join().is_err() {
            error!("{} panicked", name);
        }
    }
}

/// Starts the worker for a freshly opened session. The connection of `generation` must
/// already be in the shared slot.
pub(crate) fn spawn(shared: Arc<Shared>, generation: u64, seeds: Vec<ObjectHandle>) -> io::Result<WorkerHandle> {
    let (commands, receiver) = mpsc::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let name = format!("photosync-{}", shared.descriptor.location);

    let mut seen = SeenHandles::new();
    seen.extend(seeds);
    let requested = *shared.requested_mode.lock_ignore_poison();
    let worker = Worker {
        requested,
        mode: shared.effective_mode(),
        shared,
        generation,
        commands: receiver,
        cancelled: Arc::clone(&cancelled),
        seen,
        queue: VecDeque::new(),
        next_poll: Instant::now(),
    };

    worker.shared.running_workers.fetch_add(1, Ordering::SeqCst);
    let running = RunningGuard(Arc::clone(&worker.shared));
    let thread = thread::Builder::new().name(name).spawn(move || {
        let _running = running;
        worker.run();
    });
    // On spawn failure the closure (and its guard) is dropped, undoing the count.
    let thread = thread?;

    Ok(WorkerHandle {
        commands,
        cancelled,
        thread,
    })
}

/// Decrements the running-worker count when the thread exits, panics included.
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Job {
    handle: ObjectHandle,
    reply: Option<mpsc::Sender<TransferOutcome>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Worker {
    shared: Arc<Shared>,
    generation: u64,
    commands: mpsc::Receiver<WorkerCommand>,
    cancelled: Arc<AtomicBool>,
    requested: SyncMode,
    mode: SyncMode,
    seen: SeenHandles,
    queue: VecDeque<Job>,
    next_poll: Instant,
}

impl Worker {
    fn run(mut self) {
        let label = self.shared.label();
        info!("{}: worker started in {} mode", label, self.mode);
        self.shared.dispatcher.emit(TetherEvent::SyncModeChanged {
            requested: self.requested,
            effective: self.mode,
        });

        if self.shared.config.skip_existing {
            self.mark_existing_seen();
        }

        loop {
            if self.cancelled.load(Ordering::SeqCst) || self.step() == Flow::Stop {
                break;
            }
        }

        self.fail_pending();
        self.release_retired_link();
        info!("{}: worker stopped", label);
    }

    fn step(&mut self) -> Flow {
        // Commands first, so a Stop never waits behind the queue.
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if self.handle_command(command) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return self.orphaned(),
            }
        }

        if let Some(job) = self.queue.pop_front() {
            return self.transfer(job);
        }

        match self.mode {
            SyncMode::Polling => self.poll_step(),
            SyncMode::EventDriven => self.event_step(),
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) -> Flow {
        match command {
            WorkerCommand::Download { handle, reply } => {
                self.queue.push_back(Job { handle, reply });
                Flow::Continue
            }
            WorkerCommand::SetSyncMode(requested) => {
                self.requested = requested;
                let effective = self.shared.variant.effective_sync_mode(requested);
                if effective != self.mode {
                    info!(
                        "{}: switching sync from {} to {}",
                        self.shared.label(),
                        self.mode,
                        effective
                    );
                    self.mode = effective;
                    self.next_poll = Instant::now();
                }
                self.shared.dispatcher.emit(TetherEvent::SyncModeChanged { requested, effective });
                Flow::Continue
            }
            WorkerCommand::Stop => Flow::Stop,
        }
    }

    /// Every handle of the session was dropped without `close()`. Close the session
    /// on the device and exit.
    fn orphaned(&mut self) -> Flow {
        info!("{}: session handle dropped, closing", self.shared.label());
        if let Some(mut conn) = self.shared.take_link_of(self.generation) {
            session::teardown(&mut conn);
        }
        let mut machine = self.shared.machine.lock_ignore_poison();
        if machine.begin_close() {
            machine.finish_close();
        }
        Flow::Stop
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    fn poll_step(&mut self) -> Flow {
        let now = Instant::now();
        if now < self.next_poll {
            return match self.commands.recv_timeout(self.next_poll - now) {
                Ok(command) => self.handle_command(command),
                Err(mpsc::RecvTimeoutError::Timeout) => Flow::Continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => self.orphaned(),
            };
        }
        self.next_poll = now + self.shared.config.poll_interval();

        let Some(listing) = self.shared.with_link(self.generation, |conn| conn.object_handles()) else {
            return Flow::Stop;
        };

        match listing {
            Ok(listing) => {
                for handle in self.seen.diff_listing(&listing) {
                    self.discovered(handle);
                }
                Flow::Continue
            }
            Err(e) if e.is_device_gone() => self.device_gone(e),
            Err(e) => {
                warn!("{}: polling failed: {}", self.shared.label(), e);
                self.shared.dispatcher.emit(TetherEvent::DiscoveryFailed { error: e });
                Flow::Continue
            }
        }
    }

    fn event_step(&mut self) -> Flow {
        let wait = self.shared.config.event_wait();
        let read = self.shared.with_link(self.generation, |conn| {
            conn.has_event_channel().then(|| conn.read_event(wait))
        });
        let read = match read {
            None => return Flow::Stop,
            Some(None) => return self.event_channel_lost("the device has no event endpoint".to_string()),
            Some(Some(read)) => read,
        };

        match read {
            Ok(None) => Flow::Continue,
            Ok(Some(event)) => {
                match sync::object_added_handle(self.shared.variant, &event) {
                    Ok(Some(handle)) => {
                        if self.seen.insert(handle) {
                            self.discovered(handle);
                        } else {
                            debug!("{}: duplicate object-added for {}", self.shared.label(), handle);
                        }
                    }
                    Ok(None) => debug!("{}: ignoring event {}", self.shared.label(), event.event_code()),
                    Err(e) => self.shared.dispatcher.emit(TetherEvent::DiscoveryFailed { error: e }),
                }
                Flow::Continue
            }
            Err(e) if e.is_device_gone() => self.device_gone(e),
            Err(PtpError::TransportTimeout) => Flow::Continue,
            Err(e @ PtpError::MalformedResponse { .. }) => {
                self.shared.dispatcher.emit(TetherEvent::DiscoveryFailed { error: e });
                Flow::Continue
            }
            Err(e) => self.event_channel_lost(format!("event channel failed: {e}")),
        }
    }

    fn discovered(&mut self, handle: ObjectHandle) {
        debug!("{}: discovered {} ({})", self.shared.label(), handle, self.mode);
        self.shared.dispatcher.emit(TetherEvent::ObjectDiscovered {
            handle,
            mode: self.mode,
        });
        self.queue.push_back(Job { handle, reply: None });
    }

    /// Marks everything already on the card as seen without announcing it.
    fn mark_existing_seen(&mut self) {
        let Some(listing) = self.shared.with_link(self.generation, |conn| conn.object_handles()) else {
            return;
        };
        match listing {
            Ok(listing) => {
                let skipped = self.seen.diff_listing(&listing).len();
                info!("{}: skipping {} photo(s) already on the card", self.shared.label(), skipped);
            }
            Err(e) => warn!("{}: couldn't list existing photos: {}", self.shared.label(), e),
        }
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    fn transfer(&mut self, job: Job) -> Flow {
        let dest_dir = self.shared.config.download_dir.clone();
        let dispatcher = &self.shared.dispatcher;
        let cancelled = &self.cancelled;
        let outcome = self
            .shared
            .with_link(self.generation, |conn| {
                transfer::download(conn, job.handle, &dest_dir, cancelled, &mut |progress| {
                    dispatcher.emit(TetherEvent::TransferProgress(progress))
                })
            })
            .unwrap_or(TransferOutcome::Failed {
                handle: job.handle,
                cause: PtpError::SessionNotOpen,
            });
        self.seen.insert(job.handle);

        let handle = outcome.handle();
        let mut gone = None;
        match &outcome {
            TransferOutcome::Completed {
                path, bytes, elapsed, ..
            } => dispatcher.emit(TetherEvent::TransferCompleted {
                handle,
                path: path.clone(),
                bytes: *bytes,
                elapsed: *elapsed,
            }),
            TransferOutcome::Failed { cause, .. } => {
                if cause.is_device_gone() {
                    gone = Some(cause.clone());
                }
                dispatcher.emit(TetherEvent::TransferFailed {
                    handle,
                    cause: cause.clone(),
                });
            }
            TransferOutcome::Skipped { reason, .. } => {
                debug!("{}: skipped {}: {}", self.shared.label(), handle, reason)
            }
        }

        if let Some(reply) = job.reply {
            let _ = reply.send(outcome);
        }
        match gone {
            Some(cause) => self.device_gone(cause),
            None => Flow::Continue,
        }
    }

    /// A close that gave up waiting for this worker leaves the connection behind. Close
    /// the device session and release the interface so the next open can claim it.
    fn release_retired_link(&mut self) {
        if self.shared.is_current(self.generation) {
            return;
        }
        if let Some(mut conn) = self.shared.take_link_of(self.generation) {
            info!("{}: closing the session a timed-out close left behind", self.shared.label());
            conn.set_timeout(CLOSE_SESSION_TIMEOUT);
            session::teardown(&mut conn);
        }
    }

    /// Answers every queued synchronous download with `Cancelled`.
    fn fail_pending(&mut self) {
        let mut pending: Vec<Job> = self.queue.drain(..).collect();
        while let Ok(command) = self.commands.try_recv() {
            if let WorkerCommand::Download { handle, reply } = command {
                pending.push(Job { handle, reply });
            }
        }
        for job in pending {
            if let Some(reply) = job.reply {
                let _ = reply.send(TransferOutcome::Failed {
                    handle: job.handle,
                    cause: PtpError::Cancelled,
                });
            }
        }
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// The device is gone: `Faulted`, then `Closed`, and the worker stops.
    fn device_gone(&mut self, error: PtpError) -> Flow {
        let label = self.shared.label();
        if !self.fault(error.to_string()) {
            // A close is already under way and will finish the job.
            return Flow::Stop;
        }
        warn!("{}: device gone: {}", label, error);
        self.shared.dispatcher.emit(TetherEvent::SessionFaulted { error });

        drop(self.shared.take_link_of(self.generation));
        *self.shared.device_info.lock_ignore_poison() = None;

        let mut machine = self.shared.machine.lock_ignore_poison();
        if machine.state() == SessionState::Faulted && machine.begin_close() {
            machine.finish_close();
            drop(machine);
            info!("{}: session closed (detached)", label);
            self.shared.dispatcher.emit(TetherEvent::SessionClosed {
                reason: CloseReason::Detached,
            });
        }
        Flow::Stop
    }

    /// Faults the session unless it is closing, or this worker was left behind by a
    /// close and the session may since have been reopened.
    fn fault(&self, reason: String) -> bool {
        let mut machine = self.shared.machine.lock_ignore_poison();
        self.shared.is_current(self.generation) && machine.fault(reason)
    }

    /// Event-driven sync without a working event channel can't discover anything, and
    /// polling is not a safe substitute on event-only cameras. The session stays
    /// `Faulted` until the caller closes it.
    fn event_channel_lost(&mut self, reason: String) -> Flow {
        if !self.fault(reason.clone()) {
            return Flow::Stop;
        }
        error!("{}: {}", self.shared.label(), reason);
        self.shared.dispatcher.emit(TetherEvent::SessionFaulted {
            error: PtpError::Faulted { reason },
        });
        Flow::Stop
    }
}

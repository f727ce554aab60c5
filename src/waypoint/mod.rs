//! Tree waypoint
//!
//! A [`TreeWaypoint`] is one participant's view of the overlay: it knows its
//! place in the tree, sends to its parent or children without blocking, and
//! hands inbound messages to registered [`ReceiveHandler`]s.
//!
//! All progress happens on poll turns. [`TreeWaypoint::start`] posts the
//! first turn to a [`Scheduler`] and every turn reposts itself, so whichever
//! thread drives the scheduler becomes the designated polling thread.
//! Submissions may come from any thread; they only hold the submission lock
//! long enough to append. The in-flight ledger has its own lock, taken by the
//! polling thread for the test pass, so submitters never wait on transport
//! tests. Callbacks and handlers always run on the polling thread with no
//! lock held, so they may submit further sends.

pub mod broadcast;
mod ledger;
mod stats;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::topology::{Rank, Topology};
use crate::transport::{CompletedRequest, Payload, Transport, CHANNEL_TAG};

use self::broadcast::SentCallback;
use self::ledger::{Continuation, Ledger, PendingOperation, ReadyOperation};
use self::stats::Counters;

pub use self::stats::WaypointStats;

/// More than this many operations in flight after a turn triggers an advisory
pub const BACKLOG_HIGH_WATER: usize = 100;

/// Receive buffer capacity used until [`TreeWaypoint::set_buffer_size`]
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Consumer of inbound overlay messages.
///
/// The byte slice is only valid for the duration of the call.
pub trait ReceiveHandler: Send + Sync {
    /// A message from this participant's parent (or, on the root, from itself)
    fn received_from_parent(&self, data: &[u8]);

    /// A message from any other participant, normally a child
    fn received_from_child(&self, data: &[u8], sender: Rank);
}

/// What one poll turn did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Operations dispatched this turn
    pub dispatched: usize,

    /// Operations still in flight after the turn
    pub in_flight: usize,

    /// Whether the backlog advisory fired
    pub backlog: bool,
}

struct ReceiveState {
    /// Capacity for the next armed receive
    capacity: usize,
    /// Whether a receive is outstanding
    armed: bool,
}

struct Shared {
    submitted: Vec<PendingOperation>,
    handlers: Vec<Arc<dyn ReceiveHandler>>,
    receive: ReceiveState,
    poll_thread: Option<ThreadId>,
}

/// Ledger size as of the last change, readable without the ledger lock
#[derive(Default)]
struct LedgerGauge {
    operations: AtomicUsize,
    receives: AtomicUsize,
}

impl LedgerGauge {
    fn publish(&self, ledger: &Ledger) {
        self.operations.store(ledger.len(), Ordering::Relaxed);
        self.receives.store(ledger.receives(), Ordering::Relaxed);
    }
}

/// One participant in the tree overlay
///
/// Lock order: `ledger` before `shared`.
pub struct TreeWaypoint {
    topology: Topology,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    shared: Mutex<Shared>,
    ledger: Mutex<Ledger>,
    gauge: LedgerGauge,
    counters: Counters,
    shutdown: AtomicBool,
}

impl TreeWaypoint {
    /// Create a waypoint over `transport` and post its first poll turn.
    ///
    /// No receive is armed until [`set_buffer_size`](Self::set_buffer_size).
    pub fn start(transport: Arc<dyn Transport>, scheduler: Arc<dyn Scheduler>) -> Result<Arc<Self>> {
        let rank = transport.rank();
        let world_size = transport.world_size();
        let topology = Topology::new(rank, world_size).ok_or(Error::InvalidRank { rank, world_size })?;

        debug!(
            rank,
            world_size,
            transport = transport.name(),
            parent = topology.parent(),
            children = ?topology.children(),
            "Waypoint starting"
        );

        let waypoint = Arc::new(Self {
            topology,
            transport,
            scheduler,
            shared: Mutex::new(Shared {
                submitted: Vec::new(),
                handlers: Vec::new(),
                receive: ReceiveState {
                    capacity: DEFAULT_BUFFER_SIZE,
                    armed: false,
                },
                poll_thread: None,
            }),
            ledger: Mutex::new(Ledger::default()),
            gauge: LedgerGauge::default(),
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
        });

        waypoint.schedule_poll();
        Ok(waypoint)
    }

    // ─────────────────────────────────────────────────────────────
    // Identity & Topology
    // ─────────────────────────────────────────────────────────────

    /// This participant's rank
    pub fn id(&self) -> Rank {
        self.topology.rank()
    }

    pub fn total_participants(&self) -> usize {
        self.topology.world_size()
    }

    /// Parent rank. The root is its own parent.
    pub fn parent(&self) -> Rank {
        self.topology.parent()
    }

    pub fn children(&self) -> Vec<Rank> {
        self.topology.children()
    }

    pub fn is_root(&self) -> bool {
        self.topology.is_root()
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    // ─────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────

    /// Send `payload` to the parent.
    ///
    /// Returns immediately; `callback` runs on a later poll turn with the
    /// transport's verdict. On the root this addresses the root itself and
    /// the message arrives through `received_from_parent`.
    pub fn send_to_parent<F>(&self, payload: impl Into<Payload>, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if self.is_root() {
            debug!(rank = self.id(), "Root sending to its own parent slot");
        }
        self.submit_send(self.parent(), payload.into(), Box::new(callback));
    }

    /// Send `payload` to every child.
    ///
    /// `callback` runs once, after all child sends complete, with `true`
    /// only if all of them succeeded. A leaf has no children and its
    /// callback runs before this returns, with `true`.
    pub fn send_to_children<F>(&self, payload: impl Into<Payload>, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let payload = payload.into();
        let children = self.children();
        let parts = broadcast::join(children.len(), Box::new(callback));

        for (child, part) in children.into_iter().zip(parts) {
            self.submit_send(child, Arc::clone(&payload), part);
        }
    }

    /// [`send_to_parent`](Self::send_to_parent) with a receipt instead of a callback
    pub fn send_to_parent_with_receipt(&self, payload: impl Into<Payload>) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.send_to_parent(payload, move |ok| {
            let _ = tx.send(ok);
        });
        rx
    }

    /// [`send_to_children`](Self::send_to_children) with a receipt instead of a callback
    pub fn send_to_children_with_receipt(&self, payload: impl Into<Payload>) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.send_to_children(payload, move |ok| {
            let _ = tx.send(ok);
        });
        rx
    }

    fn submit_send(&self, dest: Rank, payload: Payload, callback: SentCallback) {
        if self.is_shut_down() {
            debug!(dest, "Send after shutdown rejected");
            callback(false);
            return;
        }

        let len = payload.len();
        let request = match self.transport.isend(dest, CHANNEL_TAG, payload) {
            Ok(request) => request,
            Err(e) => {
                error!(rank = self.id(), dest, error = %e, "Send submission failed");
                Box::new(CompletedRequest::failed(self.id()))
            }
        };

        let rejected = {
            let mut shared = self.shared.lock();
            if self.is_shut_down() {
                Some(callback)
            } else {
                shared.submitted.push(PendingOperation::send(request, callback));
                None
            }
        };

        match rejected {
            Some(callback) => callback(false),
            None => {
                Counters::bump(&self.counters.sends_submitted);
                debug!(rank = self.id(), dest, bytes = len, "Send submitted");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Receiving
    // ─────────────────────────────────────────────────────────────

    /// Add a handler for inbound messages.
    ///
    /// Every handler sees every message, in registration order. Registering
    /// the same handler twice means it runs twice.
    pub fn register_receive_handler(&self, handler: Arc<dyn ReceiveHandler>) {
        let count = {
            let mut shared = self.shared.lock();
            shared.handlers.push(handler);
            shared.handlers.len()
        };
        debug!(rank = self.id(), handlers = count, "Receive handler registered");
    }

    /// Set the receive buffer capacity and arm the first receive.
    ///
    /// Messages larger than `max_packet_bytes` fail their receive and are
    /// dropped. If a receive is already outstanding the new capacity takes
    /// effect when it is re-armed.
    pub fn set_buffer_size(&self, max_packet_bytes: usize) {
        let arm = {
            let mut shared = self.shared.lock();
            shared.receive.capacity = max_packet_bytes;
            let arm = !shared.receive.armed && !self.is_shut_down();
            if arm {
                shared.receive.armed = true;
            }
            arm
        };

        debug!(rank = self.id(), capacity = max_packet_bytes, arming = arm, "Receive buffer sized");
        if arm {
            self.arm_receive(vec![0; max_packet_bytes]);
        }
    }

    fn arm_receive(&self, buffer: Vec<u8>) {
        let request = self.transport.irecv(CHANNEL_TAG, buffer);
        self.shared
            .lock()
            .submitted
            .push(PendingOperation::receive(request));
    }

    // ─────────────────────────────────────────────────────────────
    // Poll Loop
    // ─────────────────────────────────────────────────────────────

    fn schedule_poll(self: &Arc<Self>) {
        let waypoint = Arc::clone(self);
        self.scheduler.post(Box::new(move || {
            waypoint.poll_one();
        }));
    }

    /// Run one poll turn, then post the next unless shut down.
    ///
    /// Normally only called by the scheduler.
    pub fn poll_one(self: &Arc<Self>) -> PollReport {
        let report = self.turn();
        if !self.is_shut_down() {
            self.schedule_poll();
        }
        report
    }

    fn turn(&self) -> PollReport {
        Counters::bump(&self.counters.polls);
        let current = std::thread::current().id();

        let (ready, foreign_thread) = {
            let mut ledger = self.ledger.lock();

            let foreign_thread = {
                let mut shared = self.shared.lock();
                let foreign_thread = match shared.poll_thread {
                    None => {
                        shared.poll_thread = Some(current);
                        None
                    }
                    Some(designated) if designated != current => Some(designated),
                    Some(_) => None,
                };

                ledger.admit(std::mem::take(&mut shared.submitted));
                self.gauge.publish(&ledger);
                foreign_thread
            };

            // Submitters only need `shared`, so they proceed during the tests.
            let ready = ledger.collect_ready();
            self.gauge.publish(&ledger);
            (ready, foreign_thread)
        };

        let handlers = if ready
            .iter()
            .any(|r| matches!(r.continuation, Continuation::Receive))
        {
            self.shared.lock().handlers.clone()
        } else {
            Vec::new()
        };

        if let Some(designated) = foreign_thread {
            error!(
                rank = self.id(),
                designated = ?designated,
                current = ?current,
                "Poll turn on a thread other than the designated polling thread"
            );
            debug_assert!(false, "poll turn on a thread other than the designated polling thread");
        }

        let dispatched = ready.len();
        for operation in ready {
            self.dispatch(operation, &handlers);
        }

        let in_flight = self.ledger.lock().len();
        self.counters.observe_in_flight(in_flight);

        let backlog = in_flight > BACKLOG_HIGH_WATER;
        if backlog {
            Counters::bump(&self.counters.backlog_advisories);
            warn!(
                rank = self.id(),
                in_flight,
                high_water = BACKLOG_HIGH_WATER,
                "Operation backlog above high-water mark"
            );
        }

        if dispatched > 0 {
            trace!(rank = self.id(), dispatched, in_flight, "Poll turn");
        }

        PollReport {
            dispatched,
            in_flight,
            backlog,
        }
    }

    fn dispatch(&self, operation: ReadyOperation, handlers: &[Arc<dyn ReceiveHandler>]) {
        let ReadyOperation {
            completion,
            continuation,
        } = operation;

        match continuation {
            Continuation::Send(callback) => {
                if completion.ok {
                    Counters::bump(&self.counters.sends_completed);
                } else {
                    Counters::bump(&self.counters.sends_failed);
                    warn!(rank = self.id(), "Send completed with failure");
                }
                callback(completion.ok);
            }
            Continuation::Receive => {
                let buffer = completion.buffer.unwrap_or_default();

                if completion.ok {
                    Counters::bump(&self.counters.receives_completed);
                    let data = &buffer[..completion.len.min(buffer.len())];
                    let sender = completion.source;
                    trace!(rank = self.id(), sender, bytes = data.len(), "Message received");

                    if sender == self.parent() {
                        for handler in handlers {
                            handler.received_from_parent(data);
                        }
                    } else {
                        for handler in handlers {
                            handler.received_from_child(data, sender);
                        }
                    }
                } else {
                    Counters::bump(&self.counters.receives_failed);
                    error!(rank = self.id(), sender = completion.source, "Receive failed");
                }

                self.rearm(buffer);
            }
        }
    }

    fn rearm(&self, mut buffer: Vec<u8>) {
        let capacity = {
            let mut shared = self.shared.lock();
            if self.is_shut_down() {
                shared.receive.armed = false;
                return;
            }
            shared.receive.capacity
        };

        buffer.resize(capacity, 0);
        Counters::bump(&self.counters.rearms);
        self.arm_receive(buffer);
    }

    // ─────────────────────────────────────────────────────────────
    // Diagnostics & Shutdown
    // ─────────────────────────────────────────────────────────────

    /// Snapshot of this waypoint's counters
    pub fn stats(&self) -> WaypointStats {
        // Submissions move into the ledger and the gauge under `shared`, so
        // none is counted twice or missed.
        let shared = self.shared.lock();
        let in_flight = self.gauge.operations.load(Ordering::Relaxed) + shared.submitted.len();
        let receives = self.gauge.receives.load(Ordering::Relaxed)
            + shared.submitted.iter().filter(|op| op.is_receive()).count();
        drop(shared);
        self.counters.snapshot(in_flight, receives)
    }

    /// Stop the poll loop.
    ///
    /// Sends still in flight complete with `false`; later submissions are
    /// rejected the same way. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let abandoned = {
            let mut ledger = self.ledger.lock();
            let mut abandoned = ledger.drain();
            let mut shared = self.shared.lock();
            self.gauge.publish(&ledger);
            abandoned.append(&mut shared.submitted);
            shared.receive.armed = false;
            abandoned
        };

        let mut failed = 0usize;
        for operation in abandoned {
            if let Continuation::Send(callback) = operation.into_continuation() {
                Counters::bump(&self.counters.sends_failed);
                failed += 1;
                callback(false);
            }
        }

        debug!(rank = self.id(), abandoned_sends = failed, "Waypoint shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TreeWaypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeWaypoint")
            .field("rank", &self.id())
            .field("world_size", &self.total_participants())
            .field("transport", &self.transport.name())
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}

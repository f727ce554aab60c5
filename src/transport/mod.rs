//! Transport capability used by the waypoint
//!
//! The waypoint needs exactly five things from a transport: its own rank,
//! the participant count, a rank-addressed non-blocking send, a non-blocking
//! receive from any source, and a non-blocking completion test (exposed on
//! the returned [`Request`]). Everything else about the transport is opaque.
//!
//! Backends:
//! - [`local`]: in-process fabric of N endpoints, for tests and simulation
//! - [`tcp`]: one listener per rank, length-prefixed frames over TCP

pub mod local;
pub mod tcp;

use std::sync::Arc;

use crate::error::Result;
use crate::topology::Rank;

pub use local::{LinkState, LocalFabric, LocalTransport};
pub use tcp::{TcpOptions, TcpTransport};

/// Message tag used to keep overlay traffic apart from anything else
/// sharing the transport
pub type Tag = u32;

/// Tag carried by every overlay message
pub const CHANNEL_TAG: Tag = 1972;

/// Outbound bytes. Shared, never copied, while a send is in flight.
pub type Payload = Arc<[u8]>;

// ─────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────

/// Outcome of a finished non-blocking operation
#[derive(Debug)]
pub struct Completion {
    /// Whether the transport reported success
    pub ok: bool,

    /// Sender of a received message; own rank for sends
    pub source: Rank,

    /// Bytes transferred
    pub len: usize,

    /// The receive buffer, handed back on every receive completion
    pub buffer: Option<Vec<u8>>,
}

impl Completion {
    pub fn sent(source: Rank, len: usize) -> Self {
        Self {
            ok: true,
            source,
            len,
            buffer: None,
        }
    }

    pub fn failed(source: Rank) -> Self {
        Self {
            ok: false,
            source,
            len: 0,
            buffer: None,
        }
    }

    pub fn received(source: Rank, len: usize, buffer: Vec<u8>) -> Self {
        Self {
            ok: true,
            source,
            len,
            buffer: Some(buffer),
        }
    }

    pub fn receive_failed(source: Rank, buffer: Vec<u8>) -> Self {
        Self {
            ok: false,
            source,
            len: 0,
            buffer: Some(buffer),
        }
    }
}

/// Handle to an in-flight non-blocking operation
pub trait Request: Send {
    /// Test for completion without blocking.
    ///
    /// Returns `Some` exactly once, when the operation has finished.
    fn test(&mut self) -> Option<Completion>;
}

/// A request that is already finished when it is created
pub struct CompletedRequest(Option<Completion>);

impl CompletedRequest {
    pub fn new(completion: Completion) -> Self {
        Self(Some(completion))
    }

    /// A send that failed at submission time
    pub fn failed(source: Rank) -> Self {
        Self::new(Completion::failed(source))
    }
}

impl Request for CompletedRequest {
    fn test(&mut self) -> Option<Completion> {
        self.0.take()
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// Rank-addressed non-blocking message transport
pub trait Transport: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// This participant's rank
    fn rank(&self) -> Rank;

    /// Total number of participants
    fn world_size(&self) -> usize;

    /// Start sending `payload` to `dest`.
    ///
    /// An `Err` means the send could not even be submitted.
    fn isend(&self, dest: Rank, tag: Tag, payload: Payload) -> Result<Box<dyn Request>>;

    /// Start receiving one `tag` message from any source into `buffer`.
    ///
    /// `buffer.len()` is the capacity. Failures, including a message larger
    /// than the capacity, are reported through the completion, which always
    /// hands the buffer back.
    fn irecv(&self, tag: Tag, buffer: Vec<u8>) -> Box<dyn Request>;
}

/// Copy `payload` into `buffer`, or fail the receive if it does not fit
pub(crate) fn fill_buffer(source: Rank, payload: &[u8], mut buffer: Vec<u8>) -> Completion {
    if payload.len() > buffer.len() {
        tracing::error!(
            source,
            size = payload.len(),
            capacity = buffer.len(),
            "Inbound message truncated, dropping"
        );
        return Completion::receive_failed(source, buffer);
    }

    buffer[..payload.len()].copy_from_slice(payload);
    Completion::received(source, payload.len(), buffer)
}

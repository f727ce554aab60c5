//! In-process transport fabric
//!
//! A [`LocalFabric`] holds one mailbox per rank. A send is delivered into the
//! destination mailbox the first time its request is tested, which is also
//! when it completes. Links into a rank can be held (sends stay pending) or
//! severed (sends fail) to exercise the waypoint's completion paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::topology::Rank;

use super::{fill_buffer, Completion, Payload, Request, Tag, Transport};

/// Delivery state of the link into one rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// Sends are delivered and complete on their next test
    Open = 0,
    /// Sends stay pending until the link is reopened
    Held = 1,
    /// Sends complete with a failure and are not delivered
    Severed = 2,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Held,
            2 => LinkState::Severed,
            _ => LinkState::Open,
        }
    }
}

struct Envelope {
    source: Rank,
    tag: Tag,
    payload: Payload,
}

struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    link: AtomicU8,
}

/// Shared mailboxes for a fixed set of in-process participants
pub struct LocalFabric {
    mailboxes: Vec<Mailbox>,
}

impl LocalFabric {
    /// Create a fabric for `world_size` participants
    pub fn new(world_size: usize) -> Arc<Self> {
        let mailboxes = (0..world_size)
            .map(|_| Mailbox {
                queue: Mutex::new(VecDeque::new()),
                link: AtomicU8::new(LinkState::Open as u8),
            })
            .collect();
        Arc::new(Self { mailboxes })
    }

    pub fn world_size(&self) -> usize {
        self.mailboxes.len()
    }

    /// Endpoint for `rank`
    pub fn endpoint(self: &Arc<Self>, rank: Rank) -> Result<LocalTransport> {
        if rank >= self.world_size() {
            return Err(Error::InvalidRank {
                rank,
                world_size: self.world_size(),
            });
        }
        Ok(LocalTransport {
            fabric: Arc::clone(self),
            rank,
        })
    }

    /// One endpoint per rank, in rank order
    pub fn endpoints(self: &Arc<Self>) -> Vec<LocalTransport> {
        (0..self.world_size())
            .map(|rank| LocalTransport {
                fabric: Arc::clone(self),
                rank,
            })
            .collect()
    }

    /// Change how sends into `rank` are handled
    pub fn set_link(&self, rank: Rank, state: LinkState) {
        if let Some(mailbox) = self.mailboxes.get(rank) {
            debug!(rank, ?state, "Local link state changed");
            mailbox.link.store(state as u8, Ordering::SeqCst);
        }
    }

    pub fn link(&self, rank: Rank) -> LinkState {
        self.mailboxes
            .get(rank)
            .map(|m| LinkState::from_u8(m.link.load(Ordering::SeqCst)))
            .unwrap_or(LinkState::Severed)
    }

    /// Messages delivered to `rank` and not yet received
    pub fn queued(&self, rank: Rank) -> usize {
        self.mailboxes
            .get(rank)
            .map(|m| m.queue.lock().len())
            .unwrap_or(0)
    }

    fn deliver(&self, dest: Rank, envelope: Envelope) {
        self.mailboxes[dest].queue.lock().push_back(envelope);
    }

    fn take(&self, rank: Rank, tag: Tag) -> Option<Envelope> {
        let mut queue = self.mailboxes[rank].queue.lock();
        let position = queue.iter().position(|e| e.tag == tag)?;
        queue.remove(position)
    }
}

/// One participant's endpoint on a [`LocalFabric`]
#[derive(Clone)]
pub struct LocalTransport {
    fabric: Arc<LocalFabric>,
    rank: Rank,
}

impl LocalTransport {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.fabric.world_size()
    }

    fn isend(&self, dest: Rank, tag: Tag, payload: Payload) -> Result<Box<dyn Request>> {
        if dest >= self.fabric.world_size() {
            return Err(Error::InvalidRank {
                rank: dest,
                world_size: self.fabric.world_size(),
            });
        }

        Ok(Box::new(LocalSend {
            fabric: Arc::clone(&self.fabric),
            dest,
            envelope: Some(Envelope {
                source: self.rank,
                tag,
                payload,
            }),
        }))
    }

    fn irecv(&self, tag: Tag, buffer: Vec<u8>) -> Box<dyn Request> {
        Box::new(LocalRecv {
            fabric: Arc::clone(&self.fabric),
            rank: self.rank,
            tag,
            buffer: Some(buffer),
        })
    }
}

struct LocalSend {
    fabric: Arc<LocalFabric>,
    dest: Rank,
    envelope: Option<Envelope>,
}

impl Request for LocalSend {
    fn test(&mut self) -> Option<Completion> {
        let source = self.envelope.as_ref()?.source;
        match self.fabric.link(self.dest) {
            LinkState::Held => None,
            LinkState::Severed => {
                self.envelope = None;
                Some(Completion::failed(source))
            }
            LinkState::Open => {
                let envelope = self.envelope.take()?;
                let len = envelope.payload.len();
                self.fabric.deliver(self.dest, envelope);
                Some(Completion::sent(source, len))
            }
        }
    }
}

struct LocalRecv {
    fabric: Arc<LocalFabric>,
    rank: Rank,
    tag: Tag,
    buffer: Option<Vec<u8>>,
}

impl Request for LocalRecv {
    fn test(&mut self) -> Option<Completion> {
        self.buffer.as_ref()?;
        let envelope = self.fabric.take(self.rank, self.tag)?;
        let buffer = self.buffer.take()?;
        Some(fill_buffer(envelope.source, &envelope.payload, buffer))
    }
}

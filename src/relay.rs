//! Broadcast relay over the tree
//!
//! The root starts a round by sending `[u32 round][body]` to its children.
//! Every node records a SHA-256 digest of what it got, forwards it to its own
//! children, and acknowledges to its parent once its whole subtree has
//! acknowledged. Leaves acknowledge immediately. The round is complete when
//! the root has acknowledgements from all its children.
//!
//! Acknowledgements are `[u32 round]`. Direction tells the two apart: data
//! only ever arrives from a parent, acknowledgements only from children.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::topology::Rank;
use crate::waypoint::{ReceiveHandler, TreeWaypoint};

/// Size of the round header at the front of every relay message
pub const ROUND_HEADER_BYTES: usize = 4;

/// Rounds of digests and completions a relay remembers
pub const RETAINED_ROUNDS: usize = 256;

/// Build a round's broadcast message
pub fn encode_round(round: u32, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(ROUND_HEADER_BYTES + body.len());
    message.extend_from_slice(&round.to_be_bytes());
    message.extend_from_slice(body);
    message
}

fn decode_round(data: &[u8]) -> Option<u32> {
    let header: [u8; ROUND_HEADER_BYTES] = data.get(..ROUND_HEADER_BYTES)?.try_into().ok()?;
    Some(u32::from_be_bytes(header))
}

/// Hex SHA-256 of a relay message
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Default)]
struct RelayState {
    /// Digest of each recent round's message as received here
    digests: BTreeMap<u32, String>,
    /// Child acknowledgements still outstanding per round
    pending_acks: HashMap<u32, usize>,
    /// Recent rounds whose whole subtree has acknowledged
    completed: BTreeSet<u32>,
    /// Rounds below this were pruned and count as already seen
    floor: u32,
    rounds_seen: usize,
}

impl RelayState {
    fn record_digest(&mut self, round: u32, digest: String) {
        self.digests.insert(round, digest);
        self.rounds_seen += 1;
        while self.digests.len() > RETAINED_ROUNDS {
            if let Some((pruned, _)) = self.digests.pop_first() {
                self.floor = self.floor.max(pruned.saturating_add(1));
            }
        }
    }

    fn record_completed(&mut self, round: u32) {
        self.completed.insert(round);
        while self.completed.len() > RETAINED_ROUNDS {
            self.completed.pop_first();
        }
        // Rounds this far behind will not be acknowledged any more
        let horizon = round.saturating_sub(RETAINED_ROUNDS as u32);
        self.pending_acks.retain(|&pending, _| pending >= horizon);
    }
}

/// Receive handler that relays root broadcasts down and acknowledgements up
pub struct RelayHandler {
    waypoint: Weak<TreeWaypoint>,
    state: Mutex<RelayState>,
    round_done: Condvar,
}

impl RelayHandler {
    /// Create a relay and register it on `waypoint`
    pub fn attach(waypoint: &Arc<TreeWaypoint>) -> Arc<Self> {
        let relay = Arc::new(Self {
            waypoint: Arc::downgrade(waypoint),
            state: Mutex::new(RelayState::default()),
            round_done: Condvar::new(),
        });
        waypoint.register_receive_handler(relay.clone());
        relay
    }

    /// Start `round` from the root.
    ///
    /// Returns false if this node is not the root or has been detached.
    pub fn broadcast(&self, round: u32, body: &[u8]) -> bool {
        let Some(waypoint) = self.waypoint.upgrade() else {
            return false;
        };
        if !waypoint.is_root() {
            warn!(rank = waypoint.id(), "Only the root starts relay rounds");
            return false;
        }

        let message = encode_round(round, body);
        let fingerprint = digest(&message);
        info!(round, bytes = message.len(), digest = %&fingerprint[..16], "Starting relay round");
        self.relay_down(&waypoint, round, message);
        true
    }

    /// Whether `round` has been acknowledged by this node's whole subtree
    pub fn is_complete(&self, round: u32) -> bool {
        self.state.lock().completed.contains(&round)
    }

    /// Block until `round` completes or `timeout` passes
    pub fn wait_round(&self, round: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.completed.contains(&round) {
            if self.round_done.wait_until(&mut state, deadline).timed_out() {
                return state.completed.contains(&round);
            }
        }
        true
    }

    /// Digest recorded for `round`, if its message arrived here
    pub fn digest_for(&self, round: u32) -> Option<String> {
        self.state.lock().digests.get(&round).cloned()
    }

    /// Number of distinct rounds received from the parent
    pub fn rounds_seen(&self) -> usize {
        self.state.lock().rounds_seen
    }

    fn relay_down(&self, waypoint: &Arc<TreeWaypoint>, round: u32, message: Vec<u8>) {
        let children = waypoint.children();
        if children.is_empty() {
            self.subtree_done(waypoint, round);
            return;
        }

        self.state.lock().pending_acks.insert(round, children.len());

        let rank = waypoint.id();
        waypoint.send_to_children(message, move |ok| {
            if !ok {
                warn!(rank, round, "Relay to children failed");
            }
        });
    }

    fn subtree_done(&self, waypoint: &Arc<TreeWaypoint>, round: u32) {
        self.state.lock().record_completed(round);
        if waypoint.is_root() {
            self.round_done.notify_all();
            info!(round, "Relay round complete");
            return;
        }

        let rank = waypoint.id();
        waypoint.send_to_parent(round.to_be_bytes().to_vec(), move |ok| {
            if !ok {
                warn!(rank, round, "Acknowledgement to parent failed");
            }
        });
    }
}

impl ReceiveHandler for RelayHandler {
    fn received_from_parent(&self, data: &[u8]) {
        let Some(waypoint) = self.waypoint.upgrade() else {
            return;
        };
        let Some(round) = decode_round(data) else {
            warn!(rank = waypoint.id(), bytes = data.len(), "Relay message without round header");
            return;
        };

        let fresh = {
            let mut state = self.state.lock();
            let fresh = round >= state.floor && !state.digests.contains_key(&round);
            if fresh {
                state.record_digest(round, digest(data));
            }
            fresh
        };
        if !fresh {
            debug!(rank = waypoint.id(), round, "Duplicate relay round ignored");
            return;
        }

        debug!(rank = waypoint.id(), round, bytes = data.len(), "Relay round received");
        self.relay_down(&waypoint, round, data.to_vec());
    }

    fn received_from_child(&self, data: &[u8], sender: Rank) {
        let Some(waypoint) = self.waypoint.upgrade() else {
            return;
        };
        let Some(round) = decode_round(data) else {
            warn!(rank = waypoint.id(), sender, "Acknowledgement without round header");
            return;
        };

        let done = {
            let mut state = self.state.lock();
            let remaining = state.pending_acks.get_mut(&round).map(|remaining| {
                *remaining = remaining.saturating_sub(1);
                *remaining
            });
            match remaining {
                Some(0) => {
                    state.pending_acks.remove(&round);
                    true
                }
                Some(_) => false,
                None => {
                    warn!(rank = waypoint.id(), sender, round, "Unexpected acknowledgement");
                    false
                }
            }
        };

        if done {
            self.subtree_done(&waypoint, round);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_header() {
        let message = encode_round(7, b"body");
        assert_eq!(message.len(), 8);
        assert_eq!(decode_round(&message), Some(7));
        assert_eq!(decode_round(&[0, 1]), None);
    }

    #[test]
    fn test_round_history_is_bounded() {
        let fabric = crate::transport::LocalFabric::new(2);
        let queue = crate::scheduler::TaskQueue::new();
        let transport = Arc::new(fabric.endpoint(1).unwrap());
        let waypoint = TreeWaypoint::start(transport, queue.clone()).unwrap();
        let relay = RelayHandler::attach(&waypoint);

        let last = RETAINED_ROUNDS as u32 + 10;
        for round in 1..=last {
            relay.received_from_parent(&encode_round(round, b"body"));
        }

        assert_eq!(relay.rounds_seen(), last as usize);
        assert!(relay.digest_for(1).is_none());
        assert!(relay.digest_for(last).is_some());
        assert!(!relay.is_complete(1));
        assert!(relay.is_complete(last));

        let state = relay.state.lock();
        assert_eq!(state.digests.len(), RETAINED_ROUNDS);
        assert_eq!(state.completed.len(), RETAINED_ROUNDS);
        drop(state);

        // A pruned round showing up again is not relayed twice
        relay.received_from_parent(&encode_round(1, b"body"));
        assert_eq!(relay.rounds_seen(), last as usize);
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let d = digest(b"abc");
        assert_eq!(d.len(), 64);
        assert_eq!(
            d,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

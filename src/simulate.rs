//! In-process cluster simulation
//!
//! Runs N waypoints inside one process over a [`LocalFabric`], each with its
//! own poll thread, and drives relay rounds from the root. Used by the
//! `simulate` command and by integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::WaypointSettings;
use crate::context::WaypointContext;
use crate::error::{Error, Result};
use crate::relay::{self, RelayHandler, ROUND_HEADER_BYTES};
use crate::topology::{Rank, ROOT};
use crate::transport::LocalFabric;
use crate::waypoint::{TreeWaypoint, WaypointStats};

/// Largest cluster the simulator will build (one poll thread per node)
pub const MAX_SIMULATED_NODES: usize = 1024;

// ─────────────────────────────────────────────────────────────────
// Cluster
// ─────────────────────────────────────────────────────────────────

/// N waypoints sharing one in-process fabric
pub struct LocalCluster {
    fabric: Arc<LocalFabric>,
    contexts: Vec<WaypointContext>,
}

impl LocalCluster {
    /// Start `nodes` waypoints, each driven by its own poll thread.
    ///
    /// Receiving starts with [`start_receiving`](Self::start_receiving).
    pub fn start(nodes: usize, settings: &WaypointSettings) -> Result<Self> {
        if nodes == 0 || nodes > MAX_SIMULATED_NODES {
            return Err(Error::config_field_invalid(
                "nodes",
                format!("cluster size must be between 1 and {}", MAX_SIMULATED_NODES),
            ));
        }

        let fabric = LocalFabric::new(nodes);
        let contexts = fabric
            .endpoints()
            .into_iter()
            .map(|endpoint| WaypointContext::with_transport(Arc::new(endpoint), settings))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { fabric, contexts })
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    pub fn waypoint(&self, rank: Rank) -> Option<&Arc<TreeWaypoint>> {
        self.contexts.get(rank).map(|ctx| ctx.waypoint())
    }

    pub fn waypoints(&self) -> impl Iterator<Item = &Arc<TreeWaypoint>> {
        self.contexts.iter().map(|ctx| ctx.waypoint())
    }

    /// Arm every node's receive; call after handlers are attached
    pub fn start_receiving(&self) {
        for ctx in &self.contexts {
            ctx.start_receiving();
        }
    }

    /// Stop every node
    pub fn shutdown(&mut self) {
        for ctx in &mut self.contexts {
            ctx.shutdown();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Simulation
// ─────────────────────────────────────────────────────────────────

/// Parameters for [`run_simulation`]
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Cluster size
    pub nodes: usize,

    /// Relay rounds to run
    pub rounds: u32,

    /// Body size of each round's message
    pub payload_bytes: usize,

    /// Per-round completion timeout
    pub timeout: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            nodes: 7,
            rounds: 3,
            payload_bytes: 4096,
            timeout: Duration::from_secs(10),
        }
    }
}

/// One node's view at the end of a simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub rank: Rank,
    pub parent: Rank,
    pub children: Vec<Rank>,
    pub rounds_received: usize,
    pub stats: WaypointStats,
}

/// Outcome of a simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub nodes: usize,
    pub rounds: u32,
    pub payload_bytes: usize,

    /// Rounds acknowledged by the whole tree before their timeout
    pub rounds_completed: u32,

    /// (node, round) pairs that arrived with the expected digest
    pub delivered: usize,

    /// (node, round) pairs that should have arrived
    pub expected: usize,

    /// (node, round) pairs that arrived with a different digest
    pub digest_mismatches: usize,

    pub elapsed_ms: u64,

    pub per_node: Vec<NodeReport>,
}

impl SimulationReport {
    /// Every round completed and every node got every payload intact
    pub fn is_success(&self) -> bool {
        self.rounds_completed == self.rounds
            && self.delivered == self.expected
            && self.digest_mismatches == 0
    }
}

/// Deterministic body for `round`
fn round_body(round: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(round.wrapping_mul(7)) as u8)
        .collect()
}

/// Build a cluster, relay `rounds` broadcasts through it and check delivery
pub fn run_simulation(options: &SimulationOptions) -> Result<SimulationReport> {
    let settings = WaypointSettings {
        max_packet_bytes: options.payload_bytes + ROUND_HEADER_BYTES,
        idle_sleep_us: 50,
    };

    let started = Instant::now();
    let mut cluster = LocalCluster::start(options.nodes, &settings)?;
    let relays: Vec<Arc<RelayHandler>> = cluster.waypoints().map(RelayHandler::attach).collect();
    cluster.start_receiving();

    info!(
        nodes = options.nodes,
        rounds = options.rounds,
        payload_bytes = options.payload_bytes,
        "Simulation started"
    );

    let mut rounds_completed = 0;
    let mut delivered = 0;
    let mut digest_mismatches = 0;
    for round in 1..=options.rounds {
        let body = round_body(round, options.payload_bytes);
        let expected = relay::digest(&relay::encode_round(round, &body));

        relays[ROOT].broadcast(round, &body);
        if relays[ROOT].wait_round(round, options.timeout) {
            rounds_completed += 1;
        } else {
            warn!(round, timeout = ?options.timeout, "Relay round timed out");
        }

        // Relays keep a bounded window of digests, so check while it is recent
        for relay in relays.iter().skip(1) {
            match relay.digest_for(round) {
                Some(ref got) if *got == expected => delivered += 1,
                Some(_) => digest_mismatches += 1,
                None => {}
            }
        }
    }

    // Join the poll threads so the counters are final.
    cluster.shutdown();

    let per_node = cluster
        .waypoints()
        .zip(&relays)
        .map(|(waypoint, relay)| NodeReport {
            rank: waypoint.id(),
            parent: waypoint.parent(),
            children: waypoint.children(),
            rounds_received: relay.rounds_seen(),
            stats: waypoint.stats(),
        })
        .collect();

    let report = SimulationReport {
        nodes: options.nodes,
        rounds: options.rounds,
        payload_bytes: options.payload_bytes,
        rounds_completed,
        delivered,
        expected: (options.nodes - 1) * options.rounds as usize,
        digest_mismatches,
        elapsed_ms: started.elapsed().as_millis() as u64,
        per_node,
    };

    info!(
        rounds_completed = report.rounds_completed,
        delivered = report.delivered,
        expected = report.expected,
        elapsed_ms = report.elapsed_ms,
        "Simulation finished"
    );

    Ok(report)
}

//! Waypoint lifecycle
//!
//! A [`WaypointContext`] owns everything one participant needs: the
//! transport, the scheduler thread that drives the poll loop, and the
//! waypoint itself. Build one with [`WaypointContext::init`], register
//! receive handlers, then call [`WaypointContext::start_receiving`]. Tear it
//! down with [`WaypointContext::shutdown`] (or by dropping it).
//!
//! Until `start_receiving` no receive is armed, so inbound messages wait in
//! the transport instead of being dispatched to an empty handler list.

use std::sync::Arc;

use tracing::info;

use crate::config::{TransportKind, TreewayConfig, WaypointSettings};
use crate::error::{Error, Result};
use crate::scheduler::SchedulerThread;
use crate::transport::{LocalFabric, TcpOptions, TcpTransport, Transport};
use crate::waypoint::TreeWaypoint;

/// Owner of one participant's transport, poll thread and waypoint
pub struct WaypointContext {
    waypoint: Arc<TreeWaypoint>,
    driver: SchedulerThread,
    transport: Arc<dyn Transport>,
    max_packet_bytes: usize,
}

impl WaypointContext {
    /// Bring up the configured transport and start the waypoint on it.
    ///
    /// Fails with [`Error::TransportUnavailable`] if the transport cannot be
    /// built; nothing is left running in that case.
    pub fn init(config: &TreewayConfig) -> Result<Self> {
        config.validate()?;
        let transport = build_transport(config)?;
        Self::with_transport(transport, &config.waypoint)
    }

    /// Start a waypoint over an existing transport. Sends work right away;
    /// receiving waits for [`start_receiving`](Self::start_receiving).
    pub fn with_transport(transport: Arc<dyn Transport>, settings: &WaypointSettings) -> Result<Self> {
        let rank = transport.rank();
        let driver = SchedulerThread::spawn(format!("treeway-poll-{}", rank), settings.idle_sleep())?;
        let waypoint = TreeWaypoint::start(Arc::clone(&transport), driver.scheduler())?;

        info!(
            rank,
            world_size = transport.world_size(),
            transport = transport.name(),
            max_packet_bytes = settings.max_packet_bytes,
            "Waypoint context initialized"
        );

        Ok(Self {
            waypoint,
            driver,
            transport,
            max_packet_bytes: settings.max_packet_bytes,
        })
    }

    /// Size the receive buffer and arm the first receive.
    ///
    /// Call once every receive handler is registered. Calling it again is
    /// harmless.
    pub fn start_receiving(&self) {
        self.waypoint.set_buffer_size(self.max_packet_bytes);
    }

    pub fn waypoint(&self) -> &Arc<TreeWaypoint> {
        &self.waypoint
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Stop the poll loop and join its thread. Idempotent.
    pub fn shutdown(&mut self) {
        if self.waypoint.is_shut_down() {
            return;
        }
        self.waypoint.shutdown();
        self.driver.shutdown();
        info!(rank = self.waypoint.id(), "Waypoint context shut down");
    }
}

impl Drop for WaypointContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_transport(config: &TreewayConfig) -> Result<Arc<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Local => {
            if config.node.world_size != 1 {
                return Err(Error::transport_unavailable(
                    "local",
                    format!(
                        "a standalone local transport only supports world_size 1 (got {})",
                        config.node.world_size
                    ),
                ));
            }
            let fabric = LocalFabric::new(1);
            Ok(Arc::new(fabric.endpoint(config.node.rank)?))
        }
        TransportKind::Tcp => {
            let options = TcpOptions {
                rank: config.node.rank,
                peers: config.peer_addrs()?,
                connect_timeout: config.transport.connect_timeout(),
                max_connect_attempts: config.transport.max_connect_attempts,
            };
            let transport = TcpTransport::bind(options)
                .map_err(|e| Error::transport_unavailable("tcp", e.to_string()))?;
            Ok(Arc::new(transport))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_receive_waits_for_start_receiving() {
        let fabric = LocalFabric::new(2);
        let settings = WaypointSettings::default();
        let root = WaypointContext::with_transport(Arc::new(fabric.endpoint(0).unwrap()), &settings).unwrap();
        let child = WaypointContext::with_transport(Arc::new(fabric.endpoint(1).unwrap()), &settings).unwrap();

        let mut receipt = root.waypoint().send_to_children_with_receipt(&b"round-1"[..]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while receipt.try_recv().is_err() {
            assert!(Instant::now() < deadline, "send never completed");
            std::thread::sleep(Duration::from_millis(1));
        }

        // Nothing consumes the message while no receive is armed
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(child.waypoint().stats().outstanding_receives, 0);
        assert_eq!(fabric.queued(1), 1);

        child.start_receiving();
        child.start_receiving();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fabric.queued(1) != 0 {
            assert!(Instant::now() < deadline, "message never received");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(child.waypoint().stats().receives_completed, 1);
    }

    #[test]
    fn test_init_single_local_node() {
        let config = TreewayConfig::default();
        let mut ctx = WaypointContext::init(&config).unwrap();

        let waypoint = Arc::clone(ctx.waypoint());
        assert!(waypoint.is_root());
        assert_eq!(waypoint.total_participants(), 1);

        let mut receipt = waypoint.send_to_parent_with_receipt(&b"ping"[..]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let ok = loop {
            if let Ok(ok) = receipt.try_recv() {
                break ok;
            }
            assert!(Instant::now() < deadline, "send never completed");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(ok);

        ctx.shutdown();
        assert!(waypoint.is_shut_down());
        ctx.shutdown();
    }

    #[test]
    fn test_local_multi_node_is_unavailable() {
        let mut config = TreewayConfig::default();
        config.node.world_size = 3;

        let err = WaypointContext::init(&config).err().unwrap();
        assert!(matches!(err, Error::TransportUnavailable { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tcp_bind_failure_is_unavailable() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().to_string();

        let mut config = TreewayConfig::default();
        config.transport.kind = TransportKind::Tcp;
        config.transport.peers = vec![taken];

        let err = WaypointContext::init(&config).err().unwrap();
        assert!(matches!(err, Error::TransportUnavailable { .. }));
    }
}

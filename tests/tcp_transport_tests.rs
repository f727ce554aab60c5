//! Waypoints talking over real loopback sockets

mod common;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, RecordingHandler};
use treeway::config::WaypointSettings;
use treeway::relay::{self, RelayHandler};
use treeway::transport::{TcpOptions, TcpTransport};
use treeway::WaypointContext;

/// One bound listener per rank, all on port 0
fn listeners(count: usize) -> (Vec<TcpListener>, Vec<SocketAddr>) {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let addrs = listeners.iter().map(|l| l.local_addr().unwrap()).collect();
    (listeners, addrs)
}

/// Contexts for `count` ranks; callers register handlers then start receiving
fn tcp_cluster(count: usize) -> Vec<WaypointContext> {
    let (listeners, addrs) = listeners(count);
    let settings = WaypointSettings {
        max_packet_bytes: 64 * 1024,
        idle_sleep_us: 100,
    };

    listeners
        .into_iter()
        .enumerate()
        .map(|(rank, listener)| {
            let mut options = TcpOptions::new(rank, addrs.clone());
            options.connect_timeout = Duration::from_secs(5);
            let transport = TcpTransport::from_listener(options, listener).unwrap();
            WaypointContext::with_transport(Arc::new(transport), &settings).unwrap()
        })
        .collect()
}

#[test]
fn test_parent_and_child_exchange_over_tcp() {
    let mut cluster = tcp_cluster(2);
    let root_inbox = RecordingHandler::new();
    let child_inbox = RecordingHandler::new();
    cluster[0].waypoint().register_receive_handler(root_inbox.clone());
    cluster[1].waypoint().register_receive_handler(child_inbox.clone());
    for ctx in &cluster {
        ctx.start_receiving();
    }

    let mut down = cluster[0].waypoint().send_to_children_with_receipt(&b"parameters"[..]);
    let mut up = cluster[1].waypoint().send_to_parent_with_receipt(&b"gradients"[..]);

    assert!(wait_until(Duration::from_secs(10), || {
        root_inbox.total() == 1 && child_inbox.total() == 1
    }));

    assert_eq!(*child_inbox.from_parent.lock(), vec![b"parameters".to_vec()]);
    assert_eq!(*root_inbox.from_child.lock(), vec![(b"gradients".to_vec(), 1)]);

    assert!(wait_until(Duration::from_secs(5), || {
        cluster.iter().all(|ctx| ctx.waypoint().stats().sends_pending() == 0)
    }));
    assert_eq!(down.try_recv(), Ok(true));
    assert_eq!(up.try_recv(), Ok(true));

    for ctx in cluster.iter_mut() {
        ctx.shutdown();
    }
}

#[test]
fn test_relay_round_over_tcp_tree() {
    let mut cluster = tcp_cluster(4);
    let relays: Vec<Arc<RelayHandler>> = cluster
        .iter()
        .map(|ctx| RelayHandler::attach(ctx.waypoint()))
        .collect();
    for ctx in &cluster {
        ctx.start_receiving();
    }

    let body = vec![7u8; 1024];
    assert!(relays[0].broadcast(1, &body));
    assert!(relays[0].wait_round(1, Duration::from_secs(10)));

    let expected = relay::digest(&relay::encode_round(1, &body));
    for relay in &relays[1..] {
        assert_eq!(relay.digest_for(1).as_deref(), Some(expected.as_str()));
    }

    for ctx in cluster.iter_mut() {
        ctx.shutdown();
    }
}

#[test]
fn test_send_to_dead_peer_fails_callback() {
    let (mut listeners, addrs) = listeners(2);
    // Rank 0 never listens
    drop(listeners.remove(0));

    let mut options = TcpOptions::new(1, addrs);
    options.connect_timeout = Duration::from_millis(300);
    options.max_connect_attempts = 2;
    let transport = TcpTransport::from_listener(options, listeners.remove(0)).unwrap();
    let mut ctx = WaypointContext::with_transport(Arc::new(transport), &WaypointSettings::default()).unwrap();

    let mut receipt = ctx.waypoint().send_to_parent_with_receipt(&b"lost"[..]);
    assert!(wait_until(Duration::from_secs(10), || {
        ctx.waypoint().stats().sends_failed == 1
    }));
    assert_eq!(receipt.try_recv(), Ok(false));

    ctx.shutdown();
}

//! TCP transport between processes
//!
//! Every rank listens on `peers[rank]`. The first send to a destination
//! spawns a link task that connects (with exponential backoff), announces
//! the sender's rank, then writes frames queued for that destination in
//! order. Inbound connections are read by per-connection tasks that push
//! frames into a shared inbox, which receive requests poll.
//!
//! Wire format:
//!   handshake: [u32 magic][u32 sender rank]
//!   frame:     [u32 tag][u32 length][payload]
//! All integers big-endian.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::topology::Rank;

use super::{fill_buffer, Completion, CompletedRequest, Payload, Request, Tag, Transport, CHANNEL_TAG};

/// Largest frame accepted on the wire
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HANDSHAKE_MAGIC: u32 = 0x5457_4159; // "TWAY"

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// TCP transport settings
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// This participant's rank
    pub rank: Rank,

    /// Listen address of every rank, indexed by rank
    pub peers: Vec<SocketAddr>,

    /// Give up connecting to a peer after this long
    pub connect_timeout: Duration,

    /// Maximum connect attempts per link (0 = until timeout)
    pub max_connect_attempts: u32,
}

impl TcpOptions {
    pub fn new(rank: Rank, peers: Vec<SocketAddr>) -> Self {
        Self {
            rank,
            peers,
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Inbox
// ─────────────────────────────────────────────────────────────────

struct Frame {
    source: Rank,
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Inbox {
    frames: Mutex<VecDeque<Frame>>,
}

impl Inbox {
    /// Queue `frame` for a receive. Frames not on the overlay channel have
    /// no receiver and are dropped.
    fn push(&self, frame: Frame) -> bool {
        if frame.tag != CHANNEL_TAG {
            warn!(
                source = frame.source,
                tag = frame.tag,
                bytes = frame.payload.len(),
                "Dropping frame on unknown channel"
            );
            return false;
        }
        self.frames.lock().push_back(frame);
        true
    }

    fn len(&self) -> usize {
        self.frames.lock().len()
    }

    fn take(&self, tag: Tag) -> Option<Frame> {
        let mut frames = self.frames.lock();
        let position = frames.iter().position(|f| f.tag == tag)?;
        frames.remove(position)
    }
}

/// One queued outbound frame
struct Outgoing {
    tag: Tag,
    payload: Payload,
    done: oneshot::Sender<std::result::Result<usize, String>>,
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// Transport over one TCP listener per rank
pub struct TcpTransport {
    options: TcpOptions,
    runtime: Option<Runtime>,
    links: Mutex<HashMap<Rank, mpsc::UnboundedSender<Outgoing>>>,
    inbox: Arc<Inbox>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind `peers[rank]` and start accepting connections
    pub fn bind(options: TcpOptions) -> Result<Self> {
        let addr = *options.peers.get(options.rank).ok_or(Error::InvalidRank {
            rank: options.rank,
            world_size: options.peers.len(),
        })?;
        let listener = std::net::TcpListener::bind(addr).map_err(|e| Error::TransportBind {
            addr: addr.to_string(),
            source: e,
        })?;
        Self::from_listener(options, listener)
    }

    /// Use an already bound listener, e.g. one bound to port 0
    pub fn from_listener(options: TcpOptions, listener: std::net::TcpListener) -> Result<Self> {
        if options.rank >= options.peers.len() {
            return Err(Error::InvalidRank {
                rank: options.rank,
                world_size: options.peers.len(),
            });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name(format!("treeway-net-{}", options.rank))
            .build()
            .map_err(|e| Error::transport_unavailable("tcp", format!("runtime: {}", e)))?;

        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let inbox = Arc::new(Inbox::default());
        runtime.spawn(accept_loop(
            listener,
            Arc::clone(&inbox),
            options.peers.len(),
        ));

        info!(
            rank = options.rank,
            world_size = options.peers.len(),
            addr = %local_addr,
            "TCP transport listening"
        );

        Ok(Self {
            options,
            runtime: Some(runtime),
            links: Mutex::new(HashMap::new()),
            inbox,
            local_addr,
        })
    }

    /// Address this rank is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Frames received and not yet taken by a receive
    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    fn spawn_link(&self, dest: Rank) -> Result<mpsc::UnboundedSender<Outgoing>> {
        let runtime = self.runtime.as_ref().ok_or(Error::Shutdown)?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(link_loop(
            self.options.rank,
            dest,
            self.options.peers[dest],
            self.options.connect_timeout,
            self.options.max_connect_attempts,
            rx,
        ));
        Ok(tx)
    }

    fn enqueue(&self, dest: Rank, outgoing: Outgoing) -> Result<()> {
        let mut links = self.links.lock();
        let link = match links.get(&dest) {
            Some(link) if !link.is_closed() => link.clone(),
            _ => {
                let link = self.spawn_link(dest)?;
                links.insert(dest, link.clone());
                link
            }
        };

        link.send(outgoing).map_err(|_| Error::PeerUnreachable {
            rank: dest,
            message: "link task stopped".to_string(),
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn rank(&self) -> Rank {
        self.options.rank
    }

    fn world_size(&self) -> usize {
        self.options.peers.len()
    }

    fn isend(&self, dest: Rank, tag: Tag, payload: Payload) -> Result<Box<dyn Request>> {
        if dest >= self.world_size() {
            return Err(Error::InvalidRank {
                rank: dest,
                world_size: self.world_size(),
            });
        }
        if payload.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        let len = payload.len();
        if dest == self.options.rank {
            let accepted = self.inbox.push(Frame {
                source: dest,
                tag,
                payload: payload.to_vec(),
            });
            let completion = if accepted {
                Completion::sent(dest, len)
            } else {
                Completion::failed(dest)
            };
            return Ok(Box::new(CompletedRequest::new(completion)));
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(
            dest,
            Outgoing {
                tag,
                payload,
                done: done_tx,
            },
        )?;

        Ok(Box::new(TcpSend {
            source: self.options.rank,
            dest,
            done: Some(done_rx),
        }))
    }

    fn irecv(&self, tag: Tag, buffer: Vec<u8>) -> Box<dyn Request> {
        Box::new(TcpRecv {
            inbox: Arc::clone(&self.inbox),
            tag,
            buffer: Some(buffer),
        })
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.links.lock().clear();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────

struct TcpSend {
    source: Rank,
    dest: Rank,
    done: Option<oneshot::Receiver<std::result::Result<usize, String>>>,
}

impl Request for TcpSend {
    fn test(&mut self) -> Option<Completion> {
        let done = self.done.as_mut()?;
        let completion = match done.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Ok(Ok(len)) => Completion::sent(self.source, len),
            Ok(Err(message)) => {
                error!(dest = self.dest, error = %message, "TCP send failed");
                Completion::failed(self.source)
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                error!(dest = self.dest, "TCP link dropped a queued send");
                Completion::failed(self.source)
            }
        };
        self.done = None;
        Some(completion)
    }
}

struct TcpRecv {
    inbox: Arc<Inbox>,
    tag: Tag,
    buffer: Option<Vec<u8>>,
}

impl Request for TcpRecv {
    fn test(&mut self) -> Option<Completion> {
        self.buffer.as_ref()?;
        let frame = self.inbox.take(self.tag)?;
        let buffer = self.buffer.take()?;
        Some(fill_buffer(frame.source, &frame.payload, buffer))
    }
}

// ─────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────

/// Accept inbound connections and spawn a reader for each
async fn accept_loop(listener: TcpListener, inbox: Arc<Inbox>, world_size: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(peer_addr = %peer_addr, "Inbound connection");
                let inbox = Arc::clone(&inbox);
                tokio::spawn(async move {
                    if let Err(e) = read_loop(stream, inbox, world_size).await {
                        debug!(peer_addr = %peer_addr, error = %e, "Inbound connection closed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read the handshake, then frames until the peer goes away
async fn read_loop(mut stream: TcpStream, inbox: Arc<Inbox>, world_size: usize) -> anyhow::Result<()> {
    let source = read_handshake(&mut stream, world_size).await?;
    debug!(source, "Peer handshake complete");

    loop {
        let tag = stream.read_u32().await?;
        let len = stream.read_u32().await? as usize;
        if len > MAX_FRAME_BYTES {
            return Err(anyhow::anyhow!(
                "frame too large: {} bytes (max {})",
                len,
                MAX_FRAME_BYTES
            ));
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        inbox.push(Frame {
            source,
            tag,
            payload,
        });
    }
}

/// Read `[magic][rank]` and return the announced rank
async fn read_handshake<R>(stream: &mut R, world_size: usize) -> Result<Rank>
where
    R: AsyncRead + Unpin,
{
    let magic = stream.read_u32().await?;
    if magic != HANDSHAKE_MAGIC {
        return Err(Error::Handshake(format!("bad magic {:#x}", magic)));
    }
    let source = stream.read_u32().await? as Rank;
    if source >= world_size {
        return Err(Error::Handshake(format!(
            "unknown rank {} (world_size {})",
            source, world_size
        )));
    }
    Ok(source)
}

/// Connect with exponential backoff, bounded by time and attempt count
async fn connect(
    dest: Rank,
    addr: SocketAddr,
    timeout: Duration,
    max_attempts: u32,
) -> anyhow::Result<TcpStream> {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(20),
        max_interval: Duration::from_secs(1),
        max_elapsed_time: Some(timeout),
        ..Default::default()
    };

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                if max_attempts > 0 && attempts >= max_attempts {
                    return Err(anyhow::anyhow!("{} connect attempts failed: {}", attempts, e));
                }
                match backoff.next_backoff() {
                    Some(delay) => {
                        debug!(dest, attempt = attempts, ?delay, error = %e, "Connect failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(anyhow::anyhow!("connect timed out after {:?}: {}", timeout, e));
                    }
                }
            }
        }
    }
}

/// Own the outbound connection to `dest` and write queued frames in order
async fn link_loop(
    rank: Rank,
    dest: Rank,
    addr: SocketAddr,
    timeout: Duration,
    max_attempts: u32,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let mut stream = match connect(dest, addr, timeout, max_attempts).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(dest, addr = %addr, error = %e, "Peer unreachable");
            fail_queued(&mut rx, &e.to_string());
            return;
        }
    };

    if let Err(e) = write_handshake(&mut stream, rank).await {
        warn!(dest, error = %e, "Handshake write failed");
        fail_queued(&mut rx, &e.to_string());
        return;
    }
    debug!(dest, addr = %addr, "Link established");

    while let Some(outgoing) = rx.recv().await {
        match write_frame(&mut stream, outgoing.tag, &outgoing.payload).await {
            Ok(()) => {
                let _ = outgoing.done.send(Ok(outgoing.payload.len()));
            }
            Err(e) => {
                warn!(dest, error = %e, "Link write failed");
                let _ = outgoing.done.send(Err(e.to_string()));
                fail_queued(&mut rx, &e.to_string());
                return;
            }
        }
    }
}

fn fail_queued(rx: &mut mpsc::UnboundedReceiver<Outgoing>, reason: &str) {
    rx.close();
    while let Ok(outgoing) = rx.try_recv() {
        let _ = outgoing.done.send(Err(reason.to_string()));
    }
}

async fn write_handshake(stream: &mut TcpStream, rank: Rank) -> anyhow::Result<()> {
    stream.write_u32(HANDSHAKE_MAGIC).await?;
    stream.write_u32(u32::try_from(rank)?).await?;
    stream.flush().await?;
    Ok(())
}

async fn write_frame(stream: &mut TcpStream, tag: Tag, payload: &[u8]) -> anyhow::Result<()> {
    stream.write_u32(tag).await?;
    stream.write_u32(u32::try_from(payload.len())?).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn loopback_pair() -> (TcpTransport, TcpTransport) {
        let l0 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let l1 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peers = vec![l0.local_addr().unwrap(), l1.local_addr().unwrap()];

        let t0 = TcpTransport::from_listener(TcpOptions::new(0, peers.clone()), l0).unwrap();
        let t1 = TcpTransport::from_listener(TcpOptions::new(1, peers), l1).unwrap();
        (t0, t1)
    }

    fn wait_for(req: &mut Box<dyn Request>) -> Completion {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(done) = req.test() {
                return done;
            }
            assert!(Instant::now() < deadline, "request did not complete");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_send_and_receive_over_loopback() {
        let (t0, t1) = loopback_pair();

        let mut send = t1.isend(0, CHANNEL_TAG, Arc::from(&b"gradient"[..])).unwrap();
        let mut recv = t0.irecv(CHANNEL_TAG, vec![0; 64]);

        let sent = wait_for(&mut send);
        assert!(sent.ok);
        assert_eq!(sent.len, 8);

        let got = wait_for(&mut recv);
        assert!(got.ok);
        assert_eq!(got.source, 1);
        assert_eq!(&got.buffer.unwrap()[..got.len], b"gradient");
    }

    #[test]
    fn test_frames_from_one_sender_arrive_in_order() {
        let (t0, t1) = loopback_pair();

        for i in 0..5u8 {
            t0.isend(1, CHANNEL_TAG, Arc::from(&[i][..])).unwrap();
        }

        for i in 0..5u8 {
            let mut recv = t1.irecv(CHANNEL_TAG, vec![0; 4]);
            let got = wait_for(&mut recv);
            assert_eq!(got.buffer.unwrap()[0], i);
        }
    }

    #[test]
    fn test_self_send_short_circuits() {
        let (t0, _t1) = loopback_pair();

        let mut send = t0.isend(0, CHANNEL_TAG, Arc::from(&b"me"[..])).unwrap();
        assert!(send.test().unwrap().ok);

        let got = t0.irecv(CHANNEL_TAG, vec![0; 4]).test().unwrap();
        assert_eq!(got.source, 0);
        assert_eq!(got.len, 2);
    }

    #[test]
    fn test_unreachable_peer_fails_send() {
        let l0 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        // Reserve a port then free it so nothing listens there
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let peers = vec![l0.local_addr().unwrap(), dead];

        let mut options = TcpOptions::new(0, peers);
        options.max_connect_attempts = 2;
        options.connect_timeout = Duration::from_millis(200);
        let t0 = TcpTransport::from_listener(options, l0).unwrap();

        let mut send = t0.isend(1, CHANNEL_TAG, Arc::from(&b"x"[..])).unwrap();
        assert!(!wait_for(&mut send).ok);
    }

    #[test]
    fn test_foreign_channel_frames_are_dropped() {
        let (t0, t1) = loopback_pair();

        t1.isend(0, 7, Arc::from(&b"stray"[..])).unwrap();
        t1.isend(0, CHANNEL_TAG, Arc::from(&b"params"[..])).unwrap();

        // Same link, so the stray frame was read first
        let got = wait_for(&mut t0.irecv(CHANNEL_TAG, vec![0; 16]));
        assert_eq!(&got.buffer.unwrap()[..got.len], b"params");
        assert_eq!(t0.queued(), 0);

        let mut own = t0.isend(0, 7, Arc::from(&b"stray"[..])).unwrap();
        assert!(!own.test().unwrap().ok);
        assert_eq!(t0.queued(), 0);
    }

    #[tokio::test]
    async fn test_handshake_checks_magic_and_rank() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(HANDSHAKE_MAGIC).await.unwrap();
        client.write_u32(1).await.unwrap();
        assert_eq!(read_handshake(&mut server, 2).await.unwrap(), 1);

        client.write_u32(0xdead_beef).await.unwrap();
        client.write_u32(0).await.unwrap();
        assert!(matches!(
            read_handshake(&mut server, 2).await,
            Err(Error::Handshake(_))
        ));

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(HANDSHAKE_MAGIC).await.unwrap();
        client.write_u32(5).await.unwrap();
        let err = read_handshake(&mut server, 2).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::HandshakeFailed);
    }

    #[test]
    fn test_rejects_out_of_range_rank() {
        let (t0, _t1) = loopback_pair();
        assert!(matches!(
            t0.isend(2, CHANNEL_TAG, Arc::from(&b"x"[..])),
            Err(Error::InvalidRank { rank: 2, .. })
        ));
    }
}

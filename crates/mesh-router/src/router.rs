//! Router: handshake, multiplex by chain coordinate, accept/request.
//!
//! The router owns raw transport sockets. After a symmetric handshake
//! negotiates the set of shared chain coordinates, the socket is split
//! into per-coordinate connection views and each view is enqueued on that
//! coordinate's accept queue. A single socket serves all overlapping
//! coordinates; payload frames are tagged with their coordinate.

use crate::addr::strip_port;
use crate::coord::{coord_set_hash, ChainCoord};
use crate::evil::{EvilDeltas, EvilNodeManager, EvilReason, PhysicalConnStore};
use crate::handshake::{
    read_frame, read_header, write_frame, write_header, DataCodec, HandshakeFrame,
};
use crate::timed_map::TimedMap;
use crate::transport::{Transport, TransportConn, TransportStream};
use crate::{RouterError, RouterResult};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Capacity of a coordinate's accept queue.
const ACCEPT_BACKLOG: usize = 128;

/// Capacity of per-socket frame channels.
const FRAME_BACKLOG: usize = 256;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transport selector and local host, `scheme:host`.
    pub network: String,
    /// Listen port.
    pub port: u16,
    /// Path for the physical-connection store.
    pub store_path: String,
    /// Evil-score threshold at which a host is refused.
    pub ban_evil_score: u16,
    /// Handshake deadline; also the dial-dedup TTL.
    pub handshake_timeout: Duration,
}

impl Config {
    pub fn new(network: impl Into<String>, port: u16, store_path: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            port,
            store_path: store_path.into(),
            ban_evil_score: 100,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

struct AcceptQueue {
    tx: mpsc::Sender<(RouterConn, Duration)>,
    rx: Mutex<mpsc::Receiver<(RouterConn, Duration)>>,
}

struct RouterInner {
    conf: Config,
    transport: Transport,
    local_addr: String,
    evil: EvilNodeManager,
    listens: RwLock<Vec<ChainCoord>>,
    accepts: DashMap<ChainCoord, Arc<AcceptQueue>>,
    /// Collapses concurrent dials to the same address.
    dials: TimedMap<String, ()>,
    /// Measured ping per `addr|coord`, bounded by the handshake TTL.
    pings: TimedMap<String, Duration>,
    shutdown: watch::Sender<bool>,
}

impl RouterInner {
    fn queue(&self, coord: ChainCoord) -> Arc<AcceptQueue> {
        self.accepts
            .entry(coord)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
                Arc::new(AcceptQueue {
                    tx,
                    rx: Mutex::new(rx),
                })
            })
            .clone()
    }
}

/// Multiplexed connection fabric keyed by chain coordinate.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router: opens the physical-connection store, binds the
    /// transport listener and starts accepting sockets.
    pub async fn new(conf: Config) -> RouterResult<Router> {
        let transport = Transport::parse(&conf.network)?;
        let local_addr = format!("{}:{}", transport.localhost(), conf.port);

        let store = PhysicalConnStore::open(&conf.store_path)?;
        let evil = EvilNodeManager::new(store, EvilDeltas::default(), conf.ban_evil_score);

        let mut listener = transport.listen(conf.port).await?;
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(RouterInner {
            dials: TimedMap::new(conf.handshake_timeout, 16),
            pings: TimedMap::new(conf.handshake_timeout, 64),
            conf,
            transport,
            local_addr,
            evil,
            listens: RwLock::new(Vec::new()),
            accepts: DashMap::new(),
            shutdown,
        });

        let listen_inner = inner.clone();
        let mut shutdown_rx = inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    res = listener.accept() => match res {
                        Ok(conn) => {
                            debug!(
                                local = %listen_inner.local_addr,
                                remote = %conn.remote_addr,
                                "inbound connection"
                            );
                            let inner = listen_inner.clone();
                            tokio::spawn(async move {
                                run_handshake(inner, conn).await;
                            });
                        }
                        Err(RouterError::Closed) => break,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                        }
                    },
                }
            }
        });

        info!(addr = %inner.local_addr, "router started");
        Ok(Router { inner })
    }

    /// Register a chain coordinate and start its accept queue. Idempotent.
    pub fn add_listen(&self, coord: ChainCoord) {
        {
            let mut listens = self.inner.listens.write();
            if !listens.contains(&coord) {
                listens.push(coord);
            }
        }
        self.inner.queue(coord);
    }

    /// Block until a connection appears on `coord`, or the router shuts
    /// down. The queue is registered implicitly, so call order against
    /// [`Router::add_listen`] does not matter.
    pub async fn accept(&self, coord: ChainCoord) -> RouterResult<(RouterConn, Duration)> {
        let queue = self.inner.queue(coord);
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Err(RouterError::Closed);
        }

        let mut rx = queue.rx.lock().await;
        tokio::select! {
            item = rx.recv() => item.ok_or(RouterError::Closed),
            _ = shutdown_rx.changed() => Err(RouterError::Closed),
        }
    }

    /// Initiate an outbound connection to `addr`.
    ///
    /// Fails fast on policy: the local host, or a host this node has
    /// marked evil. Transport errors propagate. Concurrent requests for
    /// the same address collapse to one dial.
    pub async fn request(&self, addr: &str, coord: ChainCoord) -> RouterResult<()> {
        let host = strip_port(addr)?;
        let local = self.localhost();
        if !local.is_empty() && host == local {
            return Err(RouterError::CannotRequestToLocal);
        }
        if self.inner.evil.is_ban_node(addr) {
            return Err(RouterError::DoNotRequestToEvelNode);
        }
        if self.inner.dials.load_or_store(addr.to_string(), ()).is_some() {
            debug!(addr = %addr, "dial already pending");
            return Ok(());
        }

        debug!(local = %self.inner.local_addr, addr = %addr, coord = %coord, "requesting");
        let conn = match self
            .inner
            .transport
            .dial(addr, &self.inner.local_addr, self.inner.conf.handshake_timeout)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                // Let the next attempt dial for real instead of hitting
                // the dedup entry.
                self.inner.dials.delete(&addr.to_string());
                return Err(e);
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_handshake(inner, conn).await;
        });
        Ok(())
    }

    /// Evil-node accounting for this router.
    pub fn evil_node_manager(&self) -> &EvilNodeManager {
        &self.inner.evil
    }

    /// Additive, persisted misbehavior report from higher layers.
    pub fn update_evil_score(&self, addr: &str, delta: u16) {
        self.inner.evil.update_evil_score(addr, delta);
    }

    /// Host portion of the configured network.
    pub fn localhost(&self) -> &str {
        self.inner.transport.localhost()
    }

    /// This node's `host:port`.
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Configuration snapshot.
    pub fn conf(&self) -> &Config {
        &self.inner.conf
    }

    /// Last measured ping to `addr` on `coord`, while the handshake cache
    /// still holds it.
    pub fn ping_time(&self, addr: &str, coord: ChainCoord) -> Option<Duration> {
        self.inner.pings.load(&ping_key(addr, coord))
    }

    /// Shut down: stops the listener and unblocks all `accept` calls with
    /// a terminal error.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

fn ping_key(addr: &str, coord: ChainCoord) -> String {
    format!("{}|{}", addr, coord)
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

async fn run_handshake(inner: Arc<RouterInner>, conn: TransportConn) {
    let remote = conn.remote_addr.clone();
    let deadline = inner.conf.handshake_timeout;

    match tokio::time::timeout(deadline, perform_handshake(&inner, conn)).await {
        Ok(Ok(())) => {}
        Ok(Err(RouterError::NoCommonCoordinate)) => {
            debug!(remote = %remote, "no common coordinate");
        }
        Ok(Err(e @ RouterError::HandshakeFailed(_))) => {
            warn!(remote = %remote, error = %e, "handshake protocol violation");
            inner.evil.tell_on(&remote, EvilReason::ProtocolViolation);
        }
        Ok(Err(e)) => {
            debug!(remote = %remote, error = %e, "handshake error");
        }
        Err(_) => {
            debug!(remote = %remote, "handshake timed out");
        }
    }
}

/// Symmetric 2-RTT handshake. Both sides send a header and Hello
/// immediately, acknowledge the peer's Hello, and measure ping as half
/// the Hello -> HelloAck round trip.
async fn perform_handshake(inner: &Arc<RouterInner>, mut conn: TransportConn) -> RouterResult<()> {
    let ours: Vec<ChainCoord> = inner.listens.read().clone();

    write_header(&mut conn.stream, coord_set_hash(&ours)).await?;
    let nonce = now_nanos();
    write_frame(
        &mut conn.stream,
        &HandshakeFrame::Hello {
            coords: ours.clone(),
            nonce,
        },
    )
    .await?;
    let sent = Instant::now();

    let _their_hash = read_header(&mut conn.stream).await?;

    let mut their_coords: Option<Vec<ChainCoord>> = None;
    let mut ping: Option<Duration> = None;

    while their_coords.is_none() || ping.is_none() {
        match read_frame(&mut conn.stream).await? {
            HandshakeFrame::Hello {
                coords,
                nonce: their_nonce,
            } => {
                write_frame(
                    &mut conn.stream,
                    &HandshakeFrame::HelloAck {
                        nonce: their_nonce,
                        coords: ours.clone(),
                    },
                )
                .await?;
                their_coords = Some(coords);
            }
            HandshakeFrame::HelloAck { nonce: echoed, coords } => {
                if echoed != nonce {
                    return Err(RouterError::HandshakeFailed("nonce mismatch".into()));
                }
                ping = Some(sent.elapsed() / 2);
                if their_coords.is_none() {
                    their_coords = Some(coords);
                }
            }
            HandshakeFrame::Bye => return Err(RouterError::NoCommonCoordinate),
        }
    }

    let theirs = their_coords.unwrap_or_default();
    let ping = ping.unwrap_or_default().max(Duration::from_nanos(1));
    let common: Vec<ChainCoord> = ours
        .iter()
        .filter(|c| theirs.contains(c))
        .copied()
        .collect();

    if common.is_empty() {
        let _ = write_frame(&mut conn.stream, &HandshakeFrame::Bye).await;
        return Err(RouterError::NoCommonCoordinate);
    }

    debug!(
        local = %conn.local_addr,
        remote = %conn.remote_addr,
        coords = common.len(),
        ping_us = ping.as_micros() as u64,
        "handshake complete"
    );
    spawn_socket(inner, conn, common, ping);
    Ok(())
}

/// Turn a handshaken socket into per-coordinate connection views and
/// enqueue each on its accept queue.
fn spawn_socket(
    inner: &Arc<RouterInner>,
    conn: TransportConn,
    common: Vec<ChainCoord>,
    ping: Duration,
) {
    let TransportConn {
        stream,
        local_addr,
        remote_addr,
    } = conn;

    let framed = Framed::new(stream, DataCodec::new());
    let (sink, frames) = framed.split();

    let (out_tx, out_rx) = mpsc::channel::<(ChainCoord, Bytes)>(FRAME_BACKLOG);
    let routes: Arc<DashMap<ChainCoord, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());

    tokio::spawn(write_loop(sink, out_rx, routes.clone()));
    tokio::spawn(read_loop(
        inner.clone(),
        frames,
        routes.clone(),
        remote_addr.clone(),
    ));

    for coord in common {
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(FRAME_BACKLOG);
        routes.insert(coord, in_tx);

        let view = RouterConn {
            coord,
            local_addr: local_addr.clone(),
            remote_addr: remote_addr.clone(),
            net_addr: remote_addr.clone(),
            out: out_tx.clone(),
            inbox: in_rx,
            routes: routes.clone(),
        };

        inner.pings.store(ping_key(&remote_addr, coord), ping);

        let queue = inner.queue(coord);
        if let Err(e) = queue.tx.try_send((view, ping)) {
            warn!(coord = %coord, error = %e, "accept queue full, dropping connection view");
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<Framed<TransportStream, DataCodec>, (ChainCoord, Bytes)>,
    mut rx: mpsc::Receiver<(ChainCoord, Bytes)>,
    routes: Arc<DashMap<ChainCoord, mpsc::Sender<Bytes>>>,
) {
    while let Some(item) = rx.recv().await {
        if let Err(e) = sink.send(item).await {
            debug!(error = %e, "socket write failed");
            // A write error tears every coordinate view down the same
            // way a read error does; pending recv calls must not hang.
            routes.clear();
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Arc<RouterInner>,
    mut frames: SplitStream<Framed<TransportStream, DataCodec>>,
    routes: Arc<DashMap<ChainCoord, mpsc::Sender<Bytes>>>,
    remote_addr: String,
) {
    while let Some(res) = frames.next().await {
        match res {
            Ok((coord, payload)) => {
                let tx = routes.get(&coord).map(|entry| entry.value().clone());
                match tx {
                    Some(tx) => {
                        if tx.send(payload).await.is_err() {
                            routes.remove(&coord);
                        }
                    }
                    None => {
                        debug!(remote = %remote_addr, coord = %coord, "frame for unknown coordinate");
                    }
                }
            }
            Err(e) => {
                // A framing error is the remote talking garbage; an IO
                // error is just the link going away.
                if matches!(e, RouterError::HandshakeFailed(_)) {
                    warn!(remote = %remote_addr, error = %e, "protocol violation on socket");
                    inner.evil.tell_on(&remote_addr, EvilReason::ProtocolViolation);
                } else {
                    debug!(remote = %remote_addr, error = %e, "socket read failed");
                }
                break;
            }
        }
    }
    // Dropping the route senders wakes every connection view with EOF.
    routes.clear();
}

/// A logical connection: one chain coordinate's view of a shared socket.
///
/// Dropping a view detaches it; when the last view of a socket goes away,
/// the socket closes through channel teardown.
pub struct RouterConn {
    coord: ChainCoord,
    local_addr: String,
    remote_addr: String,
    net_addr: String,
    out: mpsc::Sender<(ChainCoord, Bytes)>,
    inbox: mpsc::Receiver<Bytes>,
    routes: Arc<DashMap<ChainCoord, mpsc::Sender<Bytes>>>,
}

impl RouterConn {
    /// Send one payload frame, tagged with this view's coordinate.
    pub async fn send(&self, payload: Bytes) -> RouterResult<()> {
        self.out
            .send((self.coord, payload))
            .await
            .map_err(|_| RouterError::Closed)
    }

    /// Receive the next payload frame for this coordinate.
    pub async fn recv(&mut self) -> RouterResult<Bytes> {
        self.inbox.recv().await.ok_or(RouterError::Closed)
    }

    /// Detach this view from the socket. When the last view detaches, the
    /// socket closes.
    pub fn close(&mut self) {
        self.routes.remove(&self.coord);
        self.inbox.close();
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (ConnSender, ConnReceiver) {
        let RouterConn {
            coord,
            local_addr,
            remote_addr,
            net_addr,
            out,
            inbox,
            routes,
        } = self;
        (
            ConnSender {
                coord,
                local_addr,
                remote_addr,
                net_addr,
                out,
            },
            ConnReceiver {
                coord,
                inbox,
                routes,
            },
        )
    }

    pub fn coord(&self) -> ChainCoord {
        self.coord
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Canonical dialable address of the remote.
    pub fn net_addr(&self) -> &str {
        &self.net_addr
    }
}

/// Sending half of a [`RouterConn`].
#[derive(Clone)]
pub struct ConnSender {
    coord: ChainCoord,
    local_addr: String,
    remote_addr: String,
    net_addr: String,
    out: mpsc::Sender<(ChainCoord, Bytes)>,
}

impl ConnSender {
    /// Send one payload frame.
    pub async fn send(&self, payload: Bytes) -> RouterResult<()> {
        self.out
            .send((self.coord, payload))
            .await
            .map_err(|_| RouterError::Closed)
    }

    /// Non-blocking send; fails when the socket write queue is full.
    pub fn try_send(&self, payload: Bytes) -> RouterResult<()> {
        self.out
            .try_send((self.coord, payload))
            .map_err(|_| RouterError::Closed)
    }

    pub fn coord(&self) -> ChainCoord {
        self.coord
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn net_addr(&self) -> &str {
        &self.net_addr
    }
}

/// Receiving half of a [`RouterConn`].
pub struct ConnReceiver {
    coord: ChainCoord,
    inbox: mpsc::Receiver<Bytes>,
    routes: Arc<DashMap<ChainCoord, mpsc::Sender<Bytes>>>,
}

impl ConnReceiver {
    /// Receive the next payload frame.
    pub async fn recv(&mut self) -> RouterResult<Bytes> {
        self.inbox.recv().await.ok_or(RouterError::Closed)
    }

    /// Detach from the socket.
    pub fn close(&mut self) {
        self.routes.remove(&self.coord);
        self.inbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let conf = Config::new("mock:conf", 3000, "/tmp/conf");
        assert_eq!(conf.ban_evil_score, 100);
        assert_eq!(conf.handshake_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_request_to_unparseable_addr() {
        let tmp = tempfile::TempDir::new().unwrap();
        let conf = Config::new("mock:noport", 3100, tmp.path().to_str().unwrap());
        let router = Router::new(conf).await.unwrap();

        let err = router
            .request("hostwithoutport", ChainCoord::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NotFoundPort));
    }
}

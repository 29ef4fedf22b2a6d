//! An established peer connection.
//!
//! A `Peer` owns one coordinate view of a router socket. Outgoing messages
//! go through a bounded queue drained by a writer task, so broadcast
//! fan-out never blocks on a slow peer. A reader task parses the type
//! prefix off every payload and hands it to the manager-supplied receive
//! callback. The peer never retains a reference to its manager; the
//! manager passes its delete and receive hooks in as plain callbacks.

use crate::message::{encode_message, read_message_type, Message, MessageType};
use crate::{PeerError, PeerResult};
use bytes::Bytes;
use mesh_router::RouterConn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Bound on the per-peer send queue.
const SEND_QUEUE: usize = 256;

/// Called exactly once when the peer goes away.
pub type DeletePeerFn = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;

/// Called for every received message.
pub type OnRecvFn = Arc<dyn Fn(&Arc<Peer>, MessageType, Bytes) -> PeerResult<()> + Send + Sync>;

/// An established, handshaken connection handled by the peer manager.
pub struct Peer {
    sender: mesh_router::ConnSender,
    ping_time: Duration,
    connected_time: u64,
    send_tx: mpsc::Sender<Bytes>,
    close_tx: watch::Sender<bool>,
    deleted: AtomicBool,
}

impl Peer {
    /// Wrap a router connection and start its IO tasks.
    pub fn new(
        conn: RouterConn,
        ping_time: Duration,
        delete: DeletePeerFn,
        on_recv: OnRecvFn,
    ) -> Arc<Peer> {
        let (sender, mut receiver) = conn.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Bytes>(SEND_QUEUE);
        let (close_tx, _) = watch::channel(false);

        let connected_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let peer = Arc::new(Peer {
            sender: sender.clone(),
            ping_time,
            connected_time,
            send_tx,
            close_tx,
            deleted: AtomicBool::new(false),
        });

        // Writer: drain the bounded queue into the socket.
        let mut close_rx = peer.close_tx.subscribe();
        let writer_weak = Arc::downgrade(&peer);
        tokio::spawn(async move {
            loop {
                if *close_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = close_rx.changed() => {}
                    msg = send_rx.recv() => match msg {
                        Some(bytes) => {
                            if sender.send(bytes).await.is_err() {
                                // The socket is gone for writing; close
                                // the peer so the reader runs teardown.
                                if let Some(peer) = writer_weak.upgrade() {
                                    peer.close();
                                }
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader: parse the type prefix and dispatch. Exits on close or
        // socket teardown, then fires the delete callback once.
        let weak = Arc::downgrade(&peer);
        let mut close_rx = peer.close_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *close_rx.borrow() {
                    break;
                }
                let payload = tokio::select! {
                    _ = close_rx.changed() => continue,
                    res = receiver.recv() => match res {
                        Ok(payload) => payload,
                        Err(_) => break,
                    },
                };

                let Some(peer) = weak.upgrade() else { break };
                let mut payload = payload;
                let msg_type = match read_message_type(&mut payload) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(peer = %peer.id(), error = %e, "malformed payload");
                        continue;
                    }
                };

                if let Err(e) = (on_recv)(&peer, msg_type, payload) {
                    match e {
                        PeerError::UnknownMessage => {
                            debug!(peer = %peer.id(), msg = %msg_type, "message not handled");
                        }
                        e => {
                            warn!(peer = %peer.id(), msg = %msg_type, error = %e, "recv handler failed");
                        }
                    }
                }
            }

            receiver.close();
            // If the last strong reference is already gone, the peer was
            // never (or no longer is) in any map; nothing to delete.
            if let Some(peer) = weak.upgrade() {
                peer.close();
                if !peer.deleted.swap(true, Ordering::SeqCst) {
                    (delete)(&peer);
                }
            }
        });

        peer
    }

    /// Queue a message for sending. Never blocks; fails when the queue is
    /// full or the peer is closed.
    pub fn send(&self, m: &dyn Message) -> PeerResult<()> {
        if self.is_closed() {
            return Err(PeerError::PeerClosed);
        }
        let bytes = encode_message(m);
        self.send_tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => PeerError::PeerClosed,
        })
    }

    /// Close the peer. Idempotent; wakes the IO tasks, which fire the
    /// delete callback exactly once.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// True once `close` was called or the socket went away.
    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Canonical dialable address of the remote; also the peer's identity.
    pub fn net_addr(&self) -> &str {
        self.sender.net_addr()
    }

    /// The peer's identity.
    pub fn id(&self) -> &str {
        self.net_addr()
    }

    pub fn local_addr(&self) -> &str {
        self.sender.local_addr()
    }

    pub fn remote_addr(&self) -> &str {
        self.sender.remote_addr()
    }

    /// Half round trip measured during the handshake.
    pub fn ping_time(&self) -> Duration {
        self.ping_time
    }

    /// Nanoseconds since the epoch at which the peer was wrapped.
    pub fn connected_time(&self) -> u64 {
        self.connected_time
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("net_addr", &self.net_addr())
            .field("local_addr", &self.local_addr())
            .field("ping_time", &self.ping_time)
            .field("closed", &self.is_closed())
            .finish()
    }
}

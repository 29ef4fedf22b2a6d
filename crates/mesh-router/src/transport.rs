//! Transport abstraction.
//!
//! The router is parameterized over a transport that yields bidirectional,
//! reliable, ordered byte streams keyed by a string address. Two transports
//! exist: real TCP (`tcp:host`) and an in-process mock (`mock:name`) used
//! by tests, where dialing `name:port` resolves through a process-global
//! registry of duplex links.

use crate::{RouterError, RouterResult};
use dashmap::DashMap;
use std::io;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

const MOCK_LINK_BUFFER: usize = 256 * 1024;
const MOCK_BACKLOG: usize = 64;

struct MockDial {
    stream: DuplexStream,
    /// The dialer's canonical listen address, so the accept side sees a
    /// dialable remote rather than an ephemeral one.
    remote_addr: String,
}

fn mock_registry() -> &'static DashMap<String, mpsc::Sender<MockDial>> {
    static REGISTRY: OnceLock<DashMap<String, mpsc::Sender<MockDial>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Network transport selected from the `scheme:host` config string.
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp { host: String },
    Mock { host: String },
}

impl Transport {
    /// Parse a `scheme:host` network string.
    pub fn parse(network: &str) -> RouterResult<Self> {
        let (scheme, host) = network
            .split_once(':')
            .ok_or_else(|| RouterError::InvalidNetwork(network.to_string()))?;
        match scheme {
            "tcp" => Ok(Transport::Tcp {
                host: host.to_string(),
            }),
            "mock" => Ok(Transport::Mock {
                host: host.to_string(),
            }),
            _ => Err(RouterError::InvalidNetwork(network.to_string())),
        }
    }

    /// Host portion of the configured network.
    pub fn localhost(&self) -> &str {
        match self {
            Transport::Tcp { host } | Transport::Mock { host } => host,
        }
    }

    /// Bind a listener on the configured host and `port`.
    pub async fn listen(&self, port: u16) -> RouterResult<Listener> {
        match self {
            Transport::Tcp { host } => {
                let bind = format!("{}:{}", host, port);
                let listener = TcpListener::bind(&bind).await?;
                debug!(addr = %bind, "tcp transport listening");
                Ok(Listener::Tcp {
                    listener,
                    local_addr: bind,
                })
            }
            Transport::Mock { host } => {
                let local_addr = format!("{}:{}", host, port);
                let (tx, rx) = mpsc::channel(MOCK_BACKLOG);
                mock_registry().insert(local_addr.clone(), tx);
                debug!(addr = %local_addr, "mock transport listening");
                Ok(Listener::Mock { rx, local_addr })
            }
        }
    }

    /// Dial `addr`, presenting `local_addr` as this node's canonical
    /// address.
    pub async fn dial(
        &self,
        addr: &str,
        local_addr: &str,
        timeout: Duration,
    ) -> RouterResult<TransportConn> {
        match self {
            Transport::Tcp { .. } => {
                let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| RouterError::Timeout(format!("dial {}", addr)))??;
                let local = stream
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| local_addr.to_string());
                Ok(TransportConn {
                    stream: TransportStream::Tcp(stream),
                    local_addr: local,
                    remote_addr: addr.to_string(),
                })
            }
            Transport::Mock { .. } => {
                let tx = mock_registry()
                    .get(addr)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| {
                        RouterError::Io(io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            format!("no mock listener at {}", addr),
                        ))
                    })?;

                let (ours, theirs) = tokio::io::duplex(MOCK_LINK_BUFFER);
                tx.send(MockDial {
                    stream: theirs,
                    remote_addr: local_addr.to_string(),
                })
                .await
                .map_err(|_| {
                    RouterError::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("mock listener at {} is gone", addr),
                    ))
                })?;

                Ok(TransportConn {
                    stream: TransportStream::Mock(ours),
                    local_addr: local_addr.to_string(),
                    remote_addr: addr.to_string(),
                })
            }
        }
    }
}

/// A bound transport listener.
pub enum Listener {
    Tcp {
        listener: TcpListener,
        local_addr: String,
    },
    Mock {
        rx: mpsc::Receiver<MockDial>,
        local_addr: String,
    },
}

impl Listener {
    /// Accept the next inbound stream.
    pub async fn accept(&mut self) -> RouterResult<TransportConn> {
        match self {
            Listener::Tcp {
                listener,
                local_addr,
            } => {
                let (stream, peer) = listener.accept().await?;
                Ok(TransportConn {
                    stream: TransportStream::Tcp(stream),
                    local_addr: local_addr.clone(),
                    remote_addr: peer.to_string(),
                })
            }
            Listener::Mock { rx, local_addr } => {
                let dial = rx.recv().await.ok_or(RouterError::Closed)?;
                Ok(TransportConn {
                    stream: TransportStream::Mock(dial.stream),
                    local_addr: local_addr.clone(),
                    remote_addr: dial.remote_addr,
                })
            }
        }
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> &str {
        match self {
            Listener::Tcp { local_addr, .. } | Listener::Mock { local_addr, .. } => local_addr,
        }
    }
}

/// An established transport stream with address metadata.
pub struct TransportConn {
    pub stream: TransportStream,
    pub local_addr: String,
    pub remote_addr: String,
}

/// Byte stream over either transport.
pub enum TransportStream {
    Tcp(TcpStream),
    Mock(DuplexStream),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Mock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Mock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Mock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Mock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_network() {
        assert!(matches!(
            Transport::parse("mock:test1"),
            Ok(Transport::Mock { .. })
        ));
        assert!(matches!(
            Transport::parse("tcp:0.0.0.0"),
            Ok(Transport::Tcp { .. })
        ));
        assert!(Transport::parse("carrier-pigeon").is_err());
        assert!(Transport::parse("udp:0.0.0.0").is_err());
    }

    #[tokio::test]
    async fn test_mock_dial_and_accept() {
        let t1 = Transport::parse("mock:transport-a").unwrap();
        let t2 = Transport::parse("mock:transport-b").unwrap();

        let mut listener = t1.listen(4000).await.unwrap();
        let mut dialed = t2
            .dial("transport-a:4000", "transport-b:4000", Duration::from_secs(1))
            .await
            .unwrap();

        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.remote_addr, "transport-b:4000");
        assert_eq!(dialed.remote_addr, "transport-a:4000");

        dialed.stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_mock_dial_refused_when_no_listener() {
        let t = Transport::parse("mock:transport-c").unwrap();
        let err = t
            .dial("nowhere:4001", "transport-c:4001", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Io(_)));
    }
}

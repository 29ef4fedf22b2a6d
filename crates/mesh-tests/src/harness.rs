//! Test harness: routers, managed nodes and a counting test message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mesh_peer::{
    Config as PeerConfig, EventHandler, Manager, Message, MessageType, Peer, PeerError, PeerResult,
};
use mesh_router::{ChainCoord, Config as RouterConfig, Router};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

/// The all-zero chain coordinate used throughout the tests.
pub fn zero_coord() -> ChainCoord {
    ChainCoord::default()
}

/// A router over the mock transport with its own store directory.
pub struct TestRouter {
    pub router: Router,
    _store: TempDir,
}

impl TestRouter {
    /// Create a router on `mock:<name>` listening on `port`.
    pub async fn new(name: &str, port: u16) -> Self {
        let store = TempDir::new().expect("temp dir");
        let conf = RouterConfig::new(
            format!("mock:{}", name),
            port,
            store.path().to_str().unwrap(),
        );
        let router = Router::new(conf).await.expect("router");
        Self {
            router,
            _store: store,
        }
    }
}

/// A fully wired node: router + manager on the zero coordinate.
pub struct TestNode {
    pub name: String,
    pub addr: String,
    pub router: Router,
    pub manager: Manager,
    pub recv_log: Arc<RecvLog>,
    _router_store: TempDir,
    _node_store: TempDir,
}

impl TestNode {
    /// Create and start a managed node on `mock:<name>`.
    pub async fn start(name: &str, port: u16) -> Self {
        let router_store = TempDir::new().expect("temp dir");
        let node_store = TempDir::new().expect("temp dir");

        let router = Router::new(RouterConfig::new(
            format!("mock:{}", name),
            port,
            router_store.path().to_str().unwrap(),
        ))
        .await
        .expect("router");

        let manager = Manager::new(
            zero_coord(),
            router.clone(),
            &PeerConfig::new(node_store.path().to_str().unwrap()),
        )
        .expect("manager");

        let recv_log = Arc::new(RecvLog::default());
        manager.register_event_handler(recv_log.clone());
        manager.start_manage();

        Self {
            name: name.to_string(),
            addr: format!("{}:{}", name, port),
            router,
            manager,
            recv_log,
            _router_store: router_store,
            _node_store: node_store,
        }
    }
}

/// Poll `cond` until it holds or the time limit runs out.
pub async fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}

/// Tagged test message with a `from` field for delivery accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMsg {
    pub from: String,
    pub tag: u64,
}

/// Type id of [`TestMsg`].
pub fn test_msg_type() -> MessageType {
    static TYPE: OnceLock<MessageType> = OnceLock::new();
    *TYPE.get_or_init(|| MessageType::define("test.TestMsg"))
}

impl Message for TestMsg {
    fn message_type(&self) -> MessageType {
        test_msg_type()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.from.len() as u32);
        buf.put_slice(self.from.as_bytes());
        buf.put_u64_le(self.tag);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TestMsg {
    pub fn decode(body: &mut Bytes) -> PeerResult<Self> {
        if body.remaining() < 4 {
            return Err(PeerError::InvalidMessage("truncated test msg".into()));
        }
        let len = body.get_u32_le() as usize;
        if body.remaining() < len + 8 {
            return Err(PeerError::InvalidMessage("truncated test msg".into()));
        }
        let from = String::from_utf8_lossy(&body.copy_to_bytes(len)).into_owned();
        let tag = body.get_u64_le();
        Ok(Self { from, tag })
    }
}

/// Event handler recording every received [`TestMsg`].
#[derive(Default)]
pub struct RecvLog {
    seen: Mutex<Vec<TestMsg>>,
}

impl RecvLog {
    pub fn messages(&self) -> Vec<TestMsg> {
        self.seen.lock().clone()
    }

    pub fn count_from(&self, from: &str) -> usize {
        self.seen.lock().iter().filter(|m| m.from == from).count()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl EventHandler for RecvLog {
    fn on_recv(&self, _peer: &Arc<Peer>, msg_type: MessageType, body: Bytes) -> PeerResult<()> {
        if msg_type != test_msg_type() {
            return Err(PeerError::UnknownMessage);
        }
        let mut body = body;
        let msg = TestMsg::decode(&mut body)?;
        self.seen.lock().push(msg);
        Ok(())
    }
}

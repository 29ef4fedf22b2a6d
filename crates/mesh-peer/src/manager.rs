//! Peer manager: discovery loop, gossip, broadcast, ban, rotation.
//!
//! The manager owns the candidate state machine, the live connection map,
//! the persistent node store and the bounded peer storage. Three
//! cooperative loops drive it: the acceptor admits handshaken connections
//! from the router, the candidate manager retries outbound dials, and the
//! rotator keeps the working set topped up from the node store.
//!
//! `peer_group_lock` serializes every mutation that must keep the
//! connection map, node store and candidate map mutually consistent
//! (gossip application, admission, rotation).

use crate::ban::ByTime;
use crate::candidate::{CandidateMap, CandidateState};
use crate::connect_map::ConnectMap;
use crate::events::EventHandler;
use crate::message::{MessageRegistry, MessageType};
use crate::node_store::NodeStore;
use crate::peer::{DeletePeerFn, OnRecvFn, Peer};
use crate::peermessage::{
    peer_list_creator, peer_list_type, send_request_peer_list, ConnectInfo, PeerList,
};
use crate::storage::{PeerStorage, MAX_PEER_STORAGE_LEN};
use crate::{Message, PeerError, PeerResult};
use bytes::Bytes;
use mesh_router::{ChainCoord, EvilReason, Router, RouterConn, RouterError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pacing between dials in the candidate loops.
const DIAL_PACING: Duration = Duration::from_millis(50);

/// Candidate manager tick.
const CANDIDATE_TICK: Duration = Duration::from_secs(30);

/// Rotator tick while the working set is short.
const ROTATE_TICK_HUNGRY: Duration = Duration::from_secs(2);

/// Rotator tick while the working set is full.
const ROTATE_TICK_FULL: Duration = Duration::from_secs(20 * 60);

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path for the node store.
    pub store_path: String,
    /// Evil-score ban threshold, propagated to the router config when
    /// that one omits it.
    pub ban_evil_score: u16,
}

impl Config {
    pub fn new(store_path: impl Into<String>) -> Self {
        Self {
            store_path: store_path.into(),
            ban_evil_score: 100,
        }
    }
}

pub(crate) struct ManagerInner {
    weak_self: Weak<ManagerInner>,
    chain_coord: ChainCoord,
    router: Router,
    registry: MessageRegistry,

    nodes: NodeStore,
    node_rotate_index: AtomicUsize,
    candidates: CandidateMap,

    peer_group_lock: Mutex<()>,
    connections: ConnectMap,

    peer_storage: PeerStorage,

    event_handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    ban_peers: ByTime,
}

/// Manages peer-connected networks on one chain coordinate.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager. Registers the peer-list gossip message and the
    /// manager's own event handler.
    pub fn new(chain_coord: ChainCoord, router: Router, conf: &Config) -> PeerResult<Manager> {
        let nodes = NodeStore::open(&conf.store_path)?;

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let kick_weak = weak.clone();
            ManagerInner {
                weak_self: weak.clone(),
                chain_coord,
                router,
                registry: MessageRegistry::new(),
                nodes,
                node_rotate_index: AtomicUsize::new(0),
                candidates: CandidateMap::new(),
                peer_group_lock: Mutex::new(()),
                connections: ConnectMap::new(),
                peer_storage: PeerStorage::new(Box::new(move |evicted| {
                    if let Some(inner) = kick_weak.upgrade() {
                        inner.kick_out_peer_storage(evicted);
                    }
                })),
                event_handlers: RwLock::new(Vec::new()),
                ban_peers: ByTime::new(),
            }
        });

        inner.registry.set_creator(peer_list_type(), peer_list_creator);

        let manager = Manager { inner };
        manager.register_event_handler(Arc::new(GossipHandler {
            inner: Arc::downgrade(&manager.inner),
        }));
        Ok(manager)
    }

    /// Append an event handler; handlers run in registration order.
    pub fn register_event_handler(&self, eh: Arc<dyn EventHandler>) {
        self.inner.event_handlers.write().push(eh);
    }

    /// Start the acceptor, candidate manager and rotator loops, and
    /// register the chain coordinate with the router.
    pub fn start_manage(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.accept_loop().await });

        self.inner.router.add_listen(self.inner.chain_coord);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.candidate_loop().await });

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.rotate_loop().await });

        info!(
            local = %self.inner.router.local_addr(),
            coord = %self.inner.chain_coord,
            "peer manager started"
        );
    }

    /// Register an additional node to dial.
    ///
    /// Silently ignores the local address; refuses a banned host with
    /// `CanNotConnectToEvilNode`.
    pub fn add_node(&self, addr: &str) -> PeerResult<()> {
        self.inner.add_node(addr)
    }

    /// Dial every candidate still waiting on a request, pacing 50 ms
    /// between dials.
    pub async fn enforce_connect(&self) {
        let mut dial_list = Vec::new();
        self.inner.candidates.range(|addr, state| {
            if matches!(
                state,
                CandidateState::RequestWait | CandidateState::PunishableRequestWait
            ) {
                dial_list.push(addr.to_string());
            }
            true
        });

        for addr in dial_list {
            if let Err(e) = self.inner.router.request(&addr, self.inner.chain_coord).await {
                warn!(addr = %addr, error = %e, "enforce connect failed");
            }
            tokio::time::sleep(DIAL_PACING).await;
        }
    }

    /// Send `m` to every live peer. Per-peer failures do not abort the
    /// fan-out.
    pub fn broad_cast(&self, m: &dyn Message) {
        self.inner.connections.range(|_, peer| {
            let _ = peer.send(m);
            true
        });
    }

    /// Broadcast skipping one address.
    pub fn except_cast(&self, except_addr: &str, m: &dyn Message) {
        self.inner.connections.range(|addr, peer| {
            if addr != except_addr {
                let _ = peer.send(m);
            }
            true
        });
    }

    /// Send to a single peer.
    pub fn target_cast(&self, addr: &str, m: &dyn Message) -> PeerResult<()> {
        match self.inner.connections.load(addr) {
            Some(peer) => {
                let _ = peer.send(m);
                Ok(())
            }
            None => Err(PeerError::NotFoundPeer),
        }
    }

    /// Addresses of all known nodes as `addr:scoreboard_len`.
    pub fn node_list(&self) -> Vec<String> {
        let mut list = Vec::new();
        self.inner.nodes.range(|addr, ci| {
            list.push(format!("{}:{}", addr, ci.ping_score_board.len()));
            true
        });
        list
    }

    /// Addresses of live connections.
    pub fn connected_list(&self) -> Vec<String> {
        let mut list = Vec::new();
        self.inner.connections.range(|addr, _| {
            list.push(addr.to_string());
            true
        });
        list
    }

    /// Addresses in the peer storage working set.
    pub fn group_list(&self) -> Vec<String> {
        self.inner.peer_storage.list()
    }

    /// Working-set members as peers.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner
            .peer_storage
            .list()
            .into_iter()
            .filter_map(|addr| self.inner.connections.load(&addr))
            .collect()
    }

    /// Ban an address for `seconds` and close any matching live peer.
    pub fn ban(&self, net_addr: &str, seconds: u32) {
        self.inner.ban_peers.add(net_addr, seconds);
        if let Some(peer) = self.inner.connections.load(net_addr) {
            peer.close();
        }
    }

    /// Ban by peer identity.
    pub fn ban_by_id(&self, id: &str, seconds: u32) {
        self.ban(id, seconds);
    }

    /// Lift a ban.
    pub fn unban(&self, net_addr: &str) {
        self.inner.ban_peers.delete(net_addr);
    }

    /// True while `net_addr` is banned.
    pub fn is_ban(&self, net_addr: &str) -> bool {
        self.inner.ban_peers.is_ban(net_addr)
    }

    /// Force-dial a node, marking it punishable immediately.
    pub async fn add(&self, net_addr: &str) {
        let res = self.inner.router.request(net_addr, self.inner.chain_coord).await;
        self.inner
            .candidates
            .store(net_addr, CandidateState::PunishableRequestWait);
        if let Err(e) = res {
            warn!(addr = %net_addr, error = %e, "forced dial failed");
        }
    }

    /// Close the live connection to `net_addr`, if any.
    pub fn remove(&self, net_addr: &str) {
        if let Some(peer) = self.inner.connections.load(net_addr) {
            peer.close();
        }
    }

    /// Close by peer identity.
    pub fn remove_by_id(&self, id: &str) {
        self.remove(id);
    }

    /// The chain coordinate this manager serves.
    pub fn chain_coord(&self) -> ChainCoord {
        self.inner.chain_coord
    }

    /// The underlying router.
    pub fn router(&self) -> &Router {
        &self.inner.router
    }
}

impl ManagerInner {
    /// An owned handle to this inner, for spawning.
    fn strong(&self) -> Option<Arc<ManagerInner>> {
        self.weak_self.upgrade()
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            match self.router.accept(self.chain_coord).await {
                Ok((conn, ping)) => {
                    let addr = conn.remote_addr().to_string();
                    if self.ban_peers.is_ban(&addr) {
                        if let Some(existing) = self.connections.load(&addr) {
                            existing.close();
                        }
                        warn!(addr = %addr, "rejecting banned peer");
                        continue;
                    }

                    let inner = self.clone();
                    tokio::spawn(async move {
                        inner.admit(conn, ping);
                    });
                }
                Err(RouterError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Wrap a handshaken connection as a peer and run the admission
    /// handlers.
    fn admit(&self, conn: RouterConn, ping: Duration) {
        let delete: DeletePeerFn = Arc::new({
            let weak = self.weak_self.clone();
            move |peer: &Arc<Peer>| {
                if let Some(inner) = weak.upgrade() {
                    inner.delete_peer(peer);
                }
            }
        });
        let on_recv: OnRecvFn = Arc::new({
            let weak = self.weak_self.clone();
            move |peer: &Arc<Peer>, t: MessageType, body: Bytes| match weak.upgrade() {
                Some(inner) => inner.on_recv_event_handler(peer, t, body),
                None => Ok(()),
            }
        });

        let peer = Peer::new(conn, ping, delete, on_recv);

        {
            let handlers = self.event_handlers.read();
            for eh in handlers.iter() {
                if let Err(e) = eh.before_connect(&peer) {
                    warn!(peer = %peer.id(), error = %e, "before-connect rejected peer");
                    peer.close();
                    return;
                }
            }
        }

        if let Err(e) = self.add_peer(&peer) {
            warn!(peer = %peer.id(), error = %e, "peer not admitted");
            return;
        }

        let handlers = self.event_handlers.read();
        for eh in handlers.iter() {
            eh.after_connect(&peer);
        }
    }

    fn add_peer(&self, peer: &Arc<Peer>) -> PeerResult<()> {
        let _guard = self.peer_group_lock.lock();

        let addr = peer.net_addr().to_string();
        if self.connections.load(&addr).is_some() {
            peer.close();
            return Err(PeerError::IsAlreadyConnected);
        }

        self.connections.store(addr.clone(), peer.clone());
        self.nodes
            .load_or_store(&addr, ConnectInfo::new(addr.clone(), peer.ping_time()));
        self.candidates
            .store(addr.clone(), CandidateState::PeerListWait);
        debug!(addr = %addr, local = %peer.local_addr(), "peer added");

        let peer = peer.clone();
        tokio::spawn(async move {
            send_request_peer_list(&peer, peer.local_addr());
        });
        Ok(())
    }

    /// Remove a closing peer from the connection map. A newer connection
    /// may already own the slot; leave it alone in that case.
    fn delete_peer(&self, peer: &Arc<Peer>) {
        let addr = peer.net_addr();
        let Some(existing) = self.connections.load(addr) else {
            return;
        };
        if !Arc::ptr_eq(&existing, peer) {
            return;
        }

        {
            let handlers = self.event_handlers.read();
            for eh in handlers.iter() {
                eh.on_closed(peer);
            }
        }
        self.connections.delete(addr);
        debug!(addr = %addr, "peer deleted");
    }

    /// Dispatch one message through the handler chain. `UnknownMessage`
    /// falls through; the first success stops the chain; any other error
    /// stops dispatch for this message.
    fn on_recv_event_handler(
        &self,
        peer: &Arc<Peer>,
        msg_type: MessageType,
        body: Bytes,
    ) -> PeerResult<()> {
        let handlers = self.event_handlers.read();
        for eh in handlers.iter() {
            match eh.on_recv(peer, msg_type, body.clone()) {
                Ok(()) => break,
                Err(PeerError::UnknownMessage) => continue,
                Err(e) => {
                    warn!(peer = %peer.id(), msg = %msg_type, error = %e, "handler failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn add_node(&self, addr: &str) -> PeerResult<()> {
        let local = self.router.localhost();
        if !local.is_empty() && addr.starts_with(local) {
            return Ok(());
        }

        if self.router.evil_node_manager().is_ban_node(addr) {
            warn!(addr = %addr, "refusing evil node");
            return Err(PeerError::Router(RouterError::CanNotConnectToEvilNode));
        }

        self.candidates
            .store(addr.to_string(), CandidateState::RequestWait);
        debug!(local = %self.router.localhost(), addr = %addr, "node added");

        if let Some(inner) = self.strong() {
            let addr = addr.to_string();
            tokio::spawn(async move {
                inner
                    .do_manage_candidate(&addr, CandidateState::RequestWait)
                    .await;
            });
        }
        Ok(())
    }

    async fn do_manage_candidate(&self, addr: &str, state: CandidateState) {
        let local = self.router.localhost();
        if !local.is_empty() && addr.starts_with(local) {
            if let Some(inner) = self.strong() {
                let addr = addr.to_string();
                tokio::spawn(async move {
                    inner.candidates.delete(&addr);
                });
            }
            return;
        }

        match state {
            CandidateState::RequestWait => {
                let res = self.router.request(addr, self.chain_coord).await;
                // The first attempt is free; from now on failures punish.
                if let Some(inner) = self.strong() {
                    let addr = addr.to_string();
                    tokio::spawn(async move {
                        inner
                            .candidates
                            .store(addr, CandidateState::PunishableRequestWait);
                    });
                }
                if let Err(e) = res {
                    debug!(addr = %addr, error = %e, "request failed");
                }
            }
            CandidateState::PunishableRequestWait => {
                if let Err(e) = self.router.request(addr, self.chain_coord).await {
                    self.router
                        .evil_node_manager()
                        .tell_on(addr, EvilReason::DialFail);
                    debug!(addr = %addr, error = %e, "request failed, told on");
                }
            }
            CandidateState::PeerListWait => {
                if let Some(peer) = self.connections.load(addr) {
                    send_request_peer_list(&peer, peer.local_addr());
                } else if let Some(inner) = self.strong() {
                    let addr = addr.to_string();
                    tokio::spawn(async move {
                        inner.candidates.store(addr, CandidateState::RequestWait);
                    });
                }
            }
        }
    }

    async fn candidate_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(CANDIDATE_TICK).await;

            let mut snapshot = Vec::new();
            self.candidates.range(|addr, state| {
                snapshot.push((addr.to_string(), state));
                true
            });

            for (addr, state) in snapshot {
                self.do_manage_candidate(&addr, state).await;
                tokio::time::sleep(DIAL_PACING).await;
            }
        }
    }

    async fn rotate_loop(self: Arc<Self>) {
        loop {
            if self.peer_storage.not_enough_peer() {
                tokio::time::sleep(ROTATE_TICK_HUNGRY).await;
            } else {
                tokio::time::sleep(ROTATE_TICK_FULL).await;
            }
            self.append_peer_storage().await;
        }
    }

    /// Advance the rotation cursor over the node store by at most one
    /// node: promote it into the working set when connected, dial it
    /// otherwise.
    async fn append_peer_storage(&self) {
        if self.connections.len() == 0 {
            return;
        }
        if self.connections.len() == 1 {
            self.connections.range(|_, peer| {
                info!(
                    local = %peer.local_addr(),
                    to = %peer.remote_addr(),
                    "requesting peer list from sole connection"
                );
                send_request_peer_list(peer, peer.local_addr());
                false
            });
            return;
        }

        let mut to_request: Option<String> = None;
        {
            let _guard = self.peer_group_lock.lock();

            let len = self.nodes.len();
            if len == 0 {
                return;
            }

            let start = self.node_rotate_index.load(Ordering::Relaxed);
            for i in start..len {
                let Some(node) = self.nodes.get(i) else { break };
                self.node_rotate_index.store(i + 1, Ordering::Relaxed);

                if self.peer_storage.have(&node.address) {
                    continue;
                }
                if let Some(peer) = self.connections.load(&node.address) {
                    self.add_ready_conn(&peer);
                } else {
                    to_request = Some(node.address.clone());
                }
                break;
            }

            if self.node_rotate_index.load(Ordering::Relaxed) >= len.saturating_sub(1) {
                self.node_rotate_index.store(0, Ordering::Relaxed);
            }
        }

        if let Some(addr) = to_request {
            if let Err(e) = self.router.request(&addr, self.chain_coord).await {
                debug!(addr = %addr, error = %e, "rotation dial failed");
            }
        }
    }

    /// Apply one gossiped record: note the sender's observed latency on
    /// its own scoreboard, keyed by the gossiped address.
    fn update_score_board(&self, peer: &Arc<Peer>, ci: &ConnectInfo) {
        let addr = peer.net_addr();
        let node = self
            .nodes
            .load_or_store(addr, ConnectInfo::new(addr, peer.ping_time()));
        node.ping_score_board.store(
            ci.address.clone(),
            ci.ping_time,
            format!("{} {}", peer.local_addr(), peer.net_addr()),
        );
        self.nodes.persist(addr);
    }

    fn add_ready_conn(&self, peer: &Arc<Peer>) {
        self.peer_storage.add(peer, &|addr| {
            self.nodes
                .load(addr)
                .and_then(|node| node.ping_score_board.load(addr))
        });
    }

    /// Eviction callback for peer storage: when well over capacity,
    /// close the oldest connection that is not part of the working set.
    fn kick_out_peer_storage(&self, evicted: Arc<Peer>) {
        if self.connections.len() > MAX_PEER_STORAGE_LEN * 2 {
            let mut close_peer = evicted;
            self.connections.range(|addr, peer| {
                if close_peer.connected_time() > peer.connected_time()
                    && !self.peer_storage.have(addr)
                {
                    close_peer = peer.clone();
                }
                true
            });
            close_peer.close();
        }
    }

    fn handle_peer_list(&self, peer: &Arc<Peer>, pl: &PeerList) {
        if pl.request {
            // Copy the node store so serialization does not race updates.
            let mut list = HashMap::new();
            self.nodes.range(|addr, ci| {
                list.insert(addr.to_string(), ci.clone());
                true
            });
            let reply = PeerList {
                request: false,
                from: peer.local_addr().to_string(),
                list,
            };

            // Prefer the mapped connection; before admission completes on
            // this side, fall back to the requesting peer itself.
            match self.connections.load(&pl.from) {
                Some(target) => {
                    let _ = target.send(&reply);
                }
                None => {
                    let _ = peer.send(&reply);
                }
            }
            return;
        }

        let _guard = self.peer_group_lock.lock();

        self.candidates.delete(&pl.from);

        for ci in pl.list.values() {
            if ci.address == self.router.localhost() {
                continue;
            }
            if self.candidates.load(&ci.address).is_some() {
                continue;
            }
            if self.nodes.load(&ci.address).is_some() {
                continue;
            }
            if self.connections.load(&ci.address).is_some() {
                continue;
            }
            if let Err(e) = self.add_node(&ci.address) {
                debug!(addr = %ci.address, error = %e, "gossiped node rejected");
            }
        }

        if let Some(sender) = self.connections.load(&pl.from) {
            for ci in pl.list.values() {
                self.update_score_board(&sender, ci);
            }
            self.add_ready_conn(&sender);
        }
    }
}

/// The manager's own event handler: answers and applies peer-list gossip.
struct GossipHandler {
    inner: Weak<ManagerInner>,
}

impl EventHandler for GossipHandler {
    fn on_recv(&self, peer: &Arc<Peer>, msg_type: MessageType, body: Bytes) -> PeerResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(PeerError::UnknownMessage);
        };

        let mut body = body;
        let msg = inner.registry.parse(msg_type, &mut body)?;
        if let Some(pl) = msg.as_any().downcast_ref::<PeerList>() {
            inner.handle_peer_list(peer, pl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_router::Config as RouterConfig;
    use tempfile::TempDir;

    async fn fixture(name: &str, port: u16) -> (Manager, Router, TempDir, TempDir) {
        let router_dir = TempDir::new().unwrap();
        let node_dir = TempDir::new().unwrap();
        let router = Router::new(RouterConfig::new(
            format!("mock:{}", name),
            port,
            router_dir.path().to_str().unwrap(),
        ))
        .await
        .unwrap();
        let manager = Manager::new(
            ChainCoord::default(),
            router.clone(),
            &Config::new(node_dir.path().to_str().unwrap()),
        )
        .unwrap();
        (manager, router, router_dir, node_dir)
    }

    #[tokio::test]
    async fn test_add_node_is_idempotent() {
        let (manager, _router, _d1, _d2) = fixture("mgr-addnode", 3200).await;

        manager.add_node("other:3200").unwrap();
        manager.add_node("other:3200").unwrap();

        assert_eq!(manager.inner.candidates.len(), 1);
        assert!(matches!(
            manager.inner.candidates.load("other:3200"),
            Some(CandidateState::RequestWait) | Some(CandidateState::PunishableRequestWait)
        ));
    }

    #[tokio::test]
    async fn test_add_node_skips_local() {
        let (manager, _router, _d1, _d2) = fixture("mgr-local", 3201).await;

        manager.add_node("mgr-local:3201").unwrap();
        assert!(manager.inner.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_add_node_refuses_evil() {
        let (manager, router, _d1, _d2) = fixture("mgr-evil", 3202).await;

        router.update_evil_score("badguy:3202", 1000);
        let err = manager.add_node("badguy:3202").unwrap_err();
        assert!(matches!(
            err,
            PeerError::Router(RouterError::CanNotConnectToEvilNode)
        ));
        assert!(manager.inner.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_target_cast_without_peer() {
        let (manager, _router, _d1, _d2) = fixture("mgr-target", 3203).await;

        let m = PeerList::default();
        let err = manager.target_cast("ghost:3203", &m).unwrap_err();
        assert!(matches!(err, PeerError::NotFoundPeer));
    }

    #[tokio::test]
    async fn test_ban_then_unban() {
        let (manager, _router, _d1, _d2) = fixture("mgr-ban", 3204).await;

        manager.ban("node9:3204", 100);
        assert!(manager.is_ban("node9:3204"));

        manager.unban("node9:3204");
        assert!(!manager.is_ban("node9:3204"));
    }
}

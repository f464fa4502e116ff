//! The process-wide network fabric.
//!
//! One [`NetService`] owns the listeners, the local handler socket, the
//! peer-attraction loop and the in-memory tracking tables. A single
//! mutex guards the tables; nothing holds it across I/O or awaits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dogenet_proto::{
    Address, AddressMsg, KeyPair, PubKey, RawMessage, Service as ServiceEntry, Tag4CC,
    CORE_NODE_DEFAULT_PORT, SERVICE_CORE,
};
use dogenet_store::{NodeInfo, Store, StoreError};

use crate::announce::run_announcer;
use crate::handler::spawn_handler;
use crate::peer::spawn_peer;

/// Target number of concurrently connected overlay peers.
pub const IDEAL_PEERS: usize = 8;

/// Hold-off between connection attempts to the same node key.
pub const PEER_LOCK_TIME: Duration = Duration::from_secs(300);

/// Outbound dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle wait in the attract loop between discovery attempts.
const ATTRACT_IDLE: Duration = Duration::from_secs(30);

/// Default path of the local handler socket.
pub const DEFAULT_PROTOCOL_SOCKET: &str = "/tmp/dogenet.sock";

/// Capacity of each session's outbound queue. Fan-out drops messages
/// for a peer whose queue is full rather than blocking the sender.
pub(crate) const SEND_QUEUE_DEPTH: usize = 32;

/// Immutable service configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Addresses to accept gossip connections on.
    pub bind_addrs: Vec<Address>,
    /// The address advertised in our announcement.
    pub public_addr: Address,
    /// Path of the local handler socket.
    pub socket_path: PathBuf,
    /// Accept private/loopback public addresses (testing).
    pub allow_local: bool,
    /// This node's transport keypair.
    pub node_key: KeyPair,
    /// The owner's identity key.
    pub identity: PubKey,
}

pub(crate) type SessionId = u64;

/// Send-side handle to a live peer session.
pub(crate) struct PeerHandle {
    pub id: SessionId,
    pub send: mpsc::Sender<RawMessage>,
}

/// Send-side handle to a live handler session.
pub(crate) struct HandlerHandle {
    pub id: SessionId,
    pub channel: Tag4CC,
    pub send: mpsc::Sender<RawMessage>,
}

/// Everything guarded by the service mutex.
#[derive(Default)]
struct NetState {
    stopping: bool,
    /// Every open connection's cancel token, for force-close on stop.
    connections: Vec<(SessionId, CancellationToken)>,
    /// At most one session per node key.
    connected_peers: HashMap<PubKey, PeerHandle>,
    /// Node key -> unlock time, preventing reconnect storms.
    locked_peers: HashMap<PubKey, Instant>,
    handlers: Vec<HandlerHandle>,
    /// The signed announcement currently being gossiped.
    current_announcement: Option<RawMessage>,
    /// Actual bound listener addresses (ports resolved).
    listen_addrs: Vec<Address>,
}

/// The network service. Shared via `Arc`; sessions hold the service,
/// the service holds only send handles and tokens, never sessions.
pub struct NetService {
    pub(crate) config: NetConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) cancel: CancellationToken,
    state: Mutex<NetState>,
    next_id: AtomicU64,
    new_peers_tx: mpsc::Sender<NodeInfo>,
    new_peers_rx: Mutex<Option<mpsc::Receiver<NodeInfo>>>,
    pub(crate) addr_change_tx: mpsc::Sender<AddressMsg>,
    addr_change_rx: Mutex<Option<mpsc::Receiver<AddressMsg>>>,
}

impl NetService {
    /// Create the service. `cancel` is the root shutdown signal shared
    /// with every task the service spawns.
    pub fn new(config: NetConfig, store: Arc<dyn Store>, cancel: CancellationToken) -> Arc<Self> {
        let (new_peers_tx, new_peers_rx) = mpsc::channel(10);
        let (addr_change_tx, addr_change_rx) = mpsc::channel(8);
        Arc::new(Self {
            config,
            store,
            cancel,
            state: Mutex::new(NetState::default()),
            next_id: AtomicU64::new(1),
            new_peers_tx,
            new_peers_rx: Mutex::new(Some(new_peers_rx)),
            addr_change_tx,
            addr_change_rx: Mutex::new(Some(addr_change_rx)),
        })
    }

    /// Run until the cancel token fires, then close everything down.
    pub async fn run(self: Arc<Self>) {
        let mut tasks = Vec::new();

        // one listener task per bind address
        for bind in self.config.bind_addrs.clone() {
            match TcpListener::bind(bind.to_socket_addr()).await {
                Ok(listener) => {
                    let local = listener
                        .local_addr()
                        .map(Address::from)
                        .unwrap_or(bind);
                    info!(addr = %local, "listening for gossip peers");
                    self.state.lock().listen_addrs.push(local);
                    let svc = self.clone();
                    tasks.push(tokio::spawn(svc.accept_incoming(listener, local)));
                }
                Err(e) => {
                    warn!(addr = %bind, error = %e, "cannot listen");
                }
            }
        }

        // the local handler socket
        let _ = std::fs::remove_file(&self.config.socket_path);
        match UnixListener::bind(&self.config.socket_path) {
            Ok(listener) => {
                info!(path = %self.config.socket_path.display(), "handler socket ready");
                let svc = self.clone();
                tasks.push(tokio::spawn(svc.accept_handlers(listener)));
            }
            Err(e) => {
                warn!(
                    path = %self.config.socket_path.display(),
                    error = %e,
                    "cannot create handler socket"
                );
            }
        }

        // peer attraction
        let new_peers_rx = self
            .new_peers_rx
            .lock()
            .take()
            .expect("net service run() called twice");
        tasks.push(tokio::spawn(self.clone().find_peers(new_peers_rx)));

        // announcement loop
        let addr_change_rx = self
            .addr_change_rx
            .lock()
            .take()
            .expect("net service run() called twice");
        tasks.push(tokio::spawn(run_announcer(self.clone(), addr_change_rx)));

        self.cancel.cancelled().await;
        self.stop();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Accept loop for one bind address.
    async fn accept_incoming(self: Arc<Self>, listener: TcpListener, who: Address) {
        loop {
            let (stream, remote) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(addr = %who, error = %e, "accept failed");
                        return;
                    }
                },
            };
            let remote = Address::from(remote);
            debug!(addr = %remote, "peer connected (inbound)");
            spawn_peer(self.clone(), stream, remote, None);
        }
    }

    /// Accept loop for the local handler socket.
    async fn accept_handlers(self: Arc<Self>, listener: UnixListener) {
        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "handler accept failed");
                        return;
                    }
                },
            };
            debug!("handler connected");
            spawn_handler(self.clone(), stream);
        }
    }

    /// The attract loop: keep roughly [`IDEAL_PEERS`] sessions alive.
    async fn find_peers(self: Arc<Self>, mut new_peers: mpsc::Receiver<NodeInfo>) {
        loop {
            let Some(node) = self.choose_peer(&mut new_peers).await else {
                return; // stopping
            };
            if !node.is_valid() || self.have_peer(&node.pubkey) || !self.lock_peer(node.pubkey) {
                continue;
            }
            let pub_hex = hex::encode(node.pubkey);
            debug!(addr = %node.address, peer = %pub_hex, "dialing peer");
            match tokio::time::timeout(
                DIAL_TIMEOUT,
                TcpStream::connect(node.address.to_socket_addr()),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    info!(addr = %node.address, peer = %pub_hex, "connected to peer (outbound)");
                    spawn_peer(self.clone(), stream, node.address, Some(node.pubkey));
                }
                Ok(Err(e)) => {
                    debug!(addr = %node.address, error = %e, "connect failed");
                }
                Err(_) => {
                    debug!(addr = %node.address, "connect timed out");
                }
            }
        }
    }

    /// Pick the next peer to try: injected suggestions first, then a
    /// random known node while below target, else wait.
    async fn choose_peer(&self, new_peers: &mut mpsc::Receiver<NodeInfo>) -> Option<NodeInfo> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Ok(node) = new_peers.try_recv() {
                return Some(node);
            }
            if self.count_peers() < IDEAL_PEERS {
                // pace the loop before hitting the store
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                match self.store.choose_net_node() {
                    Ok(node) => return Some(node),
                    Err(StoreError::NotFound) => {}
                    Err(e) => warn!(error = %e, "choose_net_node failed"),
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                node = new_peers.recv() => return node,
                _ = tokio::time::sleep(ATTRACT_IDLE) => {}
            }
        }
    }

    /// Suggest a peer to connect to (CLI `--peer`, admin API).
    pub fn add_peer(&self, node: NodeInfo) {
        if self.new_peers_tx.try_send(node).is_err() {
            warn!("new-peer queue full, dropping suggestion");
        }
    }

    /// Actual bound listener addresses (ports resolved).
    pub fn listen_addrs(&self) -> Vec<Address> {
        self.state.lock().listen_addrs.clone()
    }

    /// The announcement body this node currently advertises, minus the
    /// timestamp (stamped at signing time).
    pub fn announcement_body(&self) -> AddressMsg {
        let channels = match self.store.get_channels() {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "cannot load subscribed channels");
                Vec::new()
            }
        };
        AddressMsg {
            time: 0,
            address: self.config.public_addr,
            owner: self.config.identity,
            channels,
            services: vec![ServiceEntry {
                tag: SERVICE_CORE,
                port: CORE_NODE_DEFAULT_PORT,
            }],
        }
    }

    /// Re-gossip an announcement with the current channel list. Called
    /// when a handler subscribes to a new channel.
    pub(crate) fn refresh_announcement(&self) {
        if self.addr_change_tx.try_send(self.announcement_body()).is_err() {
            debug!("announcement refresh already pending");
        }
    }

    // --- thread-safe primitives (each takes the service mutex) ---

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The current signed announcement, ready to send.
    pub fn get_announcement(&self) -> Option<RawMessage> {
        self.state.lock().current_announcement.clone()
    }

    pub(crate) fn set_announcement(&self, raw: RawMessage) {
        self.state.lock().current_announcement = Some(raw);
    }

    /// Track a new connection, optionally registering its peer key.
    /// Returns false if the service is stopping or the key is taken.
    pub(crate) fn track_peer(
        &self,
        id: SessionId,
        token: CancellationToken,
        send: mpsc::Sender<RawMessage>,
        key: Option<PubKey>,
    ) -> bool {
        let mut st = self.state.lock();
        if st.stopping {
            return false;
        }
        if let Some(key) = key {
            if st.connected_peers.contains_key(&key) {
                return false;
            }
            st.connected_peers.insert(key, PeerHandle { id, send });
        }
        st.connections.push((id, token));
        true
    }

    /// Claim a node key for a session whose key just became known
    /// (inbound handshake). Returns false if the key is already live.
    pub(crate) fn adopt_peer(
        &self,
        id: SessionId,
        send: mpsc::Sender<RawMessage>,
        key: PubKey,
    ) -> bool {
        let mut st = self.state.lock();
        if st.connected_peers.contains_key(&key) {
            return false;
        }
        st.connected_peers.insert(key, PeerHandle { id, send });
        true
    }

    /// Remove a finished peer session. The key entry is removed only if
    /// it still points at this session.
    pub(crate) fn close_peer(&self, id: SessionId, key: Option<PubKey>) {
        let mut st = self.state.lock();
        if let Some(key) = key {
            if st.connected_peers.get(&key).is_some_and(|h| h.id == id) {
                st.connected_peers.remove(&key);
            }
        }
        if let Some(at) = st.connections.iter().position(|(cid, _)| *cid == id) {
            st.connections.swap_remove(at);
        }
    }

    /// Non-blocking fan-out to every connected peer; slow peers miss out.
    pub fn forward_to_peers(&self, msg: RawMessage) {
        let st = self.state.lock();
        for handle in st.connected_peers.values() {
            let _ = handle.send.try_send(msg.clone());
        }
    }

    /// Fan-out to every peer other than `except` (broadcast acyclicity).
    pub(crate) fn forward_to_peers_except(&self, msg: RawMessage, except: &PubKey) {
        let st = self.state.lock();
        for (key, handle) in st.connected_peers.iter() {
            if key != except {
                let _ = handle.send.try_send(msg.clone());
            }
        }
    }

    /// Deliver a message to every handler subscribed to `channel`.
    /// Returns true iff at least one handler accepted it.
    pub fn forward_to_handlers(&self, channel: Tag4CC, msg: RawMessage) -> bool {
        let st = self.state.lock();
        let mut found = false;
        for handler in st.handlers.iter() {
            if handler.channel == channel && handler.send.try_send(msg.clone()).is_ok() {
                found = true;
            }
        }
        found
    }

    /// Number of live peer sessions.
    pub fn count_peers(&self) -> usize {
        self.state.lock().connected_peers.len()
    }

    /// Number of live handler sessions.
    pub fn count_handlers(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// True if a live session exists for `key`.
    pub fn have_peer(&self, key: &PubKey) -> bool {
        self.state.lock().connected_peers.contains_key(key)
    }

    /// Reserve `key` for a connection attempt. False while the previous
    /// reservation's hold-off is still running.
    pub(crate) fn lock_peer(&self, key: PubKey) -> bool {
        let mut st = self.state.lock();
        let now = Instant::now();
        if let Some(until) = st.locked_peers.get(&key) {
            if now < *until {
                return false;
            }
        }
        st.locked_peers.insert(key, now + PEER_LOCK_TIME);
        true
    }

    /// Track a new handler connection. Returns false if stopping.
    pub(crate) fn track_handler(
        &self,
        id: SessionId,
        token: CancellationToken,
        channel: Tag4CC,
        send: mpsc::Sender<RawMessage>,
    ) -> bool {
        let mut st = self.state.lock();
        if st.stopping {
            return false;
        }
        st.connections.push((id, token));
        st.handlers.push(HandlerHandle { id, channel, send });
        true
    }

    /// Remove a finished handler session.
    pub(crate) fn close_handler(&self, id: SessionId) {
        let mut st = self.state.lock();
        if let Some(at) = st.connections.iter().position(|(cid, _)| *cid == id) {
            st.connections.swap_remove(at);
        }
        if let Some(at) = st.handlers.iter().position(|h| h.id == id) {
            st.handlers.swap_remove(at);
        }
    }

    /// Stop accepting and force-close every tracked connection.
    fn stop(&self) {
        let connections = {
            let mut st = self.state.lock();
            st.stopping = true;
            std::mem::take(&mut st.connections)
        };
        for (_, token) in connections {
            token.cancel();
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
        info!("network service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dogenet_store::SqliteStore;

    fn test_service() -> Arc<NetService> {
        let cancel = CancellationToken::new();
        let store = Arc::new(SqliteStore::open_in_memory(cancel.clone()).unwrap());
        let config = NetConfig {
            bind_addrs: vec![],
            public_addr: Address::parse("203.0.113.5:42069", 0).unwrap(),
            socket_path: std::env::temp_dir().join(format!("dogenet-test-{}.sock", std::process::id())),
            allow_local: true,
            node_key: KeyPair::generate(),
            identity: [3u8; 32],
        };
        NetService::new(config, store, cancel)
    }

    fn queue() -> (mpsc::Sender<RawMessage>, mpsc::Receiver<RawMessage>) {
        mpsc::channel(SEND_QUEUE_DEPTH)
    }

    fn raw(n: u8) -> RawMessage {
        RawMessage {
            header: vec![n; 108],
            payload: vec![n],
        }
    }

    #[test]
    fn test_track_peer_refuses_duplicate_key() {
        let svc = test_service();
        let key = [1u8; 32];
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();

        assert!(svc.track_peer(1, CancellationToken::new(), tx1, Some(key)));
        assert!(!svc.track_peer(2, CancellationToken::new(), tx2, Some(key)));
        assert_eq!(svc.count_peers(), 1);
        assert!(svc.have_peer(&key));
    }

    #[test]
    fn test_adopt_peer_single_winner() {
        let svc = test_service();
        let key = [2u8; 32];
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();

        // two inbound sessions learn the same key concurrently; only the
        // first adoption wins
        assert!(svc.track_peer(1, CancellationToken::new(), tx1.clone(), None));
        assert!(svc.track_peer(2, CancellationToken::new(), tx2.clone(), None));
        assert!(svc.adopt_peer(1, tx1, key));
        assert!(!svc.adopt_peer(2, tx2, key));

        // the loser closes without disturbing the winner
        svc.close_peer(2, Some(key));
        assert!(svc.have_peer(&key));
        svc.close_peer(1, Some(key));
        assert!(!svc.have_peer(&key));
    }

    #[test]
    fn test_close_peer_only_removes_own_entry() {
        let svc = test_service();
        let key = [4u8; 32];
        let (tx1, _rx1) = queue();

        assert!(svc.track_peer(7, CancellationToken::new(), tx1, Some(key)));
        // a stale close from a different session id must not evict
        svc.close_peer(99, Some(key));
        assert!(svc.have_peer(&key));
    }

    #[test]
    fn test_lock_peer_holdoff() {
        let svc = test_service();
        let key = [5u8; 32];
        assert!(svc.lock_peer(key));
        assert!(!svc.lock_peer(key), "hold-off must refuse immediate retry");

        // expire the reservation by hand
        svc.state.lock().locked_peers.insert(key, Instant::now() - Duration::from_secs(1));
        assert!(svc.lock_peer(key), "expired hold-off must allow retry");
    }

    #[test]
    fn test_forward_to_peers_drops_when_full() {
        let svc = test_service();
        let (tx, mut rx) = mpsc::channel(1);
        assert!(svc.track_peer(1, CancellationToken::new(), tx, Some([6u8; 32])));

        // fills the queue, then drops without blocking
        svc.forward_to_peers(raw(1));
        svc.forward_to_peers(raw(2));

        assert_eq!(rx.try_recv().unwrap().payload, vec![1]);
        assert!(rx.try_recv().is_err(), "second message must have been dropped");
    }

    #[test]
    fn test_forward_to_peers_except_sender() {
        let svc = test_service();
        let (tx_a, mut rx_a) = queue();
        let (tx_b, mut rx_b) = queue();
        let key_a = [7u8; 32];
        let key_b = [8u8; 32];
        assert!(svc.track_peer(1, CancellationToken::new(), tx_a, Some(key_a)));
        assert!(svc.track_peer(2, CancellationToken::new(), tx_b, Some(key_b)));

        svc.forward_to_peers_except(raw(9), &key_a);
        assert!(rx_a.try_recv().is_err(), "sender must not get its own message back");
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_forward_to_handlers_fanout() {
        let svc = test_service();
        let foo = Tag4CC::new(*b"foo ");
        let bar = Tag4CC::new(*b"bar ");
        let (tx1, mut rx1) = queue();
        let (tx2, mut rx2) = queue();
        let (tx3, mut rx3) = queue();

        assert!(svc.track_handler(1, CancellationToken::new(), foo, tx1));
        assert!(svc.track_handler(2, CancellationToken::new(), foo, tx2));
        assert!(svc.track_handler(3, CancellationToken::new(), bar, tx3));

        assert!(svc.forward_to_handlers(foo, raw(1)));
        assert!(rx1.try_recv().is_ok(), "each subscriber gets a copy");
        assert!(rx2.try_recv().is_ok(), "each subscriber gets a copy");
        assert!(rx3.try_recv().is_err(), "other channels receive nothing");

        assert!(
            !svc.forward_to_handlers(Tag4CC::new(*b"none"), raw(2)),
            "no subscriber means not accepted"
        );
    }

    #[test]
    fn test_stop_refuses_new_sessions() {
        let svc = test_service();
        svc.stop();
        let (tx, _rx) = queue();
        assert!(!svc.track_peer(1, CancellationToken::new(), tx.clone(), None));
        assert!(!svc.track_handler(2, CancellationToken::new(), Tag4CC::new(*b"foo "), tx));
    }
}

//! Test harness: loopback nodes, stores and fixtures.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use dogenet_net::{NetConfig, NetService};
use dogenet_proto::{Address, KeyPair};
use dogenet_store::{SqliteStore, Store};

/// An in-memory store bound to a fresh cancel token.
pub fn mem_store() -> (Arc<SqliteStore>, CancellationToken) {
    let cancel = CancellationToken::new();
    let store = Arc::new(SqliteStore::open_in_memory(cancel.clone()).unwrap());
    (store, cancel)
}

/// A routable-looking test address.
pub fn public_addr(n: u8) -> Address {
    Address::parse(&format!("203.0.113.{n}:42069"), 0).unwrap()
}

/// A full node running on loopback sockets.
pub struct TestNode {
    pub svc: Arc<NetService>,
    pub store: Arc<SqliteStore>,
    pub keys: KeyPair,
    pub cancel: CancellationToken,
    _dir: TempDir,
}

impl TestNode {
    /// Boot a node with one loopback gossip listener and a handler
    /// socket in a private temp directory.
    pub async fn spawn(n: u8) -> Self {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let store = Arc::new(SqliteStore::open_in_memory(cancel.clone()).unwrap());
        let keys = KeyPair::generate();
        let svc = NetService::new(
            NetConfig {
                bind_addrs: vec![Address::parse("127.0.0.1:0", 0).unwrap()],
                public_addr: public_addr(n),
                socket_path: dir.path().join("dogenet.sock"),
                allow_local: true,
                node_key: keys.clone(),
                identity: [n; 32],
            },
            store.clone() as Arc<dyn Store>,
            cancel.clone(),
        );
        tokio::spawn(svc.clone().run());

        let node = Self {
            svc,
            store,
            keys,
            cancel,
            _dir: dir,
        };
        assert!(
            wait_until(|| !node.svc.listen_addrs().is_empty(), Duration::from_secs(5)).await,
            "listener did not come up"
        );
        assert!(
            wait_until(|| node.svc.get_announcement().is_some(), Duration::from_secs(5)).await,
            "announcement was not generated"
        );
        node
    }

    /// The actual bound gossip address.
    pub fn gossip_addr(&self) -> Address {
        self.svc.listen_addrs()[0]
    }

    /// Path of the handler socket.
    pub fn socket_path(&self) -> std::path::PathBuf {
        self._dir.path().join("dogenet.sock")
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

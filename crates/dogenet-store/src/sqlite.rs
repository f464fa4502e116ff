//! SQLite-backed [`Store`] implementation.
//!
//! A single connection serializes all access (SQLite is single-writer
//! even in WAL mode); every operation runs in one transaction with
//! bounded retry on transient busy/locked errors.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use dogenet_proto::{Address, AddressMsg, PubKey, Tag4CC};

use crate::{
    CoreNodeEntry, CoreStats, NetNodeEntry, NodeInfo, NodeList, NodeRecord, Store, StoreError,
    StoreResult, StoredAnnouncement, TrimResult, MAX_CHANNEL_DAYS, MAX_CORE_NODE_DAYS,
    MAX_NET_NODE_DAYS, SECONDS_PER_DAY,
};

/// Transient-conflict retry budget: 120 attempts, 250 ms apart.
const TXN_RETRY_LIMIT: u32 = 120;
const TXN_RETRY_DELAY: Duration = Duration::from_millis(250);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    dayc INTEGER NOT NULL,
    last INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS announce (
    payload BLOB NOT NULL,
    sig BLOB NOT NULL,
    time INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS channels (
    chan INTEGER NOT NULL PRIMARY KEY,
    dayc INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS core (
    address BLOB NOT NULL PRIMARY KEY,
    time INTEGER NOT NULL,
    services INTEGER NOT NULL,
    isnew BOOLEAN NOT NULL,
    dayc INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS core_time_i ON core (time);
CREATE INDEX IF NOT EXISTS core_isnew_i ON core (isnew);
CREATE TABLE IF NOT EXISTS node (
    key BLOB NOT NULL PRIMARY KEY,
    address BLOB NOT NULL,
    time INTEGER NOT NULL,
    owner BLOB NOT NULL,
    payload BLOB NOT NULL,
    sig BLOB NOT NULL,
    dayc INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS node_time_i ON node (time);
CREATE INDEX IF NOT EXISTS node_address_i ON node (address);
CREATE TABLE IF NOT EXISTS chan (
    node INTEGER NOT NULL,
    chan INTEGER NOT NULL,
    PRIMARY KEY (node, chan)
) WITHOUT ROWID;
";

/// The number of whole days since the unix epoch.
fn unix_day_stamp() -> i64 {
    now_unix() / SECONDS_PER_DAY
}

/// Current unix time in seconds.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Map a rusqlite error into the store taxonomy.
fn db_err(err: rusqlite::Error, context: &str) -> StoreError {
    match &err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        rusqlite::Error::SqliteFailure(ffi, _) => match ffi.code {
            ErrorCode::ConstraintViolation => {
                StoreError::AlreadyExists(format!("{context}: {err}"))
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreError::Conflict(format!("{context}: {err}"))
            }
            _ => StoreError::Problem(format!("{context}: {err}")),
        },
        _ => StoreError::Problem(format!("{context}: {err}")),
    }
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    cancel: CancellationToken,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str, cancel: CancellationToken) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| db_err(e, "opening database"))?;
        Self::init(conn, cancel)
    }

    /// An in-memory store, for tests.
    pub fn open_in_memory(cancel: CancellationToken) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err(e, "opening database"))?;
        Self::init(conn, cancel)
    }

    fn init(conn: Connection, cancel: CancellationToken) -> StoreResult<Self> {
        // WAL keeps readers off the writer's back; best-effort (the
        // in-memory database used by tests has no journal to configure)
        let _ = conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        );
        conn.execute_batch(SCHEMA)
            .map_err(|e| db_err(e, "creating database schema"))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            cancel,
        };
        store.with_txn("init config", |tx| {
            let existing: Option<i64> = tx
                .query_row("SELECT dayc FROM config LIMIT 1", [], |row| row.get(0))
                .optional()
                .map_err(|e| db_err(e, "init config"))?;
            if existing.is_none() {
                tx.execute(
                    "INSERT INTO config (dayc, last) VALUES (1, ?1)",
                    params![unix_day_stamp()],
                )
                .map_err(|e| db_err(e, "init config"))?;
            }
            Ok(())
        })?;
        Ok(store)
    }

    /// Run `work` in a transaction, retrying transient conflicts.
    fn with_txn<T>(
        &self,
        name: &str,
        mut work: impl FnMut(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut remaining = TXN_RETRY_LIMIT;
        loop {
            let result = {
                let mut conn = self.conn.lock();
                let tx = match conn.transaction() {
                    Ok(tx) => tx,
                    Err(e) => return Err(db_err(e, name)),
                };
                match work(&tx) {
                    Ok(out) => tx.commit().map(|_| out).map_err(|e| db_err(e, name)),
                    Err(e) => Err(e),
                }
            };
            match result {
                Err(e) if e.is_conflict() && remaining > 1 && !self.cancel.is_cancelled() => {
                    remaining -= 1;
                    std::thread::sleep(TXN_RETRY_DELAY);
                }
                other => return other,
            }
        }
    }

    /// Overwrite the day-counter row. Maintenance/test hook; the trimmer
    /// is the only production writer.
    pub fn force_day_config(&self, dayc: i64, last: i64) -> StoreResult<()> {
        self.with_txn("force day config", |tx| {
            tx.execute("UPDATE config SET dayc=?1, last=?2", params![dayc, last])
                .map_err(|e| db_err(e, "force day config"))?;
            Ok(())
        })
    }
}

impl Store for SqliteStore {
    fn core_stats(&self) -> StoreResult<CoreStats> {
        self.with_txn("core stats", |tx| {
            let total: i64 = tx
                .query_row("SELECT COUNT(address) FROM core", [], |row| row.get(0))
                .map_err(|e| db_err(e, "core stats"))?;
            let new: i64 = tx
                .query_row("SELECT COUNT(address) FROM core WHERE isnew=TRUE", [], |row| {
                    row.get(0)
                })
                .map_err(|e| db_err(e, "core stats"))?;
            Ok(CoreStats {
                total: total as usize,
                new: new as usize,
            })
        })
    }

    fn net_stats(&self) -> StoreResult<usize> {
        self.with_txn("net stats", |tx| {
            let total: i64 = tx
                .query_row("SELECT COUNT(key) FROM node", [], |row| row.get(0))
                .map_err(|e| db_err(e, "net stats"))?;
            Ok(total as usize)
        })
    }

    fn node_list(&self) -> StoreResult<NodeList> {
        self.with_txn("node list", |tx| {
            let mut core = Vec::new();
            let mut stmt = tx
                .prepare("SELECT address, time, services FROM core")
                .map_err(|e| db_err(e, "node list"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| db_err(e, "node list"))?;
            for row in rows {
                let (addr, time, services) = row.map_err(|e| db_err(e, "node list"))?;
                let address = match Address::from_bytes(&addr) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "skipping core row with bad address");
                        continue;
                    }
                };
                core.push(CoreNodeEntry {
                    address: address.to_string(),
                    time,
                    services: services as u64,
                });
            }

            let mut net = Vec::new();
            let mut stmt = tx
                .prepare("SELECT key, payload, time FROM node")
                .map_err(|e| db_err(e, "node list"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| db_err(e, "node list"))?;
            for row in rows {
                let (key, payload, time) = row.map_err(|e| db_err(e, "node list"))?;
                // the payload carries the address and channel list
                let msg = match AddressMsg::decode(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "skipping node row with bad payload");
                        continue;
                    }
                };
                net.push(NetNodeEntry {
                    pubkey: hex::encode(&key),
                    address: msg.address.to_string(),
                    time,
                    channels: msg.channels.iter().map(|c| c.to_string()).collect(),
                    identity: hex::encode(msg.owner),
                });
            }

            Ok(NodeList { core, net })
        })
    }

    fn trim_nodes(&self) -> StoreResult<TrimResult> {
        self.with_txn("trim nodes", |tx| {
            let (dayc, last): (i64, i64) = tx
                .query_row("SELECT dayc, last FROM config LIMIT 1", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(|e| db_err(e, "trim: read config"))?;

            let today = unix_day_stamp();
            if last == today {
                return Ok(TrimResult::default());
            }

            let dayc = dayc + 1;
            tx.execute(
                "UPDATE config SET dayc=?1, last=?2",
                params![dayc, today],
            )
            .map_err(|e| db_err(e, "trim: update config"))?;

            let removed_core = tx
                .execute("DELETE FROM core WHERE dayc < ?1", params![dayc])
                .map_err(|e| db_err(e, "trim: delete core"))? as u64;
            let removed_net = tx
                .execute("DELETE FROM node WHERE dayc < ?1", params![dayc])
                .map_err(|e| db_err(e, "trim: delete node"))? as u64;
            // channel subscriptions age out on the same counter
            tx.execute("DELETE FROM channels WHERE dayc < ?1", params![dayc])
                .map_err(|e| db_err(e, "trim: delete channels"))?;

            Ok(TrimResult {
                advanced: true,
                removed_core,
                removed_net,
            })
        })
    }

    fn add_core_node(
        &self,
        address: Address,
        time: i64,
        remain_days: i64,
        services: u64,
    ) -> StoreResult<()> {
        self.with_txn("add core node", |tx| {
            let key = address.to_bytes().to_vec();
            // the expiry day-count never moves backwards
            let updated = tx
                .execute(
                    "UPDATE core SET time=?1, services=?2,
                        dayc=MAX(dayc, ?3+(SELECT dayc FROM config LIMIT 1))
                     WHERE address=?4",
                    params![time, services as i64, remain_days, key],
                )
                .map_err(|e| db_err(e, "add core node: update"))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO core (address, time, services, isnew, dayc)
                     VALUES (?1, ?2, ?3, TRUE, ?4+(SELECT dayc FROM config LIMIT 1))",
                    params![key, time, services as i64, remain_days],
                )
                .map_err(|e| db_err(e, "add core node: insert"))?;
            }
            Ok(())
        })
    }

    fn update_core_time(&self, address: Address) -> StoreResult<()> {
        self.with_txn("update core time", |tx| {
            tx.execute(
                "UPDATE core SET time=?1, isnew=FALSE,
                    dayc=?2+(SELECT dayc FROM config LIMIT 1)
                 WHERE address=?3",
                params![now_unix(), MAX_CORE_NODE_DAYS, address.to_bytes().to_vec()],
            )
            .map_err(|e| db_err(e, "update core time"))?;
            Ok(())
        })
    }

    fn choose_core_node(&self) -> StoreResult<Address> {
        self.with_txn("choose core node", |tx| {
            let pick: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT address FROM core WHERE isnew=TRUE ORDER BY RANDOM() LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| db_err(e, "choose core node"))?;
            let pick = match pick {
                Some(addr) => addr,
                None => tx
                    .query_row(
                        "SELECT address FROM core WHERE isnew=FALSE ORDER BY RANDOM() LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(|e| db_err(e, "choose core node"))?,
            };
            Address::from_bytes(&pick)
                .map_err(|e| StoreError::Problem(format!("stored core address: {e}")))
        })
    }

    fn get_announcement(&self) -> StoreResult<Option<StoredAnnouncement>> {
        self.with_txn("get announcement", |tx| {
            let row: Option<(Vec<u8>, Vec<u8>, i64)> = tx
                .query_row("SELECT payload, sig, time FROM announce LIMIT 1", [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .optional()
                .map_err(|e| db_err(e, "get announcement"))?;
            match row {
                Some((payload, sig, expires)) => {
                    let signature: [u8; 64] = sig.try_into().map_err(|_| {
                        StoreError::Problem("stored announcement signature is not 64 bytes".into())
                    })?;
                    Ok(Some(StoredAnnouncement {
                        payload,
                        signature,
                        expires,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    fn set_announcement(&self, payload: &[u8], sig: &[u8; 64], expires: i64) -> StoreResult<()> {
        self.with_txn("set announcement", |tx| {
            let updated = tx
                .execute(
                    "UPDATE announce SET payload=?1, sig=?2, time=?3",
                    params![payload, sig.as_slice(), expires],
                )
                .map_err(|e| db_err(e, "set announcement: update"))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO announce (payload, sig, time) VALUES (?1, ?2, ?3)",
                    params![payload, sig.as_slice(), expires],
                )
                .map_err(|e| db_err(e, "set announcement: insert"))?;
            }
            Ok(())
        })
    }

    fn add_net_node(
        &self,
        key: &PubKey,
        address: Address,
        time: i64,
        owner: &PubKey,
        channels: &[Tag4CC],
        payload: &[u8],
        sig: &[u8; 64],
    ) -> StoreResult<bool> {
        self.with_txn("add net node", |tx| {
            let existing: Option<(i64, Vec<u8>)> = tx
                .query_row(
                    "SELECT rowid, payload FROM node WHERE key=?1 LIMIT 1",
                    params![key.as_slice()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| db_err(e, "add net node: select"))?;

            let rowid = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO node (key, address, time, owner, payload, sig, dayc)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                                 ?7+(SELECT dayc FROM config LIMIT 1))",
                        params![
                            key.as_slice(),
                            address.to_bytes().to_vec(),
                            time,
                            owner.as_slice(),
                            payload,
                            sig.as_slice(),
                            MAX_NET_NODE_DAYS
                        ],
                    )
                    .map_err(|e| db_err(e, "add net node: insert"))?;
                    tx.last_insert_rowid()
                }
                Some((rowid, stored)) => {
                    if stored == payload {
                        // identical announcement: nothing to change
                        return Ok(false);
                    }
                    tx.execute(
                        "UPDATE node SET address=?1, time=?2, owner=?3, payload=?4, sig=?5,
                            dayc=?6+(SELECT dayc FROM config LIMIT 1)
                         WHERE key=?7",
                        params![
                            address.to_bytes().to_vec(),
                            time,
                            owner.as_slice(),
                            payload,
                            sig.as_slice(),
                            MAX_NET_NODE_DAYS,
                            key.as_slice()
                        ],
                    )
                    .map_err(|e| db_err(e, "add net node: update"))?;
                    rowid
                }
            };

            // replace the node's channel set atomically
            tx.execute("DELETE FROM chan WHERE node=?1", params![rowid])
                .map_err(|e| db_err(e, "add net node: clear channels"))?;
            let mut insert = tx
                .prepare("INSERT INTO chan (node, chan) VALUES (?1, ?2)")
                .map_err(|e| db_err(e, "add net node: prepare"))?;
            for channel in channels {
                insert
                    .execute(params![rowid, channel.as_u32() as i64])
                    .map_err(|e| db_err(e, "add net node: insert channel"))?;
            }
            Ok(true)
        })
    }

    fn update_net_time(&self, key: &PubKey) -> StoreResult<()> {
        self.with_txn("update net time", |tx| {
            tx.execute(
                "UPDATE node SET dayc=?1+(SELECT dayc FROM config LIMIT 1) WHERE key=?2",
                params![MAX_NET_NODE_DAYS, key.as_slice()],
            )
            .map_err(|e| db_err(e, "update net time"))?;
            Ok(())
        })
    }

    fn choose_net_node(&self) -> StoreResult<NodeInfo> {
        self.with_txn("choose net node", |tx| {
            let (key, addr): (Vec<u8>, Vec<u8>) = tx
                .query_row(
                    "SELECT key, address FROM node ORDER BY RANDOM() LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| db_err(e, "choose net node"))?;
            let pubkey: PubKey = key.try_into().map_err(|_| {
                StoreError::Problem("stored node key is not 32 bytes".into())
            })?;
            let address = Address::from_bytes(&addr)
                .map_err(|e| StoreError::Problem(format!("stored node address: {e}")))?;
            Ok(NodeInfo { pubkey, address })
        })
    }

    fn choose_net_node_msg(&self) -> StoreResult<NodeRecord> {
        self.with_txn("choose net node msg", |tx| {
            let (key, payload, sig): (Vec<u8>, Vec<u8>, Vec<u8>) = tx
                .query_row(
                    "SELECT key, payload, sig FROM node ORDER BY RANDOM() LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(|e| db_err(e, "choose net node msg"))?;
            let pubkey: PubKey = key.try_into().map_err(|_| {
                StoreError::Problem("stored node key is not 32 bytes".into())
            })?;
            let signature: [u8; 64] = sig.try_into().map_err(|_| {
                StoreError::Problem("stored node signature is not 64 bytes".into())
            })?;
            Ok(NodeRecord {
                pubkey,
                payload,
                signature,
            })
        })
    }

    fn get_channels(&self) -> StoreResult<Vec<Tag4CC>> {
        self.with_txn("get channels", |tx| {
            let mut stmt = tx
                .prepare("SELECT chan FROM channels")
                .map_err(|e| db_err(e, "get channels"))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(|e| db_err(e, "get channels"))?;
            let mut channels = Vec::new();
            for row in rows {
                let value = row.map_err(|e| db_err(e, "get channels"))?;
                channels.push(Tag4CC::from_u32(value as u32));
            }
            Ok(channels)
        })
    }

    fn add_channel(&self, channel: Tag4CC) -> StoreResult<()> {
        self.with_txn("add channel", |tx| {
            let chan = channel.as_u32() as i64;
            let updated = tx
                .execute(
                    "UPDATE channels SET dayc=?1+(SELECT dayc FROM config LIMIT 1) WHERE chan=?2",
                    params![MAX_CHANNEL_DAYS, chan],
                )
                .map_err(|e| db_err(e, "add channel: update"))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO channels (chan, dayc)
                     VALUES (?1, ?2+(SELECT dayc FROM config LIMIT 1))",
                    params![chan, MAX_CHANNEL_DAYS],
                )
                .map_err(|e| db_err(e, "add channel: insert"))?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dogenet_proto::{KeyPair, Service, CORE_NODE_DEFAULT_PORT, SERVICE_CORE};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(CancellationToken::new()).unwrap()
    }

    fn addr(last_octet: u8) -> Address {
        Address::parse(&format!("203.0.113.{last_octet}:42069"), 0).unwrap()
    }

    fn announce_for(keys: &KeyPair, address: Address) -> (AddressMsg, Vec<u8>, [u8; 64]) {
        let msg = AddressMsg {
            time: 1000,
            address,
            owner: [9u8; 32],
            channels: vec![Tag4CC::new(*b"shib")],
            services: vec![Service {
                tag: SERVICE_CORE,
                port: CORE_NODE_DEFAULT_PORT,
            }],
        };
        let payload = msg.encode();
        let sig = keys.sign(&payload);
        (msg, payload, sig)
    }

    #[test]
    fn test_config_seeded_once() {
        let s = store();
        // re-running init logic must not duplicate the row; trim works
        let trim = s.trim_nodes().unwrap();
        assert!(!trim.advanced);
    }

    #[test]
    fn test_core_node_upsert_and_stats() {
        let s = store();
        s.add_core_node(addr(1), 100, MAX_CORE_NODE_DAYS, 5).unwrap();
        s.add_core_node(addr(2), 100, MAX_CORE_NODE_DAYS, 5).unwrap();
        let stats = s.core_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.new, 2);

        // successful contact clears the is-new flag
        s.update_core_time(addr(1)).unwrap();
        let stats = s.core_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.new, 1);
    }

    #[test]
    fn test_choose_core_node_prefers_new() {
        let s = store();
        assert!(matches!(s.choose_core_node(), Err(StoreError::NotFound)));

        s.add_core_node(addr(1), 100, MAX_CORE_NODE_DAYS, 0).unwrap();
        s.add_core_node(addr(2), 100, MAX_CORE_NODE_DAYS, 0).unwrap();
        s.update_core_time(addr(1)).unwrap();

        // only addr(2) is still new, so it must always win
        for _ in 0..10 {
            assert_eq!(s.choose_core_node().unwrap(), addr(2));
        }

        // once no new records remain, contacted records are returned
        s.update_core_time(addr(2)).unwrap();
        let pick = s.choose_core_node().unwrap();
        assert!(pick == addr(1) || pick == addr(2));
    }

    #[test]
    fn test_expiry_never_moves_backwards() {
        let s = store();
        s.add_core_node(addr(1), 100, MAX_CORE_NODE_DAYS, 0).unwrap();
        // a re-add with a shorter remaining lifetime must not shorten
        // expiry: the row keeps dayc = 1+3 = 4
        s.add_core_node(addr(1), 200, 0, 0).unwrap();

        // advancing to day-count 3 would reap a shortened record (0+1=1)
        // but not the original one
        s.force_day_config(2, 0).unwrap();
        let trim = s.trim_nodes().unwrap();
        assert!(trim.advanced);
        assert_eq!(trim.removed_core, 0, "record expired too early");

        // past its real lifetime it is reaped
        s.force_day_config(4, 0).unwrap();
        let trim = s.trim_nodes().unwrap();
        assert!(trim.advanced);
        assert_eq!(trim.removed_core, 1);
    }

    #[test]
    fn test_day_rollover_trims_once() {
        let s = store();
        s.force_day_config(5, 1000).unwrap();
        s.add_core_node(addr(1), 100, 0, 0).unwrap(); // row dayc = 5

        let trim = s.trim_nodes().unwrap();
        assert!(trim.advanced);
        assert_eq!(trim.removed_core, 1);

        // a second pass on the same day advances nothing
        let trim = s.trim_nodes().unwrap();
        assert!(!trim.advanced);
        assert_eq!(trim.removed_core, 0);
    }

    #[test]
    fn test_announcement_singleton() {
        let s = store();
        assert!(s.get_announcement().unwrap().is_none());

        s.set_announcement(b"first", &[1u8; 64], 123).unwrap();
        s.set_announcement(b"second", &[2u8; 64], 456).unwrap();

        let stored = s.get_announcement().unwrap().unwrap();
        assert_eq!(stored.payload, b"second");
        assert_eq!(stored.signature, [2u8; 64]);
        assert_eq!(stored.expires, 456);
    }

    #[test]
    fn test_add_net_node_change_detection() {
        let s = store();
        let keys = KeyPair::generate();
        let key = keys.public();
        let (msg, payload, sig) = announce_for(&keys, addr(7));

        let changed = s
            .add_net_node(&key, msg.address, 100, &msg.owner, &msg.channels, &payload, &sig)
            .unwrap();
        assert!(changed, "first insert reports a change");

        let changed = s
            .add_net_node(&key, msg.address, 100, &msg.owner, &msg.channels, &payload, &sig)
            .unwrap();
        assert!(!changed, "identical payload reports no change");

        // a different body (new time) is a change and replaces channels
        let mut msg2 = msg.clone();
        msg2.time += 1;
        msg2.channels = vec![Tag4CC::new(*b"wow ")];
        let payload2 = msg2.encode();
        let sig2 = keys.sign(&payload2);
        let changed = s
            .add_net_node(&key, msg2.address, 101, &msg2.owner, &msg2.channels, &payload2, &sig2)
            .unwrap();
        assert!(changed);

        assert_eq!(s.net_stats().unwrap(), 1);
        let list = s.node_list().unwrap();
        assert_eq!(list.net.len(), 1);
        assert_eq!(list.net[0].channels, vec!["wow ".to_string()]);
    }

    #[test]
    fn test_choose_net_node_empty_is_not_found() {
        let s = store();
        assert!(matches!(s.choose_net_node(), Err(StoreError::NotFound)));
        assert!(matches!(s.choose_net_node_msg(), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_choose_net_node_msg_returns_stored_record() {
        let s = store();
        let keys = KeyPair::generate();
        let (msg, payload, sig) = announce_for(&keys, addr(3));
        s.add_net_node(
            &keys.public(),
            msg.address,
            100,
            &msg.owner,
            &msg.channels,
            &payload,
            &sig,
        )
        .unwrap();

        let record = s.choose_net_node_msg().unwrap();
        assert_eq!(record.pubkey, keys.public());
        assert_eq!(record.payload, payload);
        assert_eq!(record.signature, sig);

        let info = s.choose_net_node().unwrap();
        assert_eq!(info.pubkey, keys.public());
        assert_eq!(info.address, addr(3));
    }

    #[test]
    fn test_channel_subscriptions() {
        let s = store();
        assert!(s.get_channels().unwrap().is_empty());

        let shib = Tag4CC::new(*b"shib");
        s.add_channel(shib).unwrap();
        s.add_channel(shib).unwrap(); // upsert, not duplicate
        s.add_channel(Tag4CC::new(*b"wow ")).unwrap();

        let mut channels = s.get_channels().unwrap();
        channels.sort();
        assert_eq!(channels.len(), 2);
        assert!(channels.contains(&shib));
    }

    #[test]
    fn test_channel_rows_expire_on_rollover() {
        let s = store();
        s.add_channel(Tag4CC::new(*b"shib")).unwrap(); // dayc = 1+7 = 8
        s.force_day_config(9, 1000).unwrap();
        let trim = s.trim_nodes().unwrap();
        assert!(trim.advanced); // dayc now 10 > 8
        assert!(s.get_channels().unwrap().is_empty());
    }

    #[test]
    fn test_sample_contracts_unimplemented() {
        let s = store();
        assert!(s.sample_nodes_by_channel(&[], &[]).is_err());
        assert!(s.sample_nodes_by_ip([0u8; 16], &[]).is_err());
    }
}

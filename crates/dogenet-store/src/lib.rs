//! # dogenet-store
//!
//! Transactional persistence for the DogeNet node: overlay peer records,
//! crawled Core nodes, channel subscriptions and the local announcement,
//! with day-counter soft expiry that tolerates long downtimes.
//!
//! [`Store`] is a pure capability set; [`SqliteStore`] is the shipped
//! implementation and tests may substitute any other.

mod error;
mod sqlite;
mod trimmer;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;
pub use trimmer::run_trimmer;

use dogenet_proto::{Address, PubKey, Tag4CC};

/// Seconds in a calendar day, the unit of the expiry day counter.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Crawled Core node records live this many logical days.
pub const MAX_CORE_NODE_DAYS: i64 = 3;

/// Overlay node records live this many logical days.
pub const MAX_NET_NODE_DAYS: i64 = 30;

/// Channel subscriptions live this many logical days.
pub const MAX_CHANNEL_DAYS: i64 = 7;

/// Counts of crawled Core records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreStats {
    /// All records.
    pub total: usize,
    /// Records still awaiting a first successful contact.
    pub new: usize,
}

/// Outcome of a [`Store::trim_nodes`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrimResult {
    /// Whether the day counter advanced (deletions only occur when it does).
    pub advanced: bool,
    /// Core rows removed.
    pub removed_core: u64,
    /// Overlay node rows removed.
    pub removed_net: u64,
}

/// An overlay peer's dialing coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeInfo {
    pub pubkey: PubKey,
    pub address: Address,
}

impl NodeInfo {
    /// True when both key and address are usable.
    pub fn is_valid(&self) -> bool {
        self.pubkey != [0u8; 32] && self.address.is_valid()
    }
}

/// A stored overlay announcement, ready for re-gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub pubkey: PubKey,
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
}

/// The persisted local announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAnnouncement {
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
    /// Absolute unix expiry.
    pub expires: i64,
}

/// A crawled Core node, as reported by the admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreNodeEntry {
    pub address: String,
    pub time: i64,
    pub services: u64,
}

/// An overlay node, as reported by the admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNodeEntry {
    pub pubkey: String,
    pub address: String,
    pub time: i64,
    pub channels: Vec<String>,
    pub identity: String,
}

/// Both tables for the admin API.
#[derive(Debug, Clone, Default)]
pub struct NodeList {
    pub core: Vec<CoreNodeEntry>,
    pub net: Vec<NetNodeEntry>,
}

/// The persistence capability set the node core consumes.
///
/// Every operation is a single transaction; transient busy/locked
/// conditions are retried internally and surface as [`StoreError::Conflict`]
/// only when the retry budget is exhausted.
pub trait Store: Send + Sync {
    /// Counts of crawled Core records (total, still-new).
    fn core_stats(&self) -> StoreResult<CoreStats>;

    /// Count of overlay peer records.
    fn net_stats(&self) -> StoreResult<usize>;

    /// All records, for the admin API.
    fn node_list(&self) -> StoreResult<NodeList>;

    /// Advance the day counter if the calendar day changed, then delete
    /// expired core, node and channel rows. No-op within the same day.
    fn trim_nodes(&self) -> StoreResult<TrimResult>;

    /// Upsert a crawled Core node. The expiry day-count never moves
    /// backwards; inserts are flagged is-new.
    fn add_core_node(
        &self,
        address: Address,
        time: i64,
        remain_days: i64,
        services: u64,
    ) -> StoreResult<()>;

    /// Record a successful contact: bump the timestamp, clear the is-new
    /// flag and refresh the expiry. No-op if the record is absent.
    fn update_core_time(&self, address: Address) -> StoreResult<()>;

    /// A uniformly random Core node, preferring never-contacted records.
    fn choose_core_node(&self) -> StoreResult<Address>;

    /// The stored local announcement, if any.
    fn get_announcement(&self) -> StoreResult<Option<StoredAnnouncement>>;

    /// Replace the local announcement.
    fn set_announcement(&self, payload: &[u8], sig: &[u8; 64], expires: i64) -> StoreResult<()>;

    /// Upsert an overlay node by key, replacing its channel set.
    /// Returns `false` only when the stored payload bytes are identical.
    #[allow(clippy::too_many_arguments)]
    fn add_net_node(
        &self,
        key: &PubKey,
        address: Address,
        time: i64,
        owner: &PubKey,
        channels: &[Tag4CC],
        payload: &[u8],
        sig: &[u8; 64],
    ) -> StoreResult<bool>;

    /// Refresh an overlay node's expiry day-count. No-op if absent.
    fn update_net_time(&self, key: &PubKey) -> StoreResult<()>;

    /// A uniformly random overlay node's dialing coordinates.
    fn choose_net_node(&self) -> StoreResult<NodeInfo>;

    /// A uniformly random overlay node's stored announcement.
    fn choose_net_node_msg(&self) -> StoreResult<NodeRecord>;

    /// All locally subscribed channels.
    fn get_channels(&self) -> StoreResult<Vec<Tag4CC>>;

    /// Upsert a channel subscription with a fresh expiry.
    fn add_channel(&self, channel: Tag4CC) -> StoreResult<()>;

    /// Sample up to N overlay nodes subscribed to any of `channels`,
    /// excluding the given keys.
    ///
    /// TODO: pin down the sampling contract (N, uniformity, exclusion
    /// semantics) before wiring up the first caller.
    fn sample_nodes_by_channel(
        &self,
        _channels: &[Tag4CC],
        _exclude: &[PubKey],
    ) -> StoreResult<Vec<NodeInfo>> {
        Err(StoreError::Problem(
            "sample_nodes_by_channel is not implemented".into(),
        ))
    }

    /// Sample up to N overlay nodes sharing an IP, excluding the given keys.
    ///
    /// TODO: pin down the sampling contract before wiring up the first
    /// caller.
    fn sample_nodes_by_ip(
        &self,
        _host: [u8; 16],
        _exclude: &[PubKey],
    ) -> StoreResult<Vec<NodeInfo>> {
        Err(StoreError::Problem(
            "sample_nodes_by_ip is not implemented".into(),
        ))
    }
}

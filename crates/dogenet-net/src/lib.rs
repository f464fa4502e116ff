//! # dogenet-net
//!
//! The DogeNet networking fabric:
//!
//! - [`NetService`] — listeners, peer attraction, tracking tables,
//!   broadcast/forward primitives
//! - peer sessions — one encrypted gossip connection per remote node,
//!   with at most one live session per node key
//! - handler sessions — local subscribers on the filesystem socket
//! - the announcement loop — periodic re-gossip of this node's signed
//!   self-description

mod announce;
mod error;
mod handler;
mod peer;
mod service;

pub use announce::ANNOUNCE_LONGEVITY;
pub use error::NetError;
pub use service::{NetConfig, NetService, DEFAULT_PROTOCOL_SOCKET, IDEAL_PEERS, PEER_LOCK_TIME};

//! # dogenet-crawler
//!
//! Walks the Dogecoin Core P2P network to keep the store's table of
//! reachable full nodes populated. Each pass picks a node from the
//! store (preferring never-contacted ones), performs the version
//! handshake, records the contact and ingests one batch of peer
//! addresses. Unreachable nodes are simply left to age out.

mod msg;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dogenet_proto::Address;
use dogenet_store::{Store, StoreError, MAX_CORE_NODE_DAYS};

use msg::{
    decode_addr_list, decode_envelope, encode_envelope, verify_checksum, NetAddr, VersionMessage,
    ENVELOPE_SIZE, PROTOCOL_VERSION,
};

/// Dial and per-exchange deadline.
const CONTACT_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent string we introduce ourselves with.
const USER_AGENT: &str = "/dogenet:0.1.0/";

/// Errors from one crawl contact. None of them outlive the contact.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    BadMessage(String),

    #[error("contact timed out")]
    Timeout,

    #[error("remote closed the connection")]
    Closed,
}

/// A periodic Core-network walker.
pub struct Crawler {
    store: Arc<dyn Store>,
    /// A pinned node to re-contact (the `--core` flag); `None` lets the
    /// store choose a target each pass.
    fixed: Option<Address>,
    period: Duration,
    cancel: CancellationToken,
}

impl Crawler {
    pub fn new(
        store: Arc<dyn Store>,
        fixed: Option<Address>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            fixed,
            period,
            cancel,
        }
    }

    /// Run until cancelled: one contact attempt per period.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.period) => {}
            }
            let target = match self.fixed {
                Some(addr) => addr,
                None => match self.store.choose_core_node() {
                    Ok(addr) => addr,
                    Err(StoreError::NotFound) => {
                        debug!("no core nodes known yet");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "choose_core_node failed");
                        continue;
                    }
                },
            };
            match self.contact(target).await {
                Ok(found) => {
                    info!(addr = %target, discovered = found, "core node contacted");
                }
                Err(e) => {
                    // leave the record in place; the day counter will
                    // reap nodes that stay unreachable
                    debug!(addr = %target, error = %e, "core node unreachable");
                }
            }
        }
    }

    /// One full exchange: version handshake, record the contact, collect
    /// one batch of addresses. Returns how many addresses were ingested.
    async fn contact(&self, target: Address) -> Result<usize, CrawlError> {
        let mut stream =
            tokio::time::timeout(CONTACT_TIMEOUT, TcpStream::connect(target.to_socket_addr()))
                .await
                .map_err(|_| CrawlError::Timeout)??;

        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: now_unix(),
            remote_addr: NetAddr {
                services: 0,
                address: target,
            },
            local_addr: NetAddr::default(),
            nonce: rand::thread_rng().gen(),
            agent: USER_AGENT.into(),
            height: 0,
            relay: false,
        };
        send(&mut stream, "version", &version.encode()).await?;

        // their version tells us the services bitmask to record
        let mut their_version = None;
        let mut got_verack = false;
        let deadline = tokio::time::Instant::now() + CONTACT_TIMEOUT;
        while their_version.is_none() || !got_verack {
            let (command, payload) = receive(&mut stream, deadline).await?;
            match command.as_str() {
                "version" => {
                    let v = VersionMessage::decode(&payload)?;
                    debug!(addr = %target, agent = %v.agent, height = v.height, "version received");
                    send(&mut stream, "verack", &[]).await?;
                    their_version = Some(v);
                }
                "verack" => got_verack = true,
                other => debug!(command = %other, "ignoring pre-handshake message"),
            }
        }
        let services = their_version.map(|v| v.services).unwrap_or(0);

        // a successful handshake refreshes the record and clears is-new
        if let Err(e) = self
            .store
            .add_core_node(target, now_unix(), MAX_CORE_NODE_DAYS, services)
        {
            warn!(error = %e, "add_core_node failed");
        }
        if let Err(e) = self.store.update_core_time(target) {
            warn!(error = %e, "update_core_time failed");
        }

        // ask for peers and ingest one addr batch
        send(&mut stream, "getaddr", &[]).await?;
        let deadline = tokio::time::Instant::now() + CONTACT_TIMEOUT;
        let mut found = 0;
        loop {
            let (command, payload) = match receive(&mut stream, deadline).await {
                Ok(pair) => pair,
                // some nodes never answer getaddr; the handshake already
                // counted as a successful contact
                Err(CrawlError::Timeout) | Err(CrawlError::Closed) => break,
                Err(e) => return Err(e),
            };
            if command != "addr" {
                debug!(command = %command, "skipping message while waiting for addr");
                continue;
            }
            for entry in decode_addr_list(&payload)? {
                if !entry.address.is_valid() || entry.address.is_private() {
                    continue;
                }
                if let Err(e) = self.store.add_core_node(
                    entry.address,
                    entry.time as i64,
                    MAX_CORE_NODE_DAYS,
                    entry.services,
                ) {
                    warn!(error = %e, "add_core_node failed");
                    continue;
                }
                found += 1;
            }
            break;
        }
        Ok(found)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Write one framed message.
async fn send(stream: &mut TcpStream, command: &str, payload: &[u8]) -> Result<(), CrawlError> {
    stream
        .write_all(&encode_envelope(command, payload))
        .await?;
    Ok(())
}

/// Read one framed message before `deadline`.
async fn receive(
    stream: &mut TcpStream,
    deadline: tokio::time::Instant,
) -> Result<(String, Vec<u8>), CrawlError> {
    let mut header = [0u8; ENVELOPE_SIZE];
    read_exact_by(stream, &mut header, deadline).await?;
    let (command, length, sum) = decode_envelope(&header)?;
    let mut payload = vec![0u8; length];
    read_exact_by(stream, &mut payload, deadline).await?;
    verify_checksum(&payload, &sum)?;
    Ok((command, payload))
}

async fn read_exact_by(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: tokio::time::Instant,
) -> Result<(), CrawlError> {
    match tokio::time::timeout_at(deadline, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CrawlError::Closed),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(CrawlError::Timeout),
    }
}

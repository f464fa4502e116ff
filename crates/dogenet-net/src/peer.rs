//! One peer session: a single gossip connection to a remote node.
//!
//! Each session runs a reader task and a writer task. The writer drains
//! the session's bounded outbound queue; the reader decodes, verifies
//! and routes inbound messages. Any error on either side tears down the
//! whole session, and only this session.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dogenet_proto::{
    doge_to_unix, Address, AddressMsg, Message, MessageCodec, PubKey, RawMessage, CHANNEL_NODE,
    TAG_ADDRESS,
};

use dogenet_store::Store;

use crate::error::NetError;
use crate::service::{NetService, SessionId, SEND_QUEUE_DEPTH};

/// Time allowed for the remote's announcement to arrive.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Start a session on an accepted or dialed connection. `expected` is
/// the dial target's key for outbound connections, `None` for inbound.
pub(crate) fn spawn_peer(
    service: Arc<NetService>,
    stream: TcpStream,
    addr: Address,
    expected: Option<PubKey>,
) {
    tokio::spawn(async move {
        let id = service.next_session_id();
        let token = service.cancel.child_token();
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        // outbound sessions claim their key up front; inbound sessions
        // adopt it once the remote's announcement arrives
        if !service.track_peer(id, token.clone(), send_tx.clone(), expected) {
            debug!(addr = %addr, "dropping connection: duplicate peer or stopping");
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(write_loop(write_half, send_rx, token.clone()));

        let mut session = PeerSession {
            service: service.clone(),
            id,
            addr,
            token: token.clone(),
            send_tx,
            peer_key: expected,
        };
        match session.run(read_half, expected).await {
            Ok(()) | Err(NetError::Closed) => {
                debug!(addr = %addr, "peer connection closed");
            }
            Err(NetError::Stopping) => {}
            Err(e) => {
                debug!(addr = %addr, error = %e, "closing peer connection");
            }
        }

        token.cancel();
        let _ = writer.await;
        service.close_peer(id, session.peer_key);
        if let Some(key) = session.peer_key {
            debug!(addr = %addr, peer = %hex::encode(key), "peer session ended");
        }
    });
}

/// Drain the outbound queue onto the socket until cancelled or broken.
async fn write_loop(
    write_half: OwnedWriteHalf,
    mut send_rx: mpsc::Receiver<RawMessage>,
    token: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, MessageCodec::new());
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = send_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = sink.send(msg).await {
            debug!(error = %e, "peer write failed");
            // wake the reader so the session tears down
            token.cancel();
            break;
        }
    }
}

struct PeerSession {
    service: Arc<NetService>,
    id: SessionId,
    addr: Address,
    token: CancellationToken,
    send_tx: mpsc::Sender<RawMessage>,
    peer_key: Option<PubKey>,
}

impl PeerSession {
    async fn run(
        &mut self,
        read_half: OwnedReadHalf,
        expected: Option<PubKey>,
    ) -> Result<(), NetError> {
        let mut framed = FramedRead::new(read_half, MessageCodec::new());
        let outbound = expected.is_some();

        // outbound speaks first
        if outbound {
            self.send_announcement();
        }

        // the remote's announcement, within the handshake deadline
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| NetError::HandshakeTimeout)?
            .ok_or(NetError::Closed)??;
        if first.channel != CHANNEL_NODE || first.tag != TAG_ADDRESS {
            return Err(NetError::Protocol(dogenet_proto::ProtoError::BadFrame(
                format!("expected announcement, got {}/{}", first.channel, first.tag),
            )));
        }

        if let Some(expected) = expected {
            if first.pubkey != expected {
                return Err(NetError::WrongPeer {
                    expected: hex::encode(expected),
                    got: hex::encode(first.pubkey),
                });
            }
        } else {
            // inbound: claim the key, then answer with our announcement
            if !self
                .service
                .adopt_peer(self.id, self.send_tx.clone(), first.pubkey)
            {
                // leave peer_key unset so close_peer cannot touch the
                // incumbent session's entry
                return Err(NetError::DuplicatePeer(hex::encode(first.pubkey)));
            }
            self.peer_key = Some(first.pubkey);
            self.send_announcement();
        }
        self.handle_announcement(&first);

        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => return Err(NetError::Stopping),
                frame = framed.next() => frame,
            };
            match frame {
                Some(Ok(msg)) => self.route(msg),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(NetError::Closed),
            }
        }
    }

    /// Queue the current signed announcement for this peer.
    fn send_announcement(&self) {
        match self.service.get_announcement() {
            Some(ann) => {
                let _ = self.send_tx.try_send(ann);
            }
            None => debug!(addr = %self.addr, "no announcement ready yet"),
        }
    }

    /// Dispatch one decoded, signature-checked inbound message.
    fn route(&self, msg: Message) {
        if msg.channel == CHANNEL_NODE {
            if msg.tag == TAG_ADDRESS {
                self.handle_announcement(&msg);
            } else {
                debug!(addr = %self.addr, tag = %msg.tag, "ignoring unknown node-channel message");
            }
            return;
        }
        let channel = msg.channel;
        if !self.service.forward_to_handlers(channel, msg.to_raw()) {
            // nobody local wants this channel; keep the connection, the
            // peer's other traffic may still be of interest
            debug!(addr = %self.addr, channel = %channel, "no handler for channel");
        }
    }

    /// Ingest a peer announcement: upsert the node record and gossip
    /// genuinely-new announcements onward to everyone but the sender.
    fn handle_announcement(&self, msg: &Message) {
        if msg.pubkey == self.service.config.node_key.public() {
            return; // our own announcement, reflected
        }
        let body = match AddressMsg::decode(&msg.payload) {
            Ok(body) => body,
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "bad announcement payload");
                return;
            }
        };
        if !body.address.is_valid() {
            debug!(addr = %self.addr, "announcement with unusable address");
            return;
        }
        match self.service.store.add_net_node(
            &msg.pubkey,
            body.address,
            doge_to_unix(body.time),
            &body.owner,
            &body.channels,
            &msg.payload,
            &msg.signature,
        ) {
            Ok(true) => {
                debug!(peer = %hex::encode(msg.pubkey), "new announcement, gossiping onward");
                self.service
                    .forward_to_peers_except(msg.to_raw(), &msg.pubkey);
            }
            Ok(false) => {
                // same announcement again: the node is alive, keep it fresh
                if let Err(e) = self.service.store.update_net_time(&msg.pubkey) {
                    warn!(error = %e, "update_net_time failed");
                }
            }
            Err(e) => warn!(error = %e, "add_net_node failed"),
        }
    }
}

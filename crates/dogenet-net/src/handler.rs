//! One handler session: a local subscriber on the filesystem socket.
//!
//! After accept, the client sends a 4-byte channel tag declaring what it
//! wants to receive. Every frame it sends afterwards is a message to
//! inject into the overlay; every frame we send is a message seen on its
//! channel. Several handlers may share a channel; each gets its own copy.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dogenet_proto::{MessageCodec, RawMessage, Tag4CC};
use dogenet_store::Store;

use crate::error::NetError;
use crate::service::{NetService, SessionId, SEND_QUEUE_DEPTH};

/// Time allowed for the channel declaration after connect.
const DECLARE_TIMEOUT: Duration = Duration::from_secs(30);

/// Start a session on an accepted handler connection.
pub(crate) fn spawn_handler(service: Arc<NetService>, stream: UnixStream) {
    tokio::spawn(async move {
        let id = service.next_session_id();
        let token = service.cancel.child_token();

        match run_handler(service.clone(), id, stream, token.clone()).await {
            Ok(()) | Err(NetError::Closed) => debug!("handler disconnected"),
            Err(NetError::Stopping) => {}
            Err(e) => debug!(error = %e, "closing handler connection"),
        }

        token.cancel();
        service.close_handler(id);
    });
}

async fn run_handler(
    service: Arc<NetService>,
    id: SessionId,
    mut stream: UnixStream,
    token: CancellationToken,
) -> Result<(), NetError> {
    // the 4-byte channel declaration comes first, unframed
    let mut tag = [0u8; 4];
    tokio::time::timeout(DECLARE_TIMEOUT, stream.read_exact(&mut tag))
        .await
        .map_err(|_| NetError::HandshakeTimeout)??;
    let channel = Tag4CC::new(tag);
    info!(channel = %channel, "handler subscribed");

    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    if !service.track_handler(id, token.clone(), channel, send_tx) {
        return Err(NetError::Stopping);
    }

    // subscribing is what makes this node announce interest in the
    // channel: persist it and re-gossip an updated announcement
    match service.store.add_channel(channel) {
        Ok(()) => service.refresh_announcement(),
        Err(e) => warn!(error = %e, "cannot persist channel subscription"),
    }

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(handler_write_loop(write_half, send_rx, token.clone()));

    let result = handler_read_loop(&service, read_half, &token).await;
    token.cancel();
    let _ = writer.await;
    result
}

/// Forward inbound frames from the handler to every connected peer.
async fn handler_read_loop(
    service: &Arc<NetService>,
    read_half: OwnedReadHalf,
    token: &CancellationToken,
) -> Result<(), NetError> {
    let mut framed = FramedRead::new(read_half, MessageCodec::new());
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Err(NetError::Stopping),
            frame = framed.next() => frame,
        };
        match frame {
            Some(Ok(msg)) => {
                debug!(channel = %msg.channel, tag = %msg.tag, "injecting handler message");
                service.forward_to_peers(msg.to_raw());
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(NetError::Closed),
        }
    }
}

/// Drain the handler's receive queue onto its socket.
async fn handler_write_loop(
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
            debug!(error = %e, "handler write failed");
            token.cancel();
            break;
        }
    }
}

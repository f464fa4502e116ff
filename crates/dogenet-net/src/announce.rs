//! The announcement loop.
//!
//! Generates, persists and periodically re-gossips this node's signed
//! self-description. A body that matches the stored announcement (apart
//! from its timestamp) re-uses the stored signature, so an unchanged
//! node restarting is invisible to the rest of the overlay.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{info, warn};

use dogenet_proto::{
    encode_message, reencode_header, unix_to_doge, AddressMsg, RawMessage, ADDR_MSG_MIN_SIZE,
    CHANNEL_NODE, TAG_ADDRESS,
};
use dogenet_store::Store;

use crate::service::NetService;

/// How long each signed announcement stays valid before it is re-signed
/// and re-gossiped.
pub const ANNOUNCE_LONGEVITY: Duration = Duration::from_secs(5 * 60);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Run until cancelled: publish on start, then re-sign on every address
/// change and on every expiry.
pub(crate) async fn run_announcer(
    service: Arc<NetService>,
    mut addr_change: mpsc::Receiver<AddressMsg>,
) {
    let mut next = service.announcement_body();
    let (msg, remain) = load_or_generate(&service, &mut next);
    service.set_announcement(msg);
    let mut deadline = tokio::time::Instant::now() + remain;

    loop {
        tokio::select! {
            _ = service.cancel.cancelled() => return,

            changed = addr_change.recv() => {
                let Some(changed) = changed else { return };
                info!("address information changed, signing a new announcement");
                next = changed;
                let (msg, remain) = generate(&service, &mut next);
                service.set_announcement(msg.clone());
                service.forward_to_peers(msg);
                deadline = tokio::time::Instant::now() + remain;
            }

            _ = tokio::time::sleep_until(deadline) => {
                let (msg, remain) = generate(&service, &mut next);
                service.set_announcement(msg.clone());
                info!("announcement expired, gossiping a fresh signature");
                service.forward_to_peers(msg);
                deadline = tokio::time::Instant::now() + remain;
            }
        }
    }
}

/// Reuse the persisted announcement when it still matches what we would
/// announce now, otherwise sign a fresh one.
pub(crate) fn load_or_generate(
    service: &NetService,
    next: &mut AddressMsg,
) -> (RawMessage, Duration) {
    let now = now_unix();
    match service.store.get_announcement() {
        Ok(Some(stored))
            if stored.payload.len() >= ADDR_MSG_MIN_SIZE && now < stored.expires =>
        {
            if let Ok(old) = AddressMsg::decode(&stored.payload) {
                // compare bodies with the stored timestamp patched in:
                // only a real change forces a new signature
                let mut fresh = next.clone();
                fresh.time = old.time;
                if fresh.encode() == stored.payload {
                    let remain = (stored.expires - now) as u64;
                    info!(seconds = remain, "re-using stored announcement");
                    let header = reencode_header(
                        CHANNEL_NODE,
                        TAG_ADDRESS,
                        &service.config.node_key.public(),
                        &stored.signature,
                        &stored.payload,
                    );
                    return (
                        RawMessage {
                            header,
                            payload: stored.payload,
                        },
                        Duration::from_secs(remain),
                    );
                }
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "cannot load stored announcement"),
    }
    generate(service, next)
}

/// Stamp, sign, persist and return a fresh announcement.
pub(crate) fn generate(service: &NetService, next: &mut AddressMsg) -> (RawMessage, Duration) {
    let now = now_unix();
    next.time = unix_to_doge(now);
    let payload = next.encode();
    let msg = encode_message(
        CHANNEL_NODE,
        TAG_ADDRESS,
        &service.config.node_key,
        payload.clone(),
    );
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&msg.header[40..104]);
    let expires = now + ANNOUNCE_LONGEVITY.as_secs() as i64;
    if let Err(e) = service.store.set_announcement(&payload, &sig, expires) {
        warn!(error = %e, "cannot store announcement");
    }
    (msg, ANNOUNCE_LONGEVITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dogenet_proto::{Address, KeyPair, MessageCodec};
    use dogenet_store::{SqliteStore, Store};
    use std::sync::Arc;
    use tokio_util::codec::Decoder;
    use tokio_util::sync::CancellationToken;

    use crate::service::{NetConfig, NetService};

    fn test_service() -> Arc<NetService> {
        let cancel = CancellationToken::new();
        let store = Arc::new(SqliteStore::open_in_memory(cancel.clone()).unwrap());
        let config = NetConfig {
            bind_addrs: vec![],
            public_addr: Address::parse("203.0.113.5:42069", 0).unwrap(),
            socket_path: std::env::temp_dir().join("dogenet-announce-test.sock"),
            allow_local: false,
            node_key: KeyPair::generate(),
            identity: [5u8; 32],
        };
        NetService::new(config, store, cancel)
    }

    fn decode_frame(raw: &RawMessage) -> dogenet_proto::Message {
        let mut codec = MessageCodec::new();
        let mut buf = bytes::BytesMut::from(&raw.to_wire()[..]);
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_cold_start_generates_and_persists() {
        let svc = test_service();
        let mut next = svc.announcement_body();
        let before = now_unix();
        let (raw, remain) = load_or_generate(&svc, &mut next);

        assert_eq!(remain, ANNOUNCE_LONGEVITY);

        // the frame is a valid signed announcement from our node key
        let msg = decode_frame(&raw);
        assert_eq!(msg.channel, CHANNEL_NODE);
        assert_eq!(msg.tag, TAG_ADDRESS);
        assert_eq!(msg.pubkey, svc.config.node_key.public());

        let body = AddressMsg::decode(&msg.payload).unwrap();
        assert_eq!(body.address, svc.config.public_addr);
        assert_eq!(body.owner, [5u8; 32]);
        assert!(body.channels.is_empty());
        assert_eq!(body.services.len(), 1);

        // persisted with the configured longevity
        let stored = svc.store.get_announcement().unwrap().unwrap();
        assert_eq!(stored.payload, msg.payload);
        assert!(stored.expires >= before + ANNOUNCE_LONGEVITY.as_secs() as i64);
    }

    #[test]
    fn test_restart_reuses_unexpired_signature() {
        let svc = test_service();
        let mut next = svc.announcement_body();
        let (first, _) = load_or_generate(&svc, &mut next);
        let stored = svc.store.get_announcement().unwrap().unwrap();

        // a fresh start with the same configuration must not re-sign
        let mut next2 = svc.announcement_body();
        let (second, remain) = load_or_generate(&svc, &mut next2);
        assert_eq!(second.payload, first.payload);
        assert_eq!(second.header, first.header);
        assert!(remain <= ANNOUNCE_LONGEVITY);

        // and the stored row is untouched
        let stored2 = svc.store.get_announcement().unwrap().unwrap();
        assert_eq!(stored, stored2);
    }

    #[test]
    fn test_changed_body_forces_new_signature() {
        let svc = test_service();
        let mut next = svc.announcement_body();
        let (first, _) = load_or_generate(&svc, &mut next);

        // a new channel subscription changes the body
        svc.store
            .add_channel(dogenet_proto::Tag4CC::new(*b"shib"))
            .unwrap();
        let mut next2 = svc.announcement_body();
        let (second, _) = load_or_generate(&svc, &mut next2);
        assert_ne!(second.payload, first.payload);

        let body = AddressMsg::decode(&second.payload).unwrap();
        assert_eq!(body.channels.len(), 1);
    }

    #[test]
    fn test_expired_announcement_is_resigned() {
        let svc = test_service();
        let mut next = svc.announcement_body();
        let _ = load_or_generate(&svc, &mut next);

        // force the stored row into the past
        let stored = svc.store.get_announcement().unwrap().unwrap();
        svc.store
            .set_announcement(&stored.payload, &stored.signature, now_unix() - 1)
            .unwrap();

        // an expired row cannot be re-used: the full longevity comes back
        // and the stored expiry moves into the future again
        let mut next2 = svc.announcement_body();
        let (_, remain) = load_or_generate(&svc, &mut next2);
        assert_eq!(remain, ANNOUNCE_LONGEVITY);
        let refreshed = svc.store.get_announcement().unwrap().unwrap();
        assert!(refreshed.expires > now_unix());
    }
}

//! Handler socket tests: subscription, fan-out and injection across
//! the full gossip path.

use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::FramedRead;

use dogenet_proto::{encode_message, KeyPair, Message, MessageCodec, Tag4CC};
use dogenet_store::{NodeInfo, Store};

use crate::harness::{wait_until, TestNode};

/// Connect a handler socket and declare a channel.
async fn subscribe(node: &TestNode, channel: &[u8; 4]) -> UnixStream {
    let mut stream = UnixStream::connect(node.socket_path()).await.unwrap();
    stream.write_all(channel).await.unwrap();
    stream
}

/// Read one framed message with a deadline.
async fn read_frame(stream: UnixStream) -> Message {
    let mut framed = FramedRead::new(stream, MessageCodec::new());
    tokio::time::timeout(Duration::from_secs(10), framed.next())
        .await
        .expect("timed out waiting for handler frame")
        .expect("handler socket closed")
        .expect("bad frame on handler socket")
}

/// Two subscribers on one channel each get a copy; a third channel's
/// subscriber gets nothing; subscribing records the channel.
#[tokio::test]
async fn test_handler_fanout_and_subscription() {
    let node = TestNode::spawn(10).await;
    let foo = Tag4CC::new(*b"foo ");

    let h1 = subscribe(&node, b"foo ").await;
    let h2 = subscribe(&node, b"foo ").await;
    let mut h3 = subscribe(&node, b"bar ").await;

    // all three sessions tracked, subscriptions recorded
    assert!(
        wait_until(|| node.svc.count_handlers() == 3, Duration::from_secs(5)).await,
        "handler sessions were not tracked"
    );
    assert!(
        wait_until(
            || node.store.get_channels().map(|c| c.len()).unwrap_or(0) == 2,
            Duration::from_secs(5),
        )
        .await,
        "channel subscriptions were not recorded"
    );

    // a peer message on "foo " reaches both subscribers
    let keys = KeyPair::generate();
    let msg = encode_message(foo, Tag4CC::new(*b"test"), &keys, b"much gossip".to_vec());
    assert!(
        node.svc.forward_to_handlers(foo, msg),
        "no handler accepted the message"
    );

    let got1 = read_frame(h1).await;
    let got2 = read_frame(h2).await;
    assert_eq!(got1.payload, b"much gossip");
    assert_eq!(got2.payload, b"much gossip");

    // the "bar " subscriber saw nothing
    let mut buf = [0u8; 1];
    let quiet = tokio::time::timeout(Duration::from_millis(300), async {
        use tokio::io::AsyncReadExt;
        h3.read(&mut buf).await
    })
    .await;
    assert!(quiet.is_err(), "wrong-channel handler received data");
}

/// A message injected by a local handler travels through a real peer
/// session to the remote node's subscriber.
#[tokio::test]
async fn test_handler_injection_reaches_remote_subscriber() {
    let a = TestNode::spawn(11).await;
    let b = TestNode::spawn(12).await;

    b.svc.add_peer(NodeInfo {
        pubkey: a.keys.public(),
        address: a.gossip_addr(),
    });
    assert!(
        wait_until(
            || a.svc.count_peers() == 1 && b.svc.count_peers() == 1,
            Duration::from_secs(10),
        )
        .await,
        "peers did not connect"
    );

    // remote subscriber first, so nothing is dropped for lack of one
    let remote = subscribe(&b, b"foo ").await;
    assert!(
        wait_until(
            || b.store.get_channels().map(|c| !c.is_empty()).unwrap_or(false),
            Duration::from_secs(5),
        )
        .await
    );

    // local handler injects a signed message
    let mut local = subscribe(&a, b"foo ").await;
    let keys = KeyPair::generate();
    let msg = encode_message(
        Tag4CC::new(*b"foo "),
        Tag4CC::new(*b"test"),
        &keys,
        b"to the moon".to_vec(),
    );
    local.write_all(&msg.to_wire()).await.unwrap();

    let got = read_frame(remote).await;
    assert_eq!(got.channel, Tag4CC::new(*b"foo "));
    assert_eq!(got.payload, b"to the moon");
    assert_eq!(got.pubkey, keys.public());
}

//! Store scenario tests: day-counter behavior across subsystems.

use dogenet_proto::{AddressMsg, KeyPair, Tag4CC};
use dogenet_store::{Store, StoreError, MAX_NET_NODE_DAYS};

use crate::harness::{mem_store, public_addr};

/// Day rollover: a stale core row is reaped exactly once, and the
/// counter advances exactly once per calendar day.
#[test]
fn test_day_rollover_reaps_stale_rows_once() {
    let (store, _cancel) = mem_store();

    // yesterday's state: day-count 5, last advanced on day 1000
    store.force_day_config(5, 1000).unwrap();
    store.add_core_node(public_addr(1), 100, 0, 0).unwrap(); // expires at day-count 5

    let trim = store.trim_nodes().unwrap();
    assert!(trim.advanced, "calendar day changed, counter must advance");
    assert_eq!(trim.removed_core, 1, "stale row must be reaped");

    let trim = store.trim_nodes().unwrap();
    assert!(!trim.advanced, "second pass on the same day must not advance");
    assert_eq!(trim.removed_core, 0);
}

/// Overlay records survive rollovers for their full lifetime, and
/// re-announcing refreshes the clock.
#[test]
fn test_net_node_expiry_refresh() {
    let (store, _cancel) = mem_store();
    let keys = KeyPair::generate();
    let msg = AddressMsg {
        time: 500,
        address: public_addr(9),
        owner: [1u8; 32],
        channels: vec![Tag4CC::new(*b"shib")],
        services: vec![],
    };
    let payload = msg.encode();
    let sig = keys.sign(&payload);
    store
        .add_net_node(
            &keys.public(),
            msg.address,
            100,
            &msg.owner,
            &msg.channels,
            &payload,
            &sig,
        )
        .unwrap(); // row expires at day-count 1 + 30

    // not yet: the record still has a day of life left
    store.force_day_config(MAX_NET_NODE_DAYS, 1000).unwrap();
    let trim = store.trim_nodes().unwrap();
    assert!(trim.advanced);
    assert_eq!(trim.removed_net, 0);

    // refreshing pushes expiry out again from the current day-count
    store.update_net_time(&keys.public()).unwrap();
    store
        .force_day_config(2 * MAX_NET_NODE_DAYS, 1001)
        .unwrap();
    let trim = store.trim_nodes().unwrap();
    assert!(trim.advanced);
    assert_eq!(trim.removed_net, 0, "refreshed record expired too early");

    // far enough in the future it goes away
    store
        .force_day_config(3 * MAX_NET_NODE_DAYS, 1002)
        .unwrap();
    let trim = store.trim_nodes().unwrap();
    assert_eq!(trim.removed_net, 1);
    assert!(matches!(store.choose_net_node(), Err(StoreError::NotFound)));
}

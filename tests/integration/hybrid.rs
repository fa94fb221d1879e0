//! Hybrid transport: large blobs over TCP, small ones and acks over UDP.

use std::time::Duration;

use abacus_core::{Message, MessageType};
use abacus_services::MessageStore;

use crate::{introduce_all, spawn_node, wait_until, Kind};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn large_and_small_blobs_both_replicate() {
    let a = spawn_node(1, Kind::Hybrid, "hy-mixed").await;
    let b = spawn_node(2, Kind::Hybrid, "hy-mixed").await;
    introduce_all(&[&a, &b]);
    assert!(a.tcp_addr.is_some());

    let statement = vec![b'x'; 500_000];
    let big = Message::stamped(1, 1, MessageType::ProblemUpdate, &statement);
    let small = Message::stamped(1, 2, MessageType::Clarification, b"clarified");
    a.resend.publish(&big);
    a.resend.publish(&small);

    let arrived = wait_until(WAIT, || async {
        b.store.has_message(big.key()) && b.store.has_message(small.key())
    })
    .await;
    assert!(arrived, "hybrid replication incomplete");
    assert_eq!(b.store.get(big.key()), Some(big.clone()));
    assert_eq!(b.store.get(small.key()), Some(small.clone()));

    // both acknowledgements come back over UDP
    let acked = wait_until(WAIT, || async {
        a.store.acked_by(big.key()) == vec![2] && a.store.acked_by(small.key()) == vec![2]
    })
    .await;
    assert!(acked, "acks did not come back");

    let sent = a.messenger.stats();
    assert!(sent.tcp_records_sent >= 1);
    assert!(sent.datagrams_sent >= 1);
    assert!(b.messenger.stats().tcp_records_received >= 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn hybrid_and_udp_nodes_share_small_messages() {
    // a plain UDP node can still follow a hybrid node as long as every blob
    // fits under the inline limit
    let a = spawn_node(1, Kind::Hybrid, "hy-interop").await;
    let b = spawn_node(2, Kind::Udp, "hy-interop").await;
    introduce_all(&[&a, &b]);

    let msg = Message::stamped(1, 3, MessageType::Submission, b"#include <cstdio>");
    a.resend.publish(&msg);

    assert!(wait_until(WAIT, || async { b.store.has_message(msg.key()) }).await);
    assert!(wait_until(WAIT, || async { a.store.acked_by(msg.key()) == vec![2] }).await);

    a.stop().await;
    b.stop().await;
}

//! Replication across a UDP cluster: fan-out, ack bookkeeping, recovery from
//! lost fragments and lost acks.

use std::sync::atomic::Ordering;
use std::time::Duration;

use abacus_core::{Message, MessageType};
use abacus_services::MessageStore;

use crate::{introduce_all, spawn_node, wait_until, Kind, LossyRelay};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn published_message_reaches_every_peer_and_is_acked() {
    let a = spawn_node(1, Kind::Udp, "fanout").await;
    let b = spawn_node(2, Kind::Udp, "fanout").await;
    let c = spawn_node(3, Kind::Udp, "fanout").await;
    introduce_all(&[&a, &b, &c]);

    // large enough to need several fragments
    let source: Vec<u8> = (0..3_000u32).map(|i| (i % 251) as u8).collect();
    let msg = Message::stamped(1, 1, MessageType::Submission, &source);
    a.resend.publish(&msg);

    let replicated = wait_until(WAIT, || async {
        b.store.has_message(msg.key()) && c.store.has_message(msg.key())
    })
    .await;
    assert!(replicated, "message never reached both peers");
    assert_eq!(b.store.get(msg.key()), Some(msg.clone()));
    assert_eq!(c.store.get(msg.key()), Some(msg.clone()));

    let acked = wait_until(WAIT, || async {
        let mut by = a.store.acked_by(msg.key());
        by.sort();
        by == vec![2, 3]
    })
    .await;
    assert!(acked, "origin never saw acks from both peers");

    // acks are broadcast, so peers learn about each other's copies too
    assert!(wait_until(WAIT, || async { b.store.acked_by(msg.key()).contains(&3) }).await);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn many_messages_from_several_origins_all_arrive() {
    let a = spawn_node(1, Kind::Udp, "origins").await;
    let b = spawn_node(2, Kind::Udp, "origins").await;
    introduce_all(&[&a, &b]);

    let from_a: Vec<Message> = (1..=20)
        .map(|i| Message::new(1, i, i, MessageType::Clarification, format!("q{i}").as_bytes()))
        .collect();
    let from_b: Vec<Message> = (1..=20)
        .map(|i| Message::new(2, i, i, MessageType::SubmissionMark, format!("AC {i}").as_bytes()))
        .collect();
    for m in &from_a {
        a.resend.publish(m);
    }
    for m in &from_b {
        b.resend.publish(m);
    }

    let done = wait_until(WAIT, || async { a.store.len() == 40 && b.store.len() == 40 }).await;
    assert!(done, "stores did not converge: a={} b={}", a.store.len(), b.store.len());
    for m in from_a.iter().chain(&from_b) {
        assert_eq!(a.store.get(m.key()).as_ref(), Some(m));
        assert_eq!(b.store.get(m.key()).as_ref(), Some(m));
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn lost_fragments_are_recovered_by_resend() {
    let a = spawn_node(1, Kind::Udp, "lossy").await;
    let b = spawn_node(2, Kind::Udp, "lossy").await;
    introduce_all(&[&a, &b]);

    // a reaches b only through a relay that eats the first two datagrams
    let relay = LossyRelay::start(b.udp_addr, 2).await;
    let mut via_relay = b.address();
    via_relay.udp_port = relay.addr.port();
    a.table.set_peer(2, via_relay);

    let blob = vec![0xc3u8; 1_500];
    let msg = Message::new(1, 77, 1_700_000_000, MessageType::ProblemUpdate, &blob);
    a.resend.publish(&msg);

    let arrived = wait_until(WAIT, || async { b.store.has_message(msg.key()) }).await;
    assert!(arrived, "message was not recovered after loss");
    assert_eq!(b.store.get(msg.key()), Some(msg.clone()));
    assert_eq!(relay.dropped.load(Ordering::Relaxed), 2);
    assert!(relay.forwarded.load(Ordering::Relaxed) > 0);

    // acks go straight back to a
    assert!(wait_until(WAIT, || async { a.store.acked_by(msg.key()) == vec![2] }).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn lost_ack_is_answered_by_duplicate_ack() {
    let a = spawn_node(1, Kind::Udp, "dupack").await;
    let b = spawn_node(2, Kind::Udp, "dupack").await;

    // b cannot address a yet, so its first ack goes nowhere
    a.table.set_peer(2, b.address());

    let msg = Message::new(1, 5, 1, MessageType::CreateUser, b"team-rocket");
    a.resend.publish(&msg);

    assert!(wait_until(WAIT, || async { b.store.has_message(msg.key()) }).await);
    assert!(a.store.acked_by(msg.key()).is_empty());

    b.table.set_peer(1, a.address());

    // the next resend hits b's dedup check, which acks a directly
    let acked = wait_until(WAIT, || async { a.store.acked_by(msg.key()) == vec![2] }).await;
    assert!(acked, "duplicate was never acked");
    assert!(b.messenger.stats().duplicates_acked >= 1);
    assert_eq!(b.store.len(), 1);

    a.stop().await;
    b.stop().await;
}

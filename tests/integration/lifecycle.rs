//! Construction, initialisation failures and shutdown.

use std::sync::Arc;
use std::time::Duration;

use abacus_core::{Message, MessageType};
use anyhow::Context;
use abacus_services::{build_messenger, MemoryStore, MessageStore, MessengerError, PeerTable};

use crate::{introduce_all, node_config, spawn_node, spawn_with, wait_until, Kind};

fn collaborators() -> (Arc<PeerTable>, Arc<MemoryStore>) {
    (Arc::new(PeerTable::new(1, Vec::new())), Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn registry_builds_both_known_kinds() -> anyhow::Result<()> {
    for (kind, name) in [(Kind::Udp, "udp"), (Kind::Hybrid, "udtcp")] {
        let config = node_config(1, kind, "registry");
        let (table, store) = collaborators();
        let messenger = build_messenger(&config, table, store).context("build")?;
        assert_eq!(messenger.name(), name);
        messenger
            .initialise()
            .await
            .with_context(|| format!("initialise {name}"))?;
        messenger.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn unknown_kind_is_rejected() {
    let mut config = node_config(1, Kind::Udp, "unknown-kind");
    config.messenger.kind = "carrier-pigeon".into();
    let (table, store) = collaborators();
    match build_messenger(&config, table, store) {
        Err(MessengerError::UnknownKind(kind)) => assert_eq!(kind, "carrier-pigeon"),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("unknown kind was accepted"),
    }
}

#[tokio::test]
async fn missing_key_file_fails_initialise() {
    let mut config = node_config(1, Kind::Udp, "no-key");
    config.messenger.key_file = std::env::temp_dir().join("abacus-it-definitely-missing.key");
    let (table, store) = collaborators();
    let messenger = build_messenger(&config, table, store).unwrap();
    let err = messenger.initialise().await.unwrap_err();
    assert!(matches!(err, MessengerError::Crypto(_)), "got {err}");
}

#[tokio::test]
async fn stop_drains_the_inbound_loop() {
    let a = spawn_node(1, Kind::Udp, "drain").await;
    let b = spawn_node(2, Kind::Udp, "drain").await;
    introduce_all(&[&a, &b]);

    let msg = Message::stamped(1, 1, MessageType::CreateUser, b"judge");
    a.resend.publish(&msg);
    assert!(wait_until(Duration::from_secs(10), || async { b.store.has_message(msg.key()) }).await);

    // stop() panics if the inbound loop outlives the messenger
    assert_eq!(b.stop().await, 1);
    assert_eq!(a.stop().await, 0);
}

#[tokio::test]
async fn mismatched_keys_never_deliver() {
    let a = spawn_node(1, Kind::Udp, "key-a").await;

    // same iv, different key material
    let config = node_config(3, Kind::Udp, "key-c");
    std::fs::write(&config.messenger.key_file, [0x99u8; 32]).unwrap();
    let c = spawn_with(config, Kind::Udp).await;
    introduce_all(&[&a, &c]);

    let msg = Message::stamped(1, 1, MessageType::Submission, b"secret");
    a.resend.publish(&msg);

    let dropped = wait_until(Duration::from_secs(5), || async {
        c.messenger.stats().dropped_decrypt > 0
    })
    .await;
    assert!(dropped, "datagrams sealed under another key were not counted");
    assert!(!c.store.has_message(msg.key()));
    assert!(a.store.acked_by(msg.key()).is_empty());

    a.stop().await;
    c.stop().await;
}

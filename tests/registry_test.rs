use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream, ReadHalf};

use chatwire::auth::ParticipantRef;
use chatwire::core::{
    ChatMessage, Connection, ConnectionHandle, ConnectionRegistry, ConnectionState, MessageEnvelope,
    SharedRegistry, SystemMessage,
};
use chatwire::error::ChatwireError;

// Client side of one registered connection
struct Peer {
    handle: ConnectionHandle,
    remote: BufReader<DuplexStream>,
    _reader: ReadHalf<DuplexStream>,
}

impl Peer {
    async fn line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), self.remote.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        line
    }

    async fn assert_silent(&mut self) {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_millis(50), self.remote.read_line(&mut line)).await;
        assert!(read.is_err(), "unexpected data for {}: {:?}", self.handle.id(), line);
    }
}

async fn pending(registry: &ConnectionRegistry, id: &str) -> Peer {
    pending_with_buffer(registry, id, 4096).await
}

// `buffer` bounds how much the server can write before the client reads
async fn pending_with_buffer(registry: &ConnectionRegistry, id: &str, buffer: usize) -> Peer {
    let (local, remote) = tokio::io::duplex(buffer);
    let (connection, reader) = Connection::accept(local, id, Duration::from_secs(30));
    let handle = connection.handle();
    registry.add(connection).await.unwrap();
    Peer {
        handle,
        remote: BufReader::new(remote),
        _reader: reader,
    }
}

async fn connected(registry: &ConnectionRegistry, id: &str, username: &str) -> Peer {
    connected_with_buffer(registry, id, username, 4096).await
}

async fn connected_with_buffer(
    registry: &ConnectionRegistry,
    id: &str,
    username: &str,
    buffer: usize,
) -> Peer {
    let peer = pending_with_buffer(registry, id, buffer).await;
    registry
        .bind_participant(id, ParticipantRef(username.to_string()))
        .await
        .unwrap();
    registry.mark_connected(id).await.unwrap();
    peer
}

fn chat_at_noon(sender: &str, text: &str) -> MessageEnvelope {
    ChatMessage::at(sender, text, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()).into()
}

#[tokio::test]
async fn test_chat_reaches_everyone_but_sender() {
    let registry = ConnectionRegistry::new();
    let mut alice = connected(&registry, "10.0.0.1:5001", "alice").await;
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
    let mut carol = connected(&registry, "10.0.0.3:5003", "carol").await;

    let delivered = registry.dispatch(&chat_at_noon("alice", "hi")).await;
    assert_eq!(delivered, 2);

    assert_eq!(bob.line().await, "12:00:00: [             alice]: hi\n");
    assert_eq!(carol.line().await, "12:00:00: [             alice]: hi\n");
    alice.assert_silent().await;
}

#[tokio::test]
async fn test_chat_sender_match_ignores_case() {
    let registry = ConnectionRegistry::new();
    let mut alice = connected(&registry, "10.0.0.1:5001", "Alice").await;
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;

    assert_eq!(registry.dispatch(&chat_at_noon("alice", "hey")).await, 1);
    assert!(bob.line().await.ends_with("alice]: hey\n"));
    alice.assert_silent().await;
}

#[tokio::test]
async fn test_chat_skips_only_one_duplicate_identity() {
    let registry = ConnectionRegistry::new();
    let mut first = connected(&registry, "10.0.0.1:5001", "alice").await;
    let mut second = connected(&registry, "10.0.0.1:5002", "alice").await;
    let mut bob = connected(&registry, "10.0.0.2:5003", "bob").await;

    // Three connected entries, sender among them: at most two deliveries
    assert_eq!(registry.dispatch(&chat_at_noon("alice", "echo")).await, 2);
    assert!(bob.line().await.ends_with("]: echo\n"));

    // Exactly one of the two alice connections got the echo
    let mut line = String::new();
    let first_got = tokio::time::timeout(Duration::from_millis(50), first.remote.read_line(&mut line))
        .await
        .is_ok();
    let second_got = tokio::time::timeout(Duration::from_millis(50), second.remote.read_line(&mut line))
        .await
        .is_ok();
    assert!(first_got ^ second_got);
}

#[tokio::test]
async fn test_directed_system_message_reaches_only_recipient() {
    let registry = ConnectionRegistry::new();
    let mut alice = connected(&registry, "10.0.0.1:5001", "alice").await;
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
    let mut carol = connected(&registry, "10.0.0.3:5003", "carol").await;

    let notice: MessageEnvelope = SystemMessage::directed("10.0.0.2:5002", "leave-notice").into();
    assert_eq!(registry.dispatch(&notice).await, 1);

    let mut buf = [0u8; 12];
    bob.remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"leave-notice");
    alice.assert_silent().await;
    carol.assert_silent().await;
}

#[tokio::test]
async fn test_directed_to_unknown_recipient_is_noop() {
    let registry = ConnectionRegistry::new();
    let mut alice = connected(&registry, "10.0.0.1:5001", "alice").await;

    let notice: MessageEnvelope = SystemMessage::directed("10.9.9.9:1", "anyone?\n").into();
    assert_eq!(registry.dispatch(&notice).await, 0);
    alice.assert_silent().await;
}

#[tokio::test]
async fn test_non_connected_entries_never_written() {
    let registry = ConnectionRegistry::new();
    let mut waiting = pending(&registry, "10.0.0.9:5009").await;
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
    let mut carol = connected(&registry, "10.0.0.3:5003", "carol").await;

    let broadcast: MessageEnvelope = SystemMessage::broadcast("maintenance at noon\n").into();
    assert_eq!(registry.dispatch(&broadcast).await, 2);
    assert_eq!(bob.line().await, "maintenance at noon\n");
    assert_eq!(carol.line().await, "maintenance at noon\n");

    assert_eq!(registry.dispatch(&chat_at_noon("bob", "hello")).await, 1);
    assert!(carol.line().await.ends_with("]: hello\n"));

    // Directed at a Pending entry is not a delivery either
    let direct: MessageEnvelope = SystemMessage::directed("10.0.0.9:5009", "psst\n").into();
    assert_eq!(registry.dispatch(&direct).await, 0);
    waiting.assert_silent().await;

    carol.handle.close();
    assert_eq!(registry.dispatch(&broadcast).await, 1);
}

#[tokio::test]
async fn test_failed_recipient_does_not_stop_fanout() {
    let registry = ConnectionRegistry::new();
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
    let carol = connected(&registry, "10.0.0.3:5003", "carol").await;

    // Carol's client goes away without a goodbye
    let carol_handle = carol.handle.clone();
    drop(carol);

    // Only complete writes count
    let broadcast: MessageEnvelope = SystemMessage::broadcast("first\n").into();
    assert_eq!(registry.dispatch(&broadcast).await, 1);
    assert_eq!(bob.line().await, "first\n");

    // The writer noticed the broken pipe and retired the connection
    assert_eq!(carol_handle.state(), ConnectionState::Closed);

    let second: MessageEnvelope = SystemMessage::broadcast("second\n").into();
    assert_eq!(registry.dispatch(&second).await, 1);
    assert_eq!(bob.line().await, "second\n");
}

#[tokio::test]
async fn test_add_remove_exists() {
    let registry = ConnectionRegistry::new();
    let _peer = pending(&registry, "10.0.0.1:5001").await;

    assert!(registry.exists("10.0.0.1:5001").await);
    assert_eq!(registry.len().await, 1);
    assert_eq!(registry.state_of("10.0.0.1:5001").await, Some(ConnectionState::Pending));

    let removed = registry.remove("10.0.0.1:5001").await.unwrap();
    assert_eq!(removed.id(), "10.0.0.1:5001");
    assert!(!registry.exists("10.0.0.1:5001").await);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_precondition_violations_are_reported() {
    let registry = ConnectionRegistry::new();

    let err = registry.remove("10.0.0.1:5001").await.unwrap_err();
    assert!(err.is_invariant_violation());

    let err = registry.mark_connected("10.0.0.1:5001").await.unwrap_err();
    assert!(matches!(err, ChatwireError::Invariant(_)));

    let _peer = pending(&registry, "10.0.0.1:5001").await;
    let (local, _remote) = tokio::io::duplex(64);
    let (duplicate, _reader) = Connection::accept(local, "10.0.0.1:5001", Duration::from_secs(30));
    let err = registry.add(duplicate).await.unwrap_err();
    assert!(err.is_invariant_violation());
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_has_connected_participant_tracks_lifecycle() {
    let registry = ConnectionRegistry::new();
    let _bob = pending(&registry, "10.0.0.2:5002").await;
    registry
        .bind_participant("10.0.0.2:5002", ParticipantRef("bob".to_string()))
        .await
        .unwrap();

    // Bound but still Pending
    assert!(!registry.has_connected_participant("bob").await);

    registry.mark_connected("10.0.0.2:5002").await.unwrap();
    assert!(registry.has_connected_participant("bob").await);
    assert!(!registry.has_connected_participant("Bob").await);

    // Marking twice changes nothing
    registry.mark_connected("10.0.0.2:5002").await.unwrap();
    assert_eq!(registry.state_of("10.0.0.2:5002").await, Some(ConnectionState::Connected));

    registry.remove("10.0.0.2:5002").await.unwrap();
    assert!(!registry.has_connected_participant("bob").await);
}

#[tokio::test]
async fn test_connect_as_refuses_second_login() {
    let registry = ConnectionRegistry::new();
    let _first = pending(&registry, "10.0.0.1:5001").await;
    let _second = pending(&registry, "10.0.0.1:5002").await;
    let alice = ParticipantRef("alice".to_string());
    let general = chatwire::auth::ChannelRef("general".to_string());

    assert!(registry
        .connect_as("10.0.0.1:5001", alice.clone(), general.clone())
        .await
        .unwrap());
    assert!(!registry
        .connect_as("10.0.0.1:5002", alice, general)
        .await
        .unwrap());
    assert_eq!(registry.state_of("10.0.0.1:5002").await, Some(ConnectionState::Pending));
}

#[tokio::test]
async fn test_shutdown_all_closes_sockets() {
    let registry = ConnectionRegistry::new();
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
    let _waiting = pending(&registry, "10.0.0.9:5009").await;

    assert_eq!(registry.shutdown_all().await, 2);
    assert_eq!(bob.handle.state(), ConnectionState::Closed);

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), bob.remote.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_dead_and_stalled_peers_are_not_counted() {
    let registry = ConnectionRegistry::with_write_timeout(Duration::from_millis(100));
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
    let carol = connected(&registry, "10.0.0.3:5003", "carol").await;
    // Dave never reads and his socket buffer is tiny
    let dave = connected_with_buffer(&registry, "10.0.0.4:5004", "dave", 64).await;

    let carol_handle = carol.handle.clone();
    drop(carol);

    let payload = format!("{}\n", "x".repeat(1023));
    let broadcast: MessageEnvelope = SystemMessage::broadcast(payload.clone()).into();
    assert_eq!(registry.dispatch(&broadcast).await, 1);
    assert_eq!(bob.line().await, payload);

    assert_eq!(carol_handle.state(), ConnectionState::Closed);
    assert_eq!(dave.handle.state(), ConnectionState::Closed);

    // Neither is written to again
    for _ in 0..10 {
        assert_eq!(registry.dispatch(&broadcast).await, 1);
        assert_eq!(bob.line().await, payload);
    }
}

#[tokio::test]
async fn test_remove_waits_for_dispatch_in_flight() {
    let registry: SharedRegistry = Arc::new(ConnectionRegistry::with_write_timeout(
        Duration::from_millis(200),
    ));
    let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
    // A stalled recipient keeps the dispatch busy until the write timeout
    let _dave = connected_with_buffer(&registry, "10.0.0.4:5004", "dave", 8).await;

    let big: MessageEnvelope = SystemMessage::broadcast(format!("{}\n", "y".repeat(511))).into();
    let dispatch = tokio::spawn({
        let registry = registry.clone();
        async move { registry.dispatch(&big).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let remove = tokio::spawn({
        let registry = registry.clone();
        async move { registry.remove("10.0.0.2:5002").await.map(|c| c.id().to_string()) }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!remove.is_finished(), "remove ran while a dispatch held the registry");
    assert!(!dispatch.is_finished());

    // Bob was a member when the dispatch started, so he is counted
    assert_eq!(dispatch.await.unwrap(), 1);
    assert_eq!(remove.await.unwrap().unwrap(), "10.0.0.2:5002");
    assert_eq!(bob.line().await.len(), 512);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_remove_sees_consistent_membership() {
    for round in 0..20 {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let mut bob = connected(&registry, "10.0.0.2:5002", "bob").await;
        let mut carol = connected(&registry, "10.0.0.3:5003", "carol").await;
        let mut dave = connected(&registry, "10.0.0.4:5004", "dave").await;

        let notice: MessageEnvelope = SystemMessage::broadcast(format!("round {}\n", round)).into();
        let dispatch = tokio::spawn({
            let registry = registry.clone();
            async move { registry.dispatch(&notice).await }
        });
        let remove = tokio::spawn({
            let registry = registry.clone();
            async move { registry.remove("10.0.0.3:5003").await.is_ok() }
        });

        let delivered = dispatch.await.unwrap();
        assert!(remove.await.unwrap());

        // Either carol was still a member for the whole fan-out or not at all
        let expected = format!("round {}\n", round);
        assert_eq!(bob.line().await, expected);
        assert_eq!(dave.line().await, expected);
        match delivered {
            3 => assert_eq!(carol.line().await, expected),
            2 => carol.assert_silent().await,
            other => panic!("dispatch counted {} recipients", other),
        }
    }
}

// Integration tests for the messaging session against an in-process backend

mod common;

use std::time::Duration;

use parley::{ConnectionStatus, ErrorKind, FriendRequestStatus, Message, MessageType, SessionEvent, TransferOffer};

use common::{chat_peer, connected_peer, expect_event, setup_logging, wait_until, MockBackend};

#[tokio::test]
async fn test_connect_and_exchange_text() {
    setup_logging();
    let backend = MockBackend::start().await;

    let alice = chat_peer(&backend, "alice");
    let mut alice_events = alice.session.subscribe();
    alice.session.connect("alice", "tok-alice").await.unwrap();
    assert_eq!(alice.session.status(), ConnectionStatus::Connected);
    assert!(alice.session.is_connected());
    assert_eq!(alice.session.user_id(), "alice");

    expect_event(&mut alice_events, "connecting", |e| {
        matches!(e, SessionEvent::ConnectionChanged(ConnectionStatus::Connecting))
    })
    .await;
    expect_event(&mut alice_events, "connected", |e| {
        matches!(e, SessionEvent::ConnectionChanged(ConnectionStatus::Connected))
    })
    .await;

    let bob = connected_peer(&backend, "bob").await;
    wait_until("alice registered", || backend.is_connected("alice")).await;
    let mut bob_events = bob.session.subscribe();

    alice.session.send_message(Message::text("bob", "hi")).await.unwrap();

    let event = expect_event(&mut bob_events, "message from alice", |e| {
        matches!(e, SessionEvent::MessageReceived(_))
    })
    .await;
    match event {
        SessionEvent::MessageReceived(message) => {
            assert_eq!(message.kind(), MessageType::Text);
            assert_eq!(message.sender_id(), "alice");
            assert_eq!(message.receiver_id(), "bob");
            assert_eq!(message.content(), "hi");
        }
        other => panic!("unexpected event {:?}", other),
    }

    alice.session.disconnect().await.unwrap();
    assert_eq!(alice.session.status(), ConnectionStatus::Disconnected);
    let err = alice.session.send_message(Message::text("bob", "late")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);

    bob.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_token_sets_error_state() {
    setup_logging();
    let backend = MockBackend::start().await;
    let mallory = chat_peer(&backend, "mallory");

    let err = mallory.session.connect("mallory", "forged").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert_eq!(mallory.session.status(), ConnectionStatus::Error);
    assert!(!mallory.session.is_connected());

    // A failed attempt may be retried with good credentials
    mallory.session.connect("mallory", "tok-mallory").await.unwrap();
    assert!(mallory.session.is_connected());
    let again = mallory.session.connect("mallory", "tok-mallory").await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::InvalidOperation);

    mallory.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_hang_up_after_handshake_leaves_session_disconnected() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = chat_peer(&backend, "alice");

    backend.hang_up_next();
    alice.session.connect("alice", "tok-alice").await.unwrap();
    wait_until("hang-up noticed", || !alice.session.is_connected()).await;

    // Nothing flips it back afterwards
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        alice.session.status(),
        ConnectionStatus::Disconnected | ConnectionStatus::Error
    ));
    let err = alice.session.send_message(Message::text("bob", "anyone?")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);

    alice.session.connect("alice", "tok-alice").await.unwrap();
    assert!(alice.session.is_connected());
    alice.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_friend_handshake() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = connected_peer(&backend, "alice").await;
    let bob = connected_peer(&backend, "bob").await;
    let mut alice_events = alice.session.subscribe();
    let mut bob_events = bob.session.subscribe();

    let request_id = alice.session.add_friend("bob", "we met at the conference").await.unwrap();
    assert_eq!(alice.session.pending_friend_requests().len(), 1);

    let event = expect_event(&mut bob_events, "friend request", |e| matches!(e, SessionEvent::FriendRequest(_))).await;
    match event {
        SessionEvent::FriendRequest(request) => {
            assert_eq!(request.request_id, request_id);
            assert_eq!(request.sender_id, "alice");
            assert_eq!(request.message, "we met at the conference");
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Only the receiver can answer
    let err = alice.session.accept_friend_request(&request_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    bob.session.accept_friend_request(&request_id).await.unwrap();
    assert_eq!(bob.session.friends(), vec!["alice".to_string()]);
    assert!(bob.session.pending_friend_requests().is_empty());

    expect_event(&mut alice_events, "friend request answered", |e| {
        matches!(e, SessionEvent::FriendRequestAnswered(_))
    })
    .await;
    assert_eq!(alice.session.friends(), vec!["bob".to_string()]);
    assert!(alice.session.pending_friend_requests().is_empty());

    let err = bob.session.accept_friend_request(&request_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    assert_eq!(bob.session.friends().len(), 1);

    let err = bob.session.reject_friend_request("no-such-request").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    alice.session.disconnect().await.unwrap();
    bob.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_answers_send_one_response() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = connected_peer(&backend, "alice").await;
    let bob = connected_peer(&backend, "bob").await;
    let mut alice_events = alice.session.subscribe();
    let mut bob_events = bob.session.subscribe();

    let request_id = alice.session.add_friend("bob", "").await.unwrap();
    expect_event(&mut bob_events, "friend request", |e| matches!(e, SessionEvent::FriendRequest(_))).await;

    let (accepted, rejected) = tokio::join!(
        bob.session.accept_friend_request(&request_id),
        bob.session.reject_friend_request(&request_id),
    );
    let (outcome, loser) = match (accepted, rejected) {
        (Ok(()), Err(e)) => (FriendRequestStatus::Accepted, e),
        (Err(e), Ok(())) => (FriendRequestStatus::Rejected, e),
        other => panic!("expected exactly one answer to succeed: {:?}", other),
    };
    assert_eq!(loser.kind(), ErrorKind::InvalidOperation);
    assert!(bob.session.pending_friend_requests().is_empty());

    let answer = expect_event(&mut alice_events, "answer", |e| matches!(e, SessionEvent::FriendRequestAnswered(_))).await;
    match answer {
        SessionEvent::FriendRequestAnswered(request) => assert_eq!(request.status, outcome),
        other => panic!("unexpected event {:?}", other),
    }

    // The losing answer never made it onto the wire
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, SessionEvent::FriendRequestAnswered(_)), "second answer: {:?}", event);
    }
    assert_eq!(backend.control_frames_from("bob", "friend_request_response"), 1);
    let befriended = outcome == FriendRequestStatus::Accepted;
    assert_eq!(alice.session.friends().len(), befriended as usize);
    assert_eq!(bob.session.friends().len(), befriended as usize);

    alice.session.disconnect().await.unwrap();
    bob.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_friend_request_is_not_a_friend() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = connected_peer(&backend, "alice").await;
    let bob = connected_peer(&backend, "bob").await;
    let mut alice_events = alice.session.subscribe();
    let mut bob_events = bob.session.subscribe();

    let request_id = alice.session.add_friend("bob", "").await.unwrap();
    expect_event(&mut bob_events, "friend request", |e| matches!(e, SessionEvent::FriendRequest(_))).await;
    bob.session.reject_friend_request(&request_id).await.unwrap();

    expect_event(&mut alice_events, "rejection", |e| matches!(e, SessionEvent::FriendRequestAnswered(_))).await;
    assert!(alice.session.friends().is_empty());
    assert!(bob.session.friends().is_empty());

    alice.session.disconnect().await.unwrap();
    bob.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_presence_updates() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = connected_peer(&backend, "alice").await;
    let bob = connected_peer(&backend, "bob").await;

    // Bob announced himself on connect
    wait_until("alice sees bob online", || alice.session.get_online_users() == vec!["bob".to_string()]).await;

    alice.session.update_status(true, "in a meeting").unwrap();
    wait_until("bob sees alice's status", || {
        bob.session
            .get_user_status("alice")
            .map_or(false, |s| s.is_online && s.status_message == "in a meeting")
    })
    .await;
    assert_eq!(bob.session.get_online_users(), vec!["alice".to_string()]);

    bob.session.disconnect().await.unwrap();
    wait_until("alice sees bob offline", || alice.session.get_online_users().is_empty()).await;
    assert!(!alice.session.get_user_status("bob").unwrap().is_online);

    // The cache still moves while offline, but nothing can be published
    let err = bob.session.update_status(true, "back soon").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert_eq!(bob.session.get_user_status("bob").unwrap().status_message, "back soon");

    alice.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_encrypted_message_roundtrip() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = connected_peer(&backend, "alice").await;
    let bob = connected_peer(&backend, "bob").await;
    let mut bob_events = bob.session.subscribe();

    let bob_key = bob.session.crypto().get_public_key().unwrap();
    alice
        .session
        .send_encrypted_message(Message::text("bob", "meet at noon"), &bob_key)
        .await
        .unwrap();

    let event = expect_event(&mut bob_events, "encrypted message", |e| {
        matches!(e, SessionEvent::MessageReceived(m) if m.kind() == MessageType::Encrypted)
    })
    .await;
    let message = match event {
        SessionEvent::MessageReceived(message) => message,
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(message.content(), "");
    assert!(!message.data().unwrap().windows(4).any(|w| w == b"noon"));
    assert_eq!(bob.session.decrypt_message(&message).unwrap(), "meet at noon");

    // Alice holds a different key and cannot read it
    let err = alice.session.decrypt_message(&message).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EncryptionError);

    alice.session.disconnect().await.unwrap();
    bob.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frames_are_counted_and_skipped() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = connected_peer(&backend, "alice").await;
    let bob = connected_peer(&backend, "bob").await;
    let mut bob_events = bob.session.subscribe();

    backend.inject("bob", "{not json");
    backend.inject("bob", r#"{"type":99,"id":"x","senderId":"a","receiverId":"bob","content":"","timestamp":0}"#);
    expect_event(&mut bob_events, "malformed report", |e| matches!(e, SessionEvent::Malformed { .. })).await;
    wait_until("both frames counted", || bob.session.malformed_count() == 2).await;

    // The channel is still usable afterwards
    alice.session.send_message(Message::text("bob", "still here")).await.unwrap();
    expect_event(&mut bob_events, "message after garbage", |e| {
        matches!(e, SessionEvent::MessageReceived(m) if m.content() == "still here")
    })
    .await;
    assert!(bob.session.is_connected());

    alice.session.disconnect().await.unwrap();
    bob.session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_file_offer_is_announced() {
    setup_logging();
    let backend = MockBackend::start().await;
    let alice = connected_peer(&backend, "alice").await;
    let bob = connected_peer(&backend, "bob").await;
    let mut bob_events = bob.session.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("report.pdf");
    common::write_test_file(&file, 4096);

    let err = alice.session.initiate_file_transfer("bob", &file).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    alice
        .peer
        .transfers
        .set_permissions(&file, "bob", &parley::PermissionRecord::read_only())
        .unwrap();
    let transfer_id = alice.session.initiate_file_transfer("bob", &file).await.unwrap();

    let event = expect_event(&mut bob_events, "transfer offer", |e| {
        matches!(e, SessionEvent::MessageReceived(m) if m.kind() == MessageType::FileTransfer)
    })
    .await;
    let offer = match event {
        SessionEvent::MessageReceived(message) => TransferOffer::from_message(&message).unwrap(),
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(offer.transfer_id, transfer_id);
    assert_eq!(offer.file_name, "report.pdf");
    assert_eq!(offer.total_size, 4096);
    assert_eq!(offer.sender_id, "alice");

    let info = alice.peer.transfers.get_transfer(&transfer_id).await.unwrap();
    assert_eq!(info.status, parley::TransferStatus::Pending);

    // Offline attempts are refused before anything is registered
    alice.session.disconnect().await.unwrap();
    let err = alice.session.initiate_file_transfer("bob", &file).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(alice.peer.transfers.active_transfers().await.len(), 1);

    bob.session.disconnect().await.unwrap();
}

//! Integration tests for real-time presence and cursor synchronization.
//!
//! These tests start a real server and connect several clients, verifying
//! cursor broadcast, profile changes and departure through the full network
//! stack.

use scribble_collab::auth::AllowAnonymous;
use scribble_collab::awareness::{AwarenessEntry, AwarenessEvent, CursorColor, UserProfile};
use scribble_collab::client::{ClientEvent, CollabClient};
use scribble_collab::element::Vec2;
use scribble_collab::protocol::ClientId;
use scribble_collab::server::{ServerConfig, SyncServer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Start a server on an ephemeral port, return its URL.
async fn start_test_server() -> String {
    let server = SyncServer::new(ServerConfig::for_testing(), Arc::new(AllowAnonymous)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    url
}

/// Connect a client to the test server, draining the initial Connected event.
async fn connect_client(url: &str, name: &str) -> (CollabClient, mpsc::Receiver<ClientEvent>, ClientId) {
    let user = UserProfile::new(name, CursorColor::rgba(0.9, 0.2, 0.2, 1.0));
    let mut client = CollabClient::new(url, "ROOM01", name, user);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let client_id = match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Connected { client_id })) => client_id,
        other => panic!("Expected Connected event, got {other:?}"),
    };
    (client, events, client_id)
}

/// Wait for a presence update about `about` that satisfies `pred`.
async fn wait_for_update(
    events: &mut mpsc::Receiver<ClientEvent>,
    about: ClientId,
    pred: impl Fn(&AwarenessEntry) -> bool,
) -> AwarenessEntry {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(ClientEvent::Awareness(AwarenessEvent::Updated(entry))))
                if entry.client_id == about && pred(&entry) =>
            {
                return entry
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("no matching presence update for {about}"),
        }
    }
}

#[tokio::test]
async fn test_cursor_broadcast_between_clients() {
    let url = start_test_server().await;
    let (alice, _ea, alice_id) = connect_client(&url, "alice").await;
    let (_bob, mut bob_events, _) = connect_client(&url, "bob").await;

    alice.set_cursor(Some(Vec2::new(100.0, 200.0))).await.unwrap();

    let entry = wait_for_update(&mut bob_events, alice_id, |e| e.cursor.is_some()).await;
    assert_eq!(entry.cursor, Some(Vec2::new(100.0, 200.0)));
    assert_eq!(entry.user.display_name, "alice");
}

#[tokio::test]
async fn test_joiner_is_announced_to_present_peers() {
    let url = start_test_server().await;
    let (_alice, mut alice_events, _) = connect_client(&url, "alice").await;
    let (_bob, _eb, bob_id) = connect_client(&url, "bob").await;

    let entry = wait_for_update(&mut alice_events, bob_id, |_| true).await;
    assert_eq!(entry.user.display_name, "bob");
    assert_eq!(entry.user_id.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_presence_removed_on_disconnect() {
    let url = start_test_server().await;
    let (alice, mut alice_events, _) = connect_client(&url, "alice").await;
    let (mut bob, _eb, bob_id) = connect_client(&url, "bob").await;
    wait_for_update(&mut alice_events, bob_id, |_| true).await;
    assert!(alice.awareness_snapshot().await.contains_key(&bob_id));

    bob.close().await;

    let removed = timeout(Duration::from_secs(3), async {
        loop {
            match alice_events.recv().await {
                Some(ClientEvent::Awareness(AwarenessEvent::Removed { client_id })) => return client_id,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no removal within 3s");
    assert_eq!(removed, bob_id);
    assert!(!alice.awareness_snapshot().await.contains_key(&bob_id));
}

#[tokio::test]
async fn test_profile_update_reaches_peers() {
    let url = start_test_server().await;
    let (mut alice, _ea, alice_id) = connect_client(&url, "alice").await;
    let (_bob, mut bob_events, _) = connect_client(&url, "bob").await;

    let renamed = UserProfile::new("Alice L.", CursorColor::rgba(0.1, 0.8, 0.3, 1.0));
    alice.set_user(renamed.clone()).await.unwrap();

    let entry = wait_for_update(&mut bob_events, alice_id, |e| e.user.display_name == "Alice L.").await;
    assert_eq!(entry.user, renamed);
    assert_eq!(alice.user(), &renamed);
}

#[tokio::test]
async fn test_throttled_cursor_delivers_final_position() {
    let url = start_test_server().await;
    let (alice, _ea, alice_id) = connect_client(&url, "alice").await;
    let (bob, mut bob_events, _) = connect_client(&url, "bob").await;

    // A burst much faster than the throttle interval.
    for i in 0..50 {
        alice.set_cursor(Some(Vec2::new(i as f32, i as f32))).await.unwrap();
    }

    let last = Vec2::new(49.0, 49.0);
    wait_for_update(&mut bob_events, alice_id, |e| e.cursor == Some(last)).await;
    let seen = bob.awareness_snapshot().await.remove(&alice_id).unwrap();
    assert_eq!(seen.cursor, Some(last));
}

#[tokio::test]
async fn test_cursor_leaving_canvas() {
    let url = start_test_server().await;
    let (alice, _ea, alice_id) = connect_client(&url, "alice").await;
    let (bob, mut bob_events, _) = connect_client(&url, "bob").await;

    alice.set_cursor(Some(Vec2::new(5.0, 5.0))).await.unwrap();
    wait_for_update(&mut bob_events, alice_id, |e| e.cursor.is_some()).await;

    // Give the throttle window time to pass so the next move goes out directly.
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.set_cursor(None).await.unwrap();
    let entry = wait_for_update(&mut bob_events, alice_id, |e| e.cursor.is_none()).await;
    assert_eq!(entry.user.display_name, "alice");
    assert!(bob.awareness_snapshot().await[&alice_id].cursor.is_none());
}

#[tokio::test]
async fn test_snapshot_includes_self_and_peers() {
    let url = start_test_server().await;
    let (alice, _ea, alice_id) = connect_client(&url, "alice").await;
    let (bob, _eb, bob_id) = connect_client(&url, "bob").await;

    // Bob learned about Alice from his welcome.
    let snapshot = bob.awareness_snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[&alice_id].user.display_name, "alice");
    assert_eq!(snapshot[&bob_id].user.display_name, "bob");

    for _ in 0..300 {
        if alice.awareness_snapshot().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(alice.awareness_snapshot().await.contains_key(&bob_id));
}

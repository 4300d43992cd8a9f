//! End-to-end tests: real server, real sessions, real WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;
use tandem::protocol::{FrameKind, Identity, SyncFrame};
use tandem::replica::{BlockView, Edit, StateVector};
use tandem::server::{ServerConfig, SyncServer};
use tandem::session::{open_session, SessionEvent, SessionHandle};
use tandem::storage::MemoryStore;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

/// Start a server on a free port, return its URL and store handle.
async fn start_test_server() -> (String, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let server = Arc::new(SyncServer::new(ServerConfig::default(), store.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run_on(listener).await;
    });
    (format!("ws://{addr}"), store)
}

async fn open(url: &str, doc_id: Uuid, name: &str) -> SessionHandle {
    open_as(url, doc_id, Uuid::new_v4(), name).await
}

async fn open_as(url: &str, doc_id: Uuid, user_id: Uuid, name: &str) -> SessionHandle {
    let identity = Identity::new(user_id, name);
    timeout(Duration::from_secs(5), open_session(url, doc_id, identity))
        .await
        .expect("open_session timed out")
        .expect("open_session failed")
}

/// Wait for a ContentChanged event that satisfies `pred`.
async fn wait_for_content(
    events: &mut tokio::sync::mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&[BlockView]) -> bool,
) -> Vec<BlockView> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for content");
        match timeout(remaining, events.recv()).await {
            Ok(Some(SessionEvent::ContentChanged(blocks))) if pred(&blocks) => return blocks,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event stream closed"),
            Err(_) => panic!("timed out waiting for content"),
        }
    }
}

#[tokio::test]
async fn test_session_opens_against_live_server() {
    let (url, _store) = start_test_server().await;
    let session = open(&url, Uuid::new_v4(), "Alice").await;
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_edit_propagates_between_sessions() {
    let (url, _store) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = open(&url, doc_id, "Alice").await;
    let mut bob = open(&url, doc_id, "Bob").await;
    let mut bob_events = bob.take_events().unwrap();

    alice
        .edit(Edit::InsertAfter {
            after: None,
            text: "hello from alice".into(),
        })
        .await
        .unwrap();

    let blocks = wait_for_content(&mut bob_events, |blocks| {
        blocks.iter().any(|b| b.text == "hello from alice")
    })
    .await;
    assert_eq!(blocks.len(), 1);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_late_joiner_catches_up_via_handshake() {
    let (url, _store) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = open(&url, doc_id, "Alice").await;
    for i in 0..3 {
        alice
            .edit(Edit::InsertAfter {
                after: None,
                text: format!("line-{i}"),
            })
            .await
            .unwrap();
    }
    // Let the deltas reach the server's actor.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut bob = open(&url, doc_id, "Bob").await;
    let mut bob_events = bob.take_events().unwrap();

    let blocks = wait_for_content(&mut bob_events, |blocks| blocks.len() == 3).await;
    let texts: Vec<&str> = blocks.iter().map(|b| b.text.as_str()).collect();
    assert!(texts.contains(&"line-0"));
    assert!(texts.contains(&"line-2"));

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_edits_converge_on_both_sessions() {
    let (url, _store) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let mut alice = open(&url, doc_id, "Alice").await;
    let mut bob = open(&url, doc_id, "Bob").await;
    let mut alice_events = alice.take_events().unwrap();
    let mut bob_events = bob.take_events().unwrap();

    alice
        .edit(Edit::InsertAfter {
            after: None,
            text: "from-alice".into(),
        })
        .await
        .unwrap();
    bob.edit(Edit::InsertAfter {
        after: None,
        text: "from-bob".into(),
    })
    .await
    .unwrap();

    let alice_view = wait_for_content(&mut alice_events, |blocks| blocks.len() == 2).await;
    let bob_view = wait_for_content(&mut bob_events, |blocks| blocks.len() == 2).await;

    // Identical order on both sides, whatever the tie-break chose.
    let a: Vec<&str> = alice_view.iter().map(|b| b.text.as_str()).collect();
    let b: Vec<&str> = bob_view.iter().map(|b| b.text.as_str()).collect();
    assert_eq!(a, b);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_same_user_second_connection_receives_edits_live() {
    let (url, _store) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    // One user, two connections (say, laptop and phone).
    let laptop = open_as(&url, doc_id, user_id, "Alice").await;
    let mut phone = open_as(&url, doc_id, user_id, "Alice").await;
    let mut phone_events = phone.take_events().unwrap();

    laptop
        .edit(Edit::InsertAfter {
            after: None,
            text: "typed on the laptop".into(),
        })
        .await
        .unwrap();

    // The edit must arrive without waiting for a reconnect handshake.
    let blocks = wait_for_content(&mut phone_events, |blocks| {
        blocks.iter().any(|b| b.text == "typed on the laptop")
    })
    .await;
    assert_eq!(blocks.len(), 1);

    laptop.close().await.unwrap();
    phone.close().await.unwrap();
}

#[tokio::test]
async fn test_frame_before_hello_is_rejected() {
    let (url, _store) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // Handshake without a preceding Hello.
    let frame = SyncFrame::handshake(Uuid::new_v4(), Uuid::new_v4(), &StateVector::new()).unwrap();
    ws.send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("no reply")
        .expect("stream ended")
        .expect("ws error");
    match reply {
        Message::Binary(data) => {
            let frame = SyncFrame::decode(&data).unwrap();
            assert_eq!(frame.kind, FrameKind::Reject);
            assert!(frame.reject_reason().unwrap().contains("hello"));
        }
        other => panic!("expected binary reject, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_does_not_kill_connection() {
    let (url, _store) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let identity = Identity::new(Uuid::new_v4(), "Garbler");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let hello = SyncFrame::hello(doc_id, &identity, &StateVector::new()).unwrap();
    ws.send(Message::Binary(hello.encode().unwrap().into()))
        .await
        .unwrap();

    // Garbage; the server must drop it and keep serving.
    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into()))
        .await
        .unwrap();

    // Connection still answers pings.
    let ping = SyncFrame::ping(doc_id, identity.user_id);
    ws.send(Message::Binary(ping.encode().unwrap().into()))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("no pong before deadline");
        let msg = timeout(remaining, ws.next())
            .await
            .expect("no pong")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Binary(data) = msg {
            if let Ok(frame) = SyncFrame::decode(&data) {
                if frame.kind == FrameKind::Pong {
                    break;
                }
            }
        }
    }
}

#[tokio::test]
async fn test_duplicate_delta_delivery_is_noop() {
    let (url, _store) = start_test_server().await;
    let doc_id = Uuid::new_v4();
    let identity = Identity::new(Uuid::new_v4(), "Repeater");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let hello = SyncFrame::hello(doc_id, &identity, &StateVector::new()).unwrap();
    ws.send(Message::Binary(hello.encode().unwrap().into()))
        .await
        .unwrap();

    // One insert, sent three times.
    let mut replica = tandem::replica::DocumentReplica::new(doc_id);
    let delta = replica.apply_local(Edit::InsertAfter {
        after: None,
        text: "only once".into(),
    });
    let frame = SyncFrame::delta(doc_id, identity.user_id, 1, &delta).unwrap();
    let bytes = frame.encode().unwrap();
    for _ in 0..3 {
        ws.send(Message::Binary(bytes.clone().into())).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A fresh session sees exactly one block.
    let mut observer = open(&url, doc_id, "Observer").await;
    let mut events = observer.take_events().unwrap();
    let blocks = wait_for_content(&mut events, |blocks| !blocks.is_empty()).await;
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].text, "only once");

    observer.close().await.unwrap();
}

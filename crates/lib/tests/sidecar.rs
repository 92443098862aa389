//! Integration test: WhatsAppChannel against a fake sidecar WebSocket server.

mod common;

use common::{eventually, FakeSidecar, Forward};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use talkbridge::channels::{Channel, PushChannel, WhatsAppChannel, WhatsAppSettings};
use talkbridge::BridgeError;
use tokio::sync::mpsc;

fn channel(url: String, ready_timeout: Duration) -> WhatsAppChannel {
    WhatsAppChannel::new(WhatsAppSettings {
        sidecar_url: url,
        ready_timeout,
    })
}

#[tokio::test]
async fn connect_waits_for_ready_then_relays_events_and_commands() {
    let sidecar = FakeSidecar::with_script(vec![
        json!({ "type": "qr", "qr": "2@abc" }),
        json!({ "type": "authenticated" }),
        json!({ "type": "contact", "id": "4915@c.us", "pushName": "Bo" }),
        json!({ "type": "ready" }),
    ]);
    let url = sidecar.start().await;
    let wa = channel(url, Duration::from_secs(5));
    let (tx, mut rx) = mpsc::unbounded_channel();
    wa.on_message(Arc::new(Forward(tx))).await;

    wa.connect().await.unwrap();
    assert!(wa.is_ready());

    sidecar.emit(json!({
        "type": "message", "id": "m1", "chatId": "123@g.us", "senderId": "4915@c.us",
        "body": "mine", "timestamp": 10, "fromMe": true
    }));
    sidecar.emit(json!({
        "type": "message", "id": "m2", "chatId": "123@g.us", "senderId": "4915@c.us",
        "body": "hello", "timestamp": 11, "fromMe": false
    }));
    let m = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m.body, "hello");
    assert_eq!(m.source_channel_id, "123@g.us");
    assert_eq!(
        wa.resolve_sender_display_name(&m).await.unwrap().as_deref(),
        Some("Bo")
    );

    wa.send("123@g.us", "[Nextcloud] *Ana*: hi").await.unwrap();
    assert!(eventually(|| !sidecar.received.lock().unwrap().is_empty()).await);
    let cmd = sidecar.received.lock().unwrap()[0].clone();
    assert_eq!(cmd["type"], "send");
    assert_eq!(cmd["chatId"], "123@g.us");
    assert_eq!(cmd["body"], "[Nextcloud] *Ana*: hi");
    assert!(cmd["requestId"].as_str().is_some());

    wa.disconnect().await.unwrap();
    assert!(!wa.is_ready());
    assert!(matches!(
        wa.send("123@g.us", "late").await,
        Err(BridgeError::Send(_))
    ));
}

#[tokio::test]
async fn auth_failure_aborts_connect() {
    let sidecar = FakeSidecar::with_script(vec![
        json!({ "type": "authFailure", "message": "session expired" }),
    ]);
    let url = sidecar.start().await;
    let wa = channel(url, Duration::from_secs(5));
    let err = wa.connect().await.unwrap_err();
    assert!(matches!(err, BridgeError::Connection(ref m) if m.contains("session expired")));
    assert!(!wa.is_ready());
}

#[tokio::test]
async fn connect_times_out_without_ready() {
    let sidecar = FakeSidecar::with_script(vec![json!({ "type": "qr", "qr": "2@abc" })]);
    let url = sidecar.start().await;
    let wa = channel(url, Duration::from_millis(200));
    let err = wa.connect().await.unwrap_err();
    assert!(matches!(err, BridgeError::Connection(_)));
}

#[tokio::test]
async fn disconnected_event_makes_sends_fail() {
    let sidecar = FakeSidecar::with_script(vec![json!({ "type": "ready" })]);
    let url = sidecar.start().await;
    let wa = channel(url, Duration::from_secs(5));
    wa.connect().await.unwrap();

    sidecar.emit(json!({ "type": "disconnected", "reason": "LOGOUT" }));
    assert!(eventually(|| !wa.is_ready()).await);
    assert!(matches!(wa.send("1@c.us", "x").await, Err(BridgeError::Send(_))));
}

#[tokio::test]
async fn reconnect_after_disconnected_event_delivers_each_message_once() {
    let sidecar = FakeSidecar::with_script(vec![json!({ "type": "ready" })]);
    let url = sidecar.start().await;
    let wa = channel(url, Duration::from_secs(5));
    let (tx, mut rx) = mpsc::unbounded_channel();
    wa.on_message(Arc::new(Forward(tx))).await;
    wa.connect().await.unwrap();

    // The sidecar reports a lost session but keeps the socket open.
    sidecar.emit(json!({ "type": "disconnected", "reason": "CONFLICT" }));
    assert!(eventually(|| !wa.is_ready()).await);
    wa.connect().await.unwrap();
    assert_eq!(*sidecar.sessions.lock().unwrap(), 2);

    sidecar.emit(json!({
        "type": "message", "id": "m9", "chatId": "123@g.us", "senderId": "4915@c.us",
        "body": "once", "timestamp": 9, "fromMe": false
    }));
    let m = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m.body, "once");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    wa.disconnect().await.unwrap();
}

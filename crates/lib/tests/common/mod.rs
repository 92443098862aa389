//! Fake Nextcloud Talk and WhatsApp sidecar servers on free local ports.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use talkbridge::channels::ChannelMessage;
use talkbridge::channels::MessageHandler;
use talkbridge::BridgeError;
use tokio::sync::mpsc;

pub const TALK_USER: &str = "bridge";
pub const TALK_PASSWORD: &str = "secret";
pub const TALK_TOKEN: &str = "abc123";
/// base64("bridge:secret")
const EXPECTED_AUTH: &str = "Basic YnJpZGdlOnNlY3JldA==";

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// In-memory Talk conversation.
#[derive(Clone, Default)]
pub struct FakeTalk {
    pub messages: Arc<Mutex<Vec<serde_json::Value>>>,
    pub posted: Arc<Mutex<Vec<String>>>,
    pub queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    pub fail_posts: Arc<Mutex<bool>>,
    pub not_modified: Arc<Mutex<bool>>,
}

impl FakeTalk {
    pub fn push(&self, id: i64, actor: &str, display: &str, text: &str, system: &str) {
        self.messages.lock().unwrap().push(serde_json::json!({
            "id": id,
            "token": TALK_TOKEN,
            "actorType": "users",
            "actorId": actor,
            "actorDisplayName": display,
            "timestamp": 1_700_000_000 + id,
            "message": text,
            "systemMessage": system,
            "messageType": if system.is_empty() { "comment" } else { "system" },
        }));
    }

    /// Start serving; returns the base URL to configure as the Nextcloud URL.
    pub async fn start(&self) -> String {
        let app = Router::new()
            .route(
                "/ocs/v2.php/apps/spreed/api/v1/chat/:token",
                get(talk_get).post(talk_post),
            )
            .with_state(self.clone());
        format!("http://{}", serve(app).await)
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
    let ocs = headers.get("ocs-apirequest").and_then(|v| v.to_str().ok());
    auth == Some(EXPECTED_AUTH) && ocs == Some("true")
}

async fn talk_get(
    State(talk): State<FakeTalk>,
    Path(token): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if token != TALK_TOKEN {
        return StatusCode::NOT_FOUND.into_response();
    }
    talk.queries.lock().unwrap().push(query);
    if *talk.not_modified.lock().unwrap() {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    // Talk returns the newest messages first.
    let mut data = talk.messages.lock().unwrap().clone();
    data.reverse();
    Json(serde_json::json!({ "ocs": { "meta": { "status": "ok" }, "data": data } }))
        .into_response()
}

async fn talk_post(
    State(talk): State<FakeTalk>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    if *talk.fail_posts.lock().unwrap() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let text = body
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    talk.posted.lock().unwrap().push(text);
    StatusCode::CREATED
}

/// Sidecar that replays `script` frames on connect and records every command it receives.
#[derive(Clone, Default)]
pub struct FakeSidecar {
    pub script: Arc<Mutex<Vec<serde_json::Value>>>,
    pub received: Arc<Mutex<Vec<serde_json::Value>>>,
    /// One sender per session ever opened; `emit` writes to every session still alive.
    pub outbox: Arc<Mutex<Vec<mpsc::UnboundedSender<serde_json::Value>>>>,
    /// Number of sessions accepted so far.
    pub sessions: Arc<Mutex<usize>>,
}

impl FakeSidecar {
    pub fn with_script(frames: Vec<serde_json::Value>) -> Self {
        let s = Self::default();
        *s.script.lock().unwrap() = frames;
        s
    }

    /// Start serving; returns the ws:// URL to configure as the sidecar URL.
    pub async fn start(&self) -> String {
        let app = Router::new()
            .route("/ws", get(sidecar_ws))
            .with_state(self.clone());
        format!("ws://{}/ws", serve(app).await)
    }

    /// Push a frame to every open session.
    pub fn emit(&self, frame: serde_json::Value) {
        for tx in self.outbox.lock().unwrap().iter() {
            let _ = tx.send(frame.clone());
        }
    }
}

async fn sidecar_ws(ws: WebSocketUpgrade, State(sidecar): State<FakeSidecar>) -> Response {
    ws.on_upgrade(move |socket| sidecar_session(socket, sidecar))
}

async fn sidecar_session(mut socket: WebSocket, sidecar: FakeSidecar) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    sidecar.outbox.lock().unwrap().push(tx);
    *sidecar.sessions.lock().unwrap() += 1;
    let script = sidecar.script.lock().unwrap().clone();
    for frame in script {
        if socket.send(Message::Text(frame.to_string())).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(v) = serde_json::from_str(&text) {
                        sidecar.received.lock().unwrap().push(v);
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if socket.send(Message::Text(frame.to_string())).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}

/// Handler forwarding every message to a channel the test can await.
pub struct Forward(pub mpsc::UnboundedSender<ChannelMessage>);

#[async_trait::async_trait]
impl MessageHandler for Forward {
    async fn handle(&self, message: ChannelMessage) -> Result<(), BridgeError> {
        let _ = self.0.send(message);
        Ok(())
    }
}

/// Poll `check` every 20 ms for up to 5 s.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

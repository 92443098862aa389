//! WhatsApp channel: JSON frames over a WebSocket to the sidecar that owns the WhatsApp Web session.
//!
//! The sidecar pushes `qr`, `ready`, `message`, ... events; we send `send` commands back.

use crate::channels::inbound::ChannelMessage;
use crate::channels::registry::{Channel, HandlerRegistry, MessageHandler, PushChannel};
use crate::error::BridgeError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const DEFAULT_SIDECAR_URL: &str = "ws://127.0.0.1:3100/ws";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type ContactMap = Arc<StdRwLock<HashMap<String, SidecarContact>>>;

/// Event frame from the sidecar.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SidecarEvent {
    Qr { qr: String },
    Authenticated,
    Ready,
    AuthFailure { message: String },
    Disconnected { reason: String },
    Message(SidecarMessage),
    Contact(SidecarContact),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarMessage {
    pub id: String,
    pub chat_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarContact {
    pub id: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl SidecarContact {
    fn display_name(&self) -> Option<String> {
        self.push_name
            .iter()
            .chain(self.name.iter())
            .find(|n| !n.trim().is_empty())
            .cloned()
    }
}

/// Command frame to the sidecar.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum SidecarCommand<'a> {
    Send {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "chatId")]
        chat_id: &'a str,
        body: &'a str,
    },
}

/// Turn a sidecar message into a channel message. Our own outgoing messages are dropped.
pub fn normalize(m: SidecarMessage) -> Option<ChannelMessage> {
    if m.from_me {
        return None;
    }
    let sender_id = if m.sender_id.is_empty() {
        m.chat_id.clone()
    } else {
        m.sender_id
    };
    Some(ChannelMessage {
        source_channel_id: m.chat_id,
        sender_id,
        sender_display_name: m.push_name.filter(|n| !n.trim().is_empty()),
        body: m.body,
        sequence: m.timestamp,
        is_system_event: false,
    })
}

#[derive(Debug, Clone)]
pub struct WhatsAppSettings {
    pub sidecar_url: String,
    pub ready_timeout: Duration,
}

impl Default for WhatsAppSettings {
    fn default() -> Self {
        Self {
            sidecar_url: DEFAULT_SIDECAR_URL.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// WhatsApp connector: sidecar WebSocket client with a handler list and a contact cache.
pub struct WhatsAppChannel {
    id: String,
    settings: WhatsAppSettings,
    handlers: HandlerRegistry,
    ready: Arc<AtomicBool>,
    contacts: ContactMap,
    writer: Mutex<Option<WsSink>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl WhatsAppChannel {
    pub fn new(settings: WhatsAppSettings) -> Self {
        Self {
            id: "whatsapp".to_string(),
            settings,
            handlers: HandlerRegistry::new(),
            ready: Arc::new(AtomicBool::new(false)),
            contacts: Arc::new(StdRwLock::new(HashMap::new())),
            writer: Mutex::new(None),
            reader: StdMutex::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn teardown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(handle) = self.take_reader() {
            handle.abort();
        }
    }
}

struct ReaderState {
    id: String,
    handlers: HandlerRegistry,
    ready: Arc<AtomicBool>,
    contacts: ContactMap,
    ready_tx: Option<oneshot::Sender<Result<(), String>>>,
}

impl ReaderState {
    fn handle_event(&mut self, event: SidecarEvent) {
        match event {
            SidecarEvent::Qr { qr } => {
                log::info!(
                    "{}: scan this QR code with WhatsApp to authenticate: {}",
                    self.id,
                    qr
                );
            }
            SidecarEvent::Authenticated => {
                log::info!("{}: authenticated", self.id);
            }
            SidecarEvent::Ready => {
                self.ready.store(true, Ordering::SeqCst);
                log::info!("{}: client is ready", self.id);
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            SidecarEvent::AuthFailure { message } => {
                log::error!("{}: authentication failed: {}", self.id, message);
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Err(format!("authentication failed: {}", message)));
                }
            }
            SidecarEvent::Disconnected { reason } => {
                log::warn!("{}: client disconnected: {}", self.id, reason);
                self.ready.store(false, Ordering::SeqCst);
            }
            SidecarEvent::Contact(contact) => {
                self.contacts
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(contact.id.clone(), contact);
            }
            SidecarEvent::Message(m) => {
                let Some(message) = normalize(m) else {
                    return;
                };
                let handlers = self.handlers.clone();
                let id = self.id.clone();
                tokio::spawn(async move {
                    handlers.dispatch(&id, &message).await;
                });
            }
        }
    }
}

async fn run_reader(mut stream: SplitStream<WsStream>, mut state: ReaderState) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SidecarEvent>(&text) {
                Ok(event) => state.handle_event(event),
                Err(e) => log::debug!("{}: ignoring sidecar frame: {}", state.id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("{}: sidecar connection error: {}", state.id, e);
                break;
            }
        }
    }
    state.ready.store(false, Ordering::SeqCst);
    log::info!("{}: sidecar connection closed", state.id);
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.register(handler).await;
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), BridgeError> {
        if !self.is_ready() {
            return Err(BridgeError::Send("whatsapp client is not ready".to_string()));
        }
        let frame = serde_json::to_string(&SidecarCommand::Send {
            request_id: uuid::Uuid::new_v4().to_string(),
            chat_id: conversation_id,
            body: text,
        })
        .map_err(|e| BridgeError::Send(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| BridgeError::Send("whatsapp sidecar not connected".to_string()))?;
        sink.send(Message::Text(frame))
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))?;
        log::debug!("{}: message sent to {}", self.id, conversation_id);
        Ok(())
    }
}

#[async_trait]
impl PushChannel for WhatsAppChannel {
    async fn connect(&self) -> Result<(), BridgeError> {
        if self.is_ready() {
            return Ok(());
        }
        // A socket left open by a `disconnected` event still has a live reader.
        self.teardown().await;
        log::info!("{}: connecting to sidecar at {}", self.id, self.settings.sidecar_url);
        let (ws, _) = tokio_tungstenite::connect_async(self.settings.sidecar_url.as_str())
            .await
            .map_err(|e| BridgeError::Connection(format!("whatsapp sidecar: {}", e)))?;
        let (sink, stream) = ws.split();
        let (ready_tx, ready_rx) = oneshot::channel();
        let state = ReaderState {
            id: self.id.clone(),
            handlers: self.handlers.clone(),
            ready: self.ready.clone(),
            contacts: self.contacts.clone(),
            ready_tx: Some(ready_tx),
        };
        *self.writer.lock().await = Some(sink);
        let handle = tokio::spawn(run_reader(stream, state));
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        let outcome = match tokio::time::timeout(self.settings.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(BridgeError::Connection(reason)),
            Ok(Err(_)) => Err(BridgeError::Connection(
                "sidecar closed the connection before ready".to_string(),
            )),
            Err(_) => Err(BridgeError::Connection(format!(
                "sidecar not ready after {:?}",
                self.settings.ready_timeout
            ))),
        };
        if outcome.is_err() {
            self.teardown().await;
        }
        outcome
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        log::info!("{}: disconnecting", self.id);
        self.teardown().await;
        Ok(())
    }

    async fn resolve_sender_display_name(
        &self,
        message: &ChannelMessage,
    ) -> Result<Option<String>, BridgeError> {
        if let Some(name) = message
            .sender_display_name
            .as_ref()
            .filter(|n| !n.trim().is_empty())
        {
            return Ok(Some(name.clone()));
        }
        let contacts = self.contacts.read().unwrap_or_else(|e| e.into_inner());
        Ok(contacts
            .get(&message.sender_id)
            .and_then(SidecarContact::display_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar_message(from_me: bool) -> SidecarMessage {
        SidecarMessage {
            id: "ABC".into(),
            chat_id: "123@g.us".into(),
            sender_id: "4915@c.us".into(),
            push_name: Some("Ana".into()),
            body: "hello".into(),
            timestamp: 1_700_000_000,
            from_me,
        }
    }

    #[test]
    fn parses_event_frames() {
        let e: SidecarEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(e, SidecarEvent::Ready));
        let e: SidecarEvent =
            serde_json::from_str(r#"{"type":"authFailure","message":"bad session"}"#).unwrap();
        assert!(matches!(e, SidecarEvent::AuthFailure { message } if message == "bad session"));
        let e: SidecarEvent = serde_json::from_str(
            r#"{"type":"message","id":"X","chatId":"1@c.us","senderId":"1@c.us","body":"hi","timestamp":5,"fromMe":false}"#,
        )
        .unwrap();
        match e {
            SidecarEvent::Message(m) => {
                assert_eq!(m.chat_id, "1@c.us");
                assert_eq!(m.push_name, None);
                assert_eq!(m.timestamp, 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn send_command_shape() {
        let frame = serde_json::to_value(SidecarCommand::Send {
            request_id: "r1".into(),
            chat_id: "1@c.us",
            body: "[Nextcloud] *Ana*: hello",
        })
        .unwrap();
        assert_eq!(
            frame,
            serde_json::json!({
                "type": "send",
                "requestId": "r1",
                "chatId": "1@c.us",
                "body": "[Nextcloud] *Ana*: hello"
            })
        );
    }

    #[test]
    fn normalize_drops_own_messages() {
        assert!(normalize(sidecar_message(true)).is_none());
        let m = normalize(sidecar_message(false)).unwrap();
        assert_eq!(m.source_channel_id, "123@g.us");
        assert_eq!(m.sender_id, "4915@c.us");
        assert_eq!(m.sender_display_name.as_deref(), Some("Ana"));
        assert_eq!(m.sequence, 1_700_000_000);
    }

    #[test]
    fn normalize_uses_chat_id_when_sender_missing() {
        let mut raw = sidecar_message(false);
        raw.sender_id.clear();
        raw.push_name = Some(" ".into());
        let m = normalize(raw).unwrap();
        assert_eq!(m.sender_id, "123@g.us");
        assert_eq!(m.sender_display_name, None);
    }

    #[tokio::test]
    async fn resolves_names_from_event_then_contacts() {
        let channel = WhatsAppChannel::new(WhatsAppSettings::default());
        let with_name = ChannelMessage::new("c", "4915@c.us", "hi", 1).with_display_name("Ana");
        assert_eq!(
            channel.resolve_sender_display_name(&with_name).await.unwrap(),
            Some("Ana".to_string())
        );

        let bare = ChannelMessage::new("c", "4915@c.us", "hi", 1);
        assert_eq!(channel.resolve_sender_display_name(&bare).await.unwrap(), None);

        channel.contacts.write().unwrap().insert(
            "4915@c.us".into(),
            SidecarContact {
                id: "4915@c.us".into(),
                push_name: None,
                name: Some("Ana Lopez".into()),
            },
        );
        assert_eq!(
            channel.resolve_sender_display_name(&bare).await.unwrap(),
            Some("Ana Lopez".to_string())
        );
    }

    #[tokio::test]
    async fn send_before_ready_fails() {
        let channel = WhatsAppChannel::new(WhatsAppSettings::default());
        let err = channel.send("1@c.us", "hi").await.unwrap_err();
        assert!(matches!(err, BridgeError::Send(_)));
    }

    #[tokio::test]
    async fn connect_to_missing_sidecar_is_connection_error() {
        let channel = WhatsAppChannel::new(WhatsAppSettings {
            sidecar_url: "ws://127.0.0.1:9/ws".into(),
            ready_timeout: Duration::from_secs(1),
        });
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert!(!channel.is_ready());
    }
}

//! Channel capability and the ordered handler list each channel fans inbound messages out to.

use crate::channels::inbound::ChannelMessage;
use crate::error::BridgeError;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Receives messages from a channel. Errors are isolated to the one message that produced them.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ChannelMessage) -> Result<(), BridgeError>;
}

/// Common capability of both sides of the bridge: register inbound handlers, send text.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel id (e.g. "whatsapp", "nextcloud").
    fn id(&self) -> &str;
    /// Append a handler; handlers run in registration order.
    async fn on_message(&self, handler: Arc<dyn MessageHandler>);
    /// Send a text message to a conversation (WhatsApp chat id, Talk token).
    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), BridgeError>;
}

/// A channel whose backend pushes events to us over a long-lived connection.
#[async_trait]
pub trait PushChannel: Channel {
    /// Open the connection and wait until the backend reports it is ready to send.
    async fn connect(&self) -> Result<(), BridgeError>;
    async fn disconnect(&self) -> Result<(), BridgeError>;
    /// Best-effort friendly name for the sender of `message`.
    async fn resolve_sender_display_name(
        &self,
        message: &ChannelMessage,
    ) -> Result<Option<String>, BridgeError>;
}

/// Counts from one fan-out of a message over the registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Ordered list of handlers. Shared between the channel and its dispatch tasks.
#[derive(Clone)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn register(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.write().await.push(handler);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Deliver `message` to every handler in order. A failing or panicking handler is logged
    /// and does not stop delivery to the handlers after it.
    pub async fn dispatch(&self, channel_id: &str, message: &ChannelMessage) -> DispatchReport {
        let handlers: Vec<Arc<dyn MessageHandler>> = self.inner.read().await.clone();
        let mut report = DispatchReport::default();
        for handler in handlers {
            let fut = handler.handle(message.clone());
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    log::error!(
                        "{}: handler failed for message {}: {}",
                        channel_id,
                        message.sequence,
                        e
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    log::error!(
                        "{}: handler panicked for message {}",
                        channel_id,
                        message.sequence
                    );
                }
            }
        }
        report
    }
}

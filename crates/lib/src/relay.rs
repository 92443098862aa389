//! Relay routes between the WhatsApp chat and the Talk conversation.
//!
//! Push-origin (WhatsApp) messages go to Talk as `{prefix} **{name}**: {body}`; pull-origin
//! (Talk) messages go to WhatsApp as `{prefix} *{name}*: {body}`. Each route makes at most
//! one send attempt.

use crate::channels::{Channel, ChannelMessage, MessageHandler, PushChannel};
use crate::error::BridgeError;
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFAULT_PUSH_ORIGIN_PREFIX: &str = "[WhatsApp]";
pub const DEFAULT_PULL_ORIGIN_PREFIX: &str = "[Nextcloud]";

/// Routing settings, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// The one WhatsApp chat this bridge serves.
    pub push_chat_id: String,
    /// The Talk conversation token messages are posted to.
    pub pull_conversation_token: String,
    /// Tag on messages that came from WhatsApp.
    pub push_origin_prefix: String,
    /// Tag on messages that came from Talk.
    pub pull_origin_prefix: String,
}

impl RelayConfig {
    pub fn new(push_chat_id: impl Into<String>, pull_conversation_token: impl Into<String>) -> Self {
        Self {
            push_chat_id: push_chat_id.into(),
            pull_conversation_token: pull_conversation_token.into(),
            push_origin_prefix: DEFAULT_PUSH_ORIGIN_PREFIX.to_string(),
            pull_origin_prefix: DEFAULT_PULL_ORIGIN_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Push message from a chat other than the configured one.
    OtherChat,
    EmptyBody,
    SystemEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent; carries the outbound body.
    Relayed(String),
    Skipped(SkipReason),
}

pub fn format_push_origin(prefix: &str, sender: &str, body: &str) -> String {
    format!("{} **{}**: {}", prefix, sender, body)
}

pub fn format_pull_origin(prefix: &str, sender: &str, body: &str) -> String {
    format!("{} *{}*: {}", prefix, sender, body)
}

pub struct RelayEngine {
    config: Arc<RelayConfig>,
    push: Arc<dyn PushChannel>,
    pull: Arc<dyn Channel>,
}

impl RelayEngine {
    pub fn new(config: Arc<RelayConfig>, push: Arc<dyn PushChannel>, pull: Arc<dyn Channel>) -> Self {
        Self { config, push, pull }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// WhatsApp → Talk.
    pub async fn route_from_push(
        &self,
        message: &ChannelMessage,
    ) -> Result<RouteOutcome, BridgeError> {
        if message.source_channel_id != self.config.push_chat_id {
            return Ok(RouteOutcome::Skipped(SkipReason::OtherChat));
        }
        if message.is_blank() {
            return Ok(RouteOutcome::Skipped(SkipReason::EmptyBody));
        }
        let sender = match self.push.resolve_sender_display_name(message).await {
            Ok(Some(name)) if !name.trim().is_empty() => name,
            Ok(_) => message.sender_id.clone(),
            Err(e) => {
                log::debug!("relay: could not resolve sender name, using id: {}", e);
                message.sender_id.clone()
            }
        };
        log::info!("whatsapp -> nextcloud: {}: {}", sender, message.body);
        let body = format_push_origin(&self.config.push_origin_prefix, &sender, &message.body);
        if let Err(e) = self
            .pull
            .send(&self.config.pull_conversation_token, &body)
            .await
        {
            log::error!("relay: sending to nextcloud failed: {}", e);
            return Err(e);
        }
        Ok(RouteOutcome::Relayed(body))
    }

    /// Talk → WhatsApp.
    pub async fn route_from_pull(
        &self,
        message: &ChannelMessage,
    ) -> Result<RouteOutcome, BridgeError> {
        if message.is_system_event {
            return Ok(RouteOutcome::Skipped(SkipReason::SystemEvent));
        }
        if message.is_blank() {
            return Ok(RouteOutcome::Skipped(SkipReason::EmptyBody));
        }
        let sender = message.sender_label();
        log::info!("nextcloud -> whatsapp: {}: {}", sender, message.body);
        let body = format_pull_origin(&self.config.pull_origin_prefix, sender, &message.body);
        if let Err(e) = self.push.send(&self.config.push_chat_id, &body).await {
            log::error!("relay: sending to whatsapp failed: {}", e);
            return Err(e);
        }
        Ok(RouteOutcome::Relayed(body))
    }

    /// Handler to register on the push channel.
    pub fn push_route(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        Arc::new(PushRoute(Arc::clone(self)))
    }

    /// Handler to register on the pull channel.
    pub fn pull_route(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        Arc::new(PullRoute(Arc::clone(self)))
    }
}

/// Send failures are already logged by the route; only other errors reach the channel.
fn settle(result: Result<RouteOutcome, BridgeError>) -> Result<(), BridgeError> {
    match result {
        Ok(_) | Err(BridgeError::Send(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

struct PushRoute(Arc<RelayEngine>);

#[async_trait]
impl MessageHandler for PushRoute {
    async fn handle(&self, message: ChannelMessage) -> Result<(), BridgeError> {
        settle(self.0.route_from_push(&message).await)
    }
}

struct PullRoute(Arc<RelayEngine>);

#[async_trait]
impl MessageHandler for PullRoute {
    async fn handle(&self, message: ChannelMessage) -> Result<(), BridgeError> {
        settle(self.0.route_from_pull(&message).await)
    }
}

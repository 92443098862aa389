//! Inbound message from a channel, normalized from the backend payload before it reaches the relay.

/// A message observed on one channel. Built once by the channel adapter and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Chat or conversation the message belongs to (WhatsApp chat id, Talk token).
    pub source_channel_id: String,
    pub sender_id: String,
    pub sender_display_name: Option<String>,
    pub body: String,
    /// Per-channel ordering key; not comparable across channels.
    pub sequence: i64,
    pub is_system_event: bool,
}

impl ChannelMessage {
    pub fn new(
        source_channel_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
        sequence: i64,
    ) -> Self {
        Self {
            source_channel_id: source_channel_id.into(),
            sender_id: sender_id.into(),
            sender_display_name: None,
            body: body.into(),
            sequence,
            is_system_event: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.sender_display_name = Some(name.into());
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system_event = true;
        self
    }

    /// True when the body is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.body.trim().is_empty()
    }

    /// Display name when present and non-empty, otherwise the raw sender id.
    pub fn sender_label(&self) -> &str {
        self.sender_display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.sender_id)
    }
}

//! Error taxonomy shared by channels, the poller, the relay engine and the lifecycle controller.

use crate::lifecycle::BridgeLifecycleState;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A backend could not be reached or refused us during initialization. Fatal to startup.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Timeout/abort-class failure of a long-poll request; expected, never reported.
    #[error("poll interrupted: {0}")]
    TransientPoll(String),
    /// A message handler failed while processing one message.
    #[error("handler failed: {0}")]
    Handler(String),
    /// Outbound delivery on either channel failed.
    #[error("send failed: {0}")]
    Send(String),
    #[error("invalid lifecycle transition: {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BridgeLifecycleState,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::TransientPoll(_))
    }
}

/// Classify a reqwest failure from a poll request: timeouts and dropped connections are transient.
pub(crate) fn classify_poll_error(err: reqwest::Error) -> BridgeError {
    let text = err.to_string();
    if err.is_timeout() || looks_interrupted(&text) {
        BridgeError::TransientPoll(text)
    } else {
        BridgeError::Connection(text)
    }
}

fn looks_interrupted(text: &str) -> bool {
    let t = text.to_ascii_lowercase();
    t.contains("timeout") || t.contains("timed out") || t.contains("aborted")
}

//! talkbridge core library: relays messages between a WhatsApp chat (via sidecar)
//! and a Nextcloud Talk conversation.

pub mod bridge;
pub mod channels;
pub mod config;
pub mod error;
pub mod init;
pub mod lifecycle;
pub mod relay;

pub use error::BridgeError;

//! Communication channels: the WhatsApp sidecar (push) and Nextcloud Talk (pull).
//!
//! Both sides implement [`Channel`]; inbound messages are normalized to [`ChannelMessage`]
//! and fanned out to the registered [`MessageHandler`]s in registration order.

mod inbound;
mod nextcloud;
mod poller;
mod registry;
mod whatsapp;

pub use inbound::ChannelMessage;
pub use nextcloud::{TalkClient, TalkMessage, TalkSettings};
pub use poller::{
    FetchWindow, PollCursor, PollOutcome, PullBackend, PullChannelPoller, PullMessage,
    DEFAULT_LONG_POLL_TIMEOUT, DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL,
};
pub use registry::{Channel, DispatchReport, HandlerRegistry, MessageHandler, PushChannel};
pub use whatsapp::{
    normalize, SidecarContact, SidecarEvent, SidecarMessage, WhatsAppChannel, WhatsAppSettings,
    DEFAULT_READY_TIMEOUT, DEFAULT_SIDECAR_URL,
};

#[cfg(test)]
pub(crate) use poller::tests::{msg as pull_msg, ScriptedBackend};

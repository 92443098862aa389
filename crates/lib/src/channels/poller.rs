//! Pull channel: turns a fetch-only backend into a stream of in-order, de-duplicated messages.
//!
//! A cursor holds the highest message id already seen. Each cycle fetches the backend's
//! current window, advances the cursor over everything returned, drops our own echoes and
//! hands the rest to the registered handlers in ascending id order. Cycles never overlap:
//! the cursor lock is held for the whole cycle, and the loop sleeps only after the fan-out
//! has finished.

use crate::channels::inbound::ChannelMessage;
use crate::channels::registry::{Channel, HandlerRegistry, MessageHandler};
use crate::error::BridgeError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Windowing parameters for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    pub limit: u32,
    /// How long the server may hold the request open waiting for new data.
    pub timeout: Duration,
    pub look_into_future: bool,
    /// Always false for the bridge: unread state belongs to the human users.
    pub set_read_marker: bool,
}

impl Default for FetchWindow {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            timeout: DEFAULT_LONG_POLL_TIMEOUT,
            look_into_future: false,
            set_read_marker: false,
        }
    }
}

/// A message as the pull backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullMessage {
    pub id: i64,
    pub author_id: String,
    pub author_display_name: Option<String>,
    pub body: String,
    pub is_system_event: bool,
}

/// Fetch-only backend bound to one conversation.
#[async_trait]
pub trait PullBackend: Send + Sync {
    fn conversation_token(&self) -> &str;
    /// The account the bridge posts as; messages authored by it are our own echoes.
    fn self_identity(&self) -> &str;
    /// Current message window, in any order.
    async fn fetch_recent_messages(
        &self,
        window: &FetchWindow,
    ) -> Result<Vec<PullMessage>, BridgeError>;
    async fn post_message(&self, body: &str) -> Result<(), BridgeError>;
}

/// Highest message id already processed. Never moves backwards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollCursor {
    last_seen_sequence: i64,
}

impl PollCursor {
    pub fn new(last_seen_sequence: i64) -> Self {
        Self { last_seen_sequence }
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen_sequence
    }

    pub fn is_new(&self, sequence: i64) -> bool {
        sequence > self.last_seen_sequence
    }

    /// Move to `sequence` if it is ahead of the cursor.
    pub fn advance(&mut self, sequence: i64) {
        if sequence > self.last_seen_sequence {
            self.last_seen_sequence = sequence;
        }
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Messages in the fetch response.
    pub fetched: usize,
    /// Messages handed to the handlers.
    pub delivered: usize,
    /// Cursor after the cycle.
    pub cursor: i64,
}

/// One run of the poll loop and its own stop signal.
struct PollTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

pub struct PullChannelPoller {
    id: String,
    backend: Arc<dyn PullBackend>,
    window: FetchWindow,
    cursor: Mutex<PollCursor>,
    handlers: HandlerRegistry,
    running: AtomicBool,
    task: StdMutex<Option<PollTask>>,
}

impl PullChannelPoller {
    pub fn new(backend: Arc<dyn PullBackend>) -> Self {
        Self::with_window(backend, FetchWindow::default())
    }

    pub fn with_window(backend: Arc<dyn PullBackend>, window: FetchWindow) -> Self {
        Self {
            id: "nextcloud".to_string(),
            backend,
            window,
            cursor: Mutex::new(PollCursor::default()),
            handlers: HandlerRegistry::new(),
            running: AtomicBool::new(false),
            task: StdMutex::new(None),
        }
    }

    pub async fn cursor(&self) -> i64 {
        self.cursor.lock().await.last_seen()
    }

    pub fn is_polling(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Position the cursor at the newest message currently in the conversation so the
    /// backlog is never replayed. Leaves the cursor untouched when the window is empty.
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        log::info!("{}: initializing poller", self.id);
        let window = FetchWindow {
            timeout: Duration::ZERO,
            ..self.window.clone()
        };
        let messages = self
            .backend
            .fetch_recent_messages(&window)
            .await
            .map_err(|e| match e {
                BridgeError::Connection(m) => BridgeError::Connection(m),
                other => BridgeError::Connection(other.to_string()),
            })?;
        let mut cursor = self.cursor.lock().await;
        if let Some(max) = messages.iter().map(|m| m.id).max() {
            cursor.advance(max);
        }
        log::info!(
            "{}: connected, starting from message id {}",
            self.id,
            cursor.last_seen()
        );
        Ok(())
    }

    /// Run one cycle. Errors are absorbed here: transient ones silently, others with an error log.
    pub async fn poll(&self) -> PollOutcome {
        match self.try_poll().await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_transient() {
                    log::error!("{}: polling messages failed: {}", self.id, e);
                }
                PollOutcome {
                    cursor: self.cursor().await,
                    ..PollOutcome::default()
                }
            }
        }
    }

    async fn try_poll(&self) -> Result<PollOutcome, BridgeError> {
        let mut cursor = self.cursor.lock().await;
        let messages = self.backend.fetch_recent_messages(&self.window).await?;
        let fetched = messages.len();
        let start = *cursor;

        let mut fresh: Vec<PullMessage> = messages
            .iter()
            .filter(|m| start.is_new(m.id))
            .cloned()
            .collect();
        if let Some(max) = messages.iter().map(|m| m.id).max() {
            cursor.advance(max);
        }
        fresh.sort_by_key(|m| m.id);

        let me = self.backend.self_identity();
        let mut delivered = 0;
        for m in fresh {
            if m.author_id == me {
                log::debug!("{}: skipping own message {}", self.id, m.id);
                continue;
            }
            let message = self.to_channel_message(m);
            self.handlers.dispatch(&self.id, &message).await;
            delivered += 1;
        }

        Ok(PollOutcome {
            fetched,
            delivered,
            cursor: cursor.last_seen(),
        })
    }

    fn to_channel_message(&self, m: PullMessage) -> ChannelMessage {
        ChannelMessage {
            source_channel_id: self.backend.conversation_token().to_string(),
            sender_id: m.author_id,
            sender_display_name: m.author_display_name,
            body: m.body,
            sequence: m.id,
            is_system_event: m.is_system_event,
        }
    }

    /// Spawn the poll loop: a cycle now, then one `interval` after each cycle finishes.
    /// Returns false (and does nothing) when the loop is already running.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("{}: polling already running", self.id);
            return false;
        }
        log::info!("{}: starting message polling every {:?}", self.id, interval);
        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(run_poll_loop(Arc::clone(self), interval, stopped));
        *task = Some(PollTask { handle, stop });
        true
    }

    /// Stop scheduling cycles. A cycle already in flight runs to completion; await the
    /// returned handle to wait for it. Later calls return `None`.
    pub fn stop_polling(&self) -> Option<JoinHandle<()>> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if !self.running.swap(false, Ordering::SeqCst) {
            return None;
        }
        log::info!("{}: stopping message polling", self.id);
        let PollTask { handle, stop } = task.take()?;
        let _ = stop.send(true);
        Some(handle)
    }
}

async fn run_poll_loop(
    poller: Arc<PullChannelPoller>,
    interval: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    while !*stopped.borrow() {
        let outcome = poller.poll().await;
        if outcome.delivered > 0 {
            log::debug!(
                "{}: delivered {} message(s), cursor at {}",
                poller.id,
                outcome.delivered,
                outcome.cursor
            );
        }
        if *stopped.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stopped.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    log::info!("{}: polling loop stopped", poller.id);
}

#[async_trait]
impl Channel for PullChannelPoller {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.register(handler).await;
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<(), BridgeError> {
        if conversation_id != self.backend.conversation_token() {
            return Err(BridgeError::Send(format!(
                "unknown conversation {}",
                conversation_id
            )));
        }
        self.backend.post_message(text).await
    }
}

//! Bridge lifecycle: wire the relay routes onto both channels once, run and stop the poll loop.

use crate::channels::{Channel, PullChannelPoller, PushChannel};
use crate::error::BridgeError;
use crate::relay::{RelayConfig, RelayEngine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// `Stopped → Starting → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeLifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub struct BridgeController {
    state: Mutex<BridgeLifecycleState>,
    engine: Arc<RelayEngine>,
    push: Arc<dyn PushChannel>,
    poller: Arc<PullChannelPoller>,
    poll_interval: Duration,
    routes_registered: AtomicBool,
}

impl BridgeController {
    pub fn new(
        config: Arc<RelayConfig>,
        push: Arc<dyn PushChannel>,
        poller: Arc<PullChannelPoller>,
        poll_interval: Duration,
    ) -> Self {
        let pull: Arc<dyn Channel> = poller.clone();
        let engine = Arc::new(RelayEngine::new(config, push.clone(), pull));
        Self {
            state: Mutex::new(BridgeLifecycleState::Stopped),
            engine,
            push,
            poller,
            poll_interval,
            routes_registered: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> BridgeLifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    fn set_state(&self, next: BridgeLifecycleState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Move `from → to` atomically, or report the state we were actually in.
    fn transition(
        &self,
        operation: &'static str,
        from: BridgeLifecycleState,
        to: BridgeLifecycleState,
    ) -> Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(BridgeError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    /// Register the relay routes (first start only) and start polling. Valid only when stopped.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.transition(
            "start",
            BridgeLifecycleState::Stopped,
            BridgeLifecycleState::Starting,
        )?;
        log::info!("bridge: starting message bridge");

        if !self.routes_registered.swap(true, Ordering::SeqCst) {
            self.push.on_message(self.engine.push_route()).await;
            self.poller.on_message(self.engine.pull_route()).await;
        }

        if !self.poller.start_polling(self.poll_interval) {
            self.set_state(BridgeLifecycleState::Stopped);
            return Err(BridgeError::InvalidState {
                operation: "start polling",
                state: BridgeLifecycleState::Starting,
            });
        }

        self.set_state(BridgeLifecycleState::Running);
        log::info!("bridge: message bridge is now active");
        Ok(())
    }

    /// Stop polling and wait for an in-flight cycle to finish. A no-op unless running.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        if let Err(e) = self.transition(
            "stop",
            BridgeLifecycleState::Running,
            BridgeLifecycleState::Stopping,
        ) {
            log::debug!("bridge: ignoring stop: {}", e);
            return Ok(());
        }
        log::info!("bridge: stopping message bridge");
        if let Some(handle) = self.poller.stop_polling() {
            if let Err(e) = handle.await {
                log::warn!("bridge: poll loop ended abnormally: {}", e);
            }
        }
        self.set_state(BridgeLifecycleState::Stopped);
        log::info!("bridge: message bridge stopped");
        Ok(())
    }
}

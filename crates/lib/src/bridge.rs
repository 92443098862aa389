//! Process-level orchestration: build the channels from config, connect both backends,
//! run the bridge until SIGINT/SIGTERM, then stop polling and disconnect.

use crate::channels::{PullChannelPoller, PushChannel, TalkClient, WhatsAppChannel};
use crate::config::Config;
use crate::lifecycle::BridgeController;
use anyhow::{Context, Result};
use std::sync::Arc;

fn build_poller(config: &Config) -> Result<Arc<PullChannelPoller>> {
    let talk = Arc::new(TalkClient::new(config.talk_settings()?));
    Ok(Arc::new(PullChannelPoller::with_window(
        talk,
        config.fetch_window(),
    )))
}

/// Run the bridge; blocks until shutdown (e.g. Ctrl+C).
/// Connection failures on either side abort startup before anything is relayed.
pub async fn run_bridge(config: Config) -> Result<()> {
    config.validate()?;
    let relay = Arc::new(config.relay_config()?);
    let poller = build_poller(&config)?;
    let whatsapp = Arc::new(WhatsAppChannel::new(config.whatsapp_settings()));

    whatsapp
        .connect()
        .await
        .context("connecting to the whatsapp sidecar")?;
    if let Err(e) = poller.initialize().await {
        let _ = whatsapp.disconnect().await;
        return Err(e).context("connecting to nextcloud talk");
    }

    let controller = BridgeController::new(
        relay,
        whatsapp.clone(),
        poller,
        config.poll_interval(),
    );
    if let Err(e) = controller.start().await {
        let _ = whatsapp.disconnect().await;
        return Err(e).context("starting the bridge");
    }
    log::info!("bridge: started, press Ctrl+C to stop");

    shutdown_signal().await;
    log::info!("bridge: shutting down");
    controller.stop().await?;
    whatsapp.disconnect().await?;
    Ok(())
}

/// Verify the Talk side: credentials, conversation token, and the message id polling would start from.
pub async fn check_nextcloud(config: &Config) -> Result<i64> {
    let poller = build_poller(config)?;
    poller
        .initialize()
        .await
        .context("connecting to nextcloud talk")?;
    Ok(poller.cursor().await)
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

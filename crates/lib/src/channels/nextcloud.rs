//! Nextcloud Talk backend: fetch the chat window and post messages via the OCS spreed API.

use crate::channels::poller::{FetchWindow, PullBackend, PullMessage};
use crate::error::{classify_poll_error, BridgeError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

const SPREED_API_PATH: &str = "/ocs/v2.php/apps/spreed/api/v1";
/// Extra client-side time on top of the server's long-poll wait before giving up on a request.
const REQUEST_GRACE: Duration = Duration::from_secs(10);

/// Client-side deadline for a request the server may hold open for `wait`.
fn request_timeout(wait: Duration) -> Duration {
    wait.saturating_add(REQUEST_GRACE)
}

#[derive(Debug, Deserialize)]
struct OcsEnvelope {
    ocs: OcsBody,
}

#[derive(Debug, Deserialize)]
struct OcsBody {
    #[serde(default)]
    data: Option<Vec<TalkMessage>>,
}

/// Chat message as returned by `GET /chat/{token}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkMessage {
    pub id: i64,
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub actor_display_name: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Empty for regular messages; the system event name otherwise (e.g. "user_added").
    #[serde(default)]
    pub system_message: String,
}

impl From<TalkMessage> for PullMessage {
    fn from(m: TalkMessage) -> Self {
        PullMessage {
            id: m.id,
            author_id: m.actor_id,
            author_display_name: m.actor_display_name.filter(|n| !n.is_empty()),
            body: m.message,
            is_system_event: !m.system_message.is_empty(),
        }
    }
}

/// Connection settings for one Talk conversation.
#[derive(Debug, Clone)]
pub struct TalkSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub talk_token: String,
}

/// HTTP client bound to a single Talk conversation and user.
pub struct TalkClient {
    settings: TalkSettings,
    base_url: String,
    client: reqwest::Client,
}

impl TalkClient {
    pub fn new(settings: TalkSettings) -> Self {
        let base_url = format!(
            "{}{}",
            settings.url.trim_end_matches('/'),
            SPREED_API_PATH
        );
        Self {
            settings,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/{}", self.base_url, self.settings.talk_token)
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.chat_url())
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .header("OCS-APIRequest", "true")
            .header("Accept", "application/json")
    }
}

#[async_trait]
impl PullBackend for TalkClient {
    fn conversation_token(&self) -> &str {
        &self.settings.talk_token
    }

    fn self_identity(&self) -> &str {
        &self.settings.username
    }

    async fn fetch_recent_messages(
        &self,
        window: &FetchWindow,
    ) -> Result<Vec<PullMessage>, BridgeError> {
        let res = self
            .request(reqwest::Method::GET)
            .query(&[
                ("lookIntoFuture", u8::from(window.look_into_future).to_string()),
                ("limit", window.limit.to_string()),
                ("timeout", window.timeout.as_secs().to_string()),
                ("setReadMarker", u8::from(window.set_read_marker).to_string()),
            ])
            .timeout(request_timeout(window.timeout))
            .send()
            .await
            .map_err(classify_poll_error)?;
        let status = res.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(BridgeError::Connection(format!(
                "fetching chat failed: {} {}",
                status, body
            )));
        }
        let envelope: OcsEnvelope = res.json().await.map_err(classify_poll_error)?;
        Ok(envelope
            .ocs
            .data
            .unwrap_or_default()
            .into_iter()
            .map(PullMessage::from)
            .collect())
    }

    async fn post_message(&self, body: &str) -> Result<(), BridgeError> {
        let res = self
            .request(reqwest::Method::POST)
            .json(&serde_json::json!({ "message": body }))
            .send()
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BridgeError::Send(format!(
                "posting to nextcloud failed: {} {}",
                status, body
            )));
        }
        log::debug!("nextcloud: message sent");
        Ok(())
    }
}

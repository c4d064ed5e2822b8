//! Outbound alert delivery.

use crate::core::{FeedError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{Level, event};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_alert(&self, text: &str) -> Result<()>;
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

struct WebhookTarget {
    url: String,
    chat_id: String,
}

/// Bot-API style webhook (`POST {base}/bot{token}/sendMessage`).
///
/// Without a token and a chat id the notifier is disabled: alerts are logged
/// and dropped.
pub struct WebhookNotifier {
    target: Option<WebhookTarget>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        Self::with_api_base(DEFAULT_API_BASE, token, chat_id)
    }

    pub fn with_api_base(
        api_base: &str,
        token: Option<String>,
        chat_id: Option<String>,
    ) -> Self {
        let target = match (token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some(WebhookTarget {
                    url: format!(
                        "{}/bot{}/sendMessage",
                        api_base.trim_end_matches('/'),
                        token
                    ),
                    chat_id,
                })
            }
            _ => {
                event!(
                    Level::WARN,
                    "webhook token or chat id not configured; notifications disabled"
                );
                None
            }
        };
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { target, client }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn send_alert(&self, text: &str) -> Result<()> {
        let Some(target) = &self.target else {
            event!(Level::WARN, "alert dropped; notifier is disabled");
            return Ok(());
        };

        let payload = WebhookPayload {
            chat_id: &target.chat_id,
            text,
            parse_mode: "Markdown",
        };
        let response = self
            .client
            .post(&target.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FeedError::Notification(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Notification(format!(
                "webhook returned {status}: {body}"
            )));
        }
        event!(Level::INFO, chat_id = %target.chat_id, "alert delivered");
        Ok(())
    }
}

/// Writes alerts to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send_alert(&self, text: &str) -> Result<()> {
        event!(Level::WARN, alert = %text, "alert");
        Ok(())
    }
}

/// Keeps every alert in memory. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Makes every later send fail after recording the attempt.
    pub fn fail_sends(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send_alert(&self, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        if *self.fail.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(FeedError::Notification("recording sink set to fail".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::routing::post;
    use serde_json::Value as JsonValue;
    use std::sync::Arc;

    type Inbox = Arc<Mutex<Vec<JsonValue>>>;

    async fn spawn_bot_api(inbox: Inbox) -> String {
        let app = Router::new()
            .route(
                "/botsecret/sendMessage",
                post(
                    |State(inbox): State<Inbox>, Json(body): Json<JsonValue>| async move {
                        inbox.lock().unwrap().push(body);
                        Json(serde_json::json!({ "ok": true }))
                    },
                ),
            )
            .with_state(inbox);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_webhook_posts_markdown_payload() {
        let inbox: Inbox = Arc::default();
        let base = spawn_bot_api(inbox.clone()).await;
        let notifier =
            WebhookNotifier::with_api_base(&base, Some("secret".into()), Some("-100".into()));

        notifier.send_alert("*Stall Alert*").await.unwrap();

        let received = inbox.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["chat_id"], "-100");
        assert_eq!(received[0]["text"], "*Stall Alert*");
        assert_eq!(received[0]["parse_mode"], "Markdown");
    }

    #[tokio::test]
    async fn test_rejected_webhook_is_an_error() {
        let inbox: Inbox = Arc::default();
        let base = spawn_bot_api(inbox).await;
        let notifier =
            WebhookNotifier::with_api_base(&base, Some("wrong".into()), Some("-100".into()));

        let err = notifier.send_alert("hi").await.unwrap_err();
        assert!(matches!(err, FeedError::Notification(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_webhook_is_disabled() {
        let notifier = WebhookNotifier::new(None, Some("-100".into()));
        assert!(!notifier.is_enabled());
        assert!(notifier.send_alert("dropped").await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingNotifier::new();
        sink.send_alert("one").await.unwrap();
        sink.fail_sends(true);
        assert!(sink.send_alert("two").await.is_err());
        assert_eq!(sink.sent(), vec!["one".to_string(), "two".to_string()]);
    }
}

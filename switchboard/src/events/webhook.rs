//! JSON webhook delivery.

use super::{Notification, NotificationKind, Notifier};
use crate::errors::{Result, SwitchboardError};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct WebhookBody<'a> {
    event: NotificationKind,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// Posts each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Creates a notifier posting to `url` with a 10 second timeout.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SwitchboardError::Internal(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// The target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, kind: NotificationKind, notification: Notification) -> Result<()> {
        let body = WebhookBody {
            event: kind,
            notification: &notification,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SwitchboardError::Internal(format!("webhook request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SwitchboardError::Internal(format!(
                "webhook returned {status}"
            )));
        }
        debug!(url = %self.url, kind = %kind, "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunStatus;
    use serde_json::json;

    #[test]
    fn test_body_flattens_notification() {
        let notification = Notification::new("main", json!({"market": "TH"}), RunStatus::Complete);
        let body = WebhookBody {
            event: NotificationKind::Done,
            notification: &notification,
        };

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["event"], json!("done"));
        assert_eq!(value["pipeline_name"], json!("main"));
        assert_eq!(value["status"], json!("complete"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        assert_eq!(notifier.url(), "http://127.0.0.1:9/hook");

        let result = notifier
            .send(
                NotificationKind::Start,
                Notification::new("main", json!({}), RunStatus::Active),
            )
            .await;
        assert!(result.is_err());
    }
}

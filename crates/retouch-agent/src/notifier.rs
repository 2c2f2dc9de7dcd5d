//! Webhook notifier.
//!
//! Delivery is best effort: failures are logged and swallowed, and a
//! lost notification never affects the request's outcome.

use async_trait::async_trait;
use retouch_core::notify::Notifier;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct NotifyBody<'a> {
    user_ref: &'a str,
    message: &'a str,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, user_ref: &str, message: &str) -> bool {
        let body = NotifyBody { user_ref, message };
        let result = self
            .client
            .post(&self.url)
            .timeout(NOTIFY_TIMEOUT)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(user_ref, "notification delivered");
                true
            }
            Ok(response) => {
                warn!(
                    user_ref,
                    status = %response.status(),
                    "notification rejected by webhook"
                );
                false
            }
            Err(e) => {
                warn!(user_ref, error = %e, "notification delivery failed");
                false
            }
        }
    }
}

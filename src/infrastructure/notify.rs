use crate::config::NotifierEnv;
use crate::infrastructure::masking::mask_secrets;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Outbound notification bot (Telegram-style HTTP API).
///
/// Fire-and-forget with transport-level retry; a failed notification is
/// logged and dropped, never escalated into the calling job.
pub struct Notifier {
    client: ClientWithMiddleware,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(env: NotifierEnv) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            bot_token: env.bot_token,
            chat_id: env.chat_id,
        }
    }

    /// Send a message; text passes through the secret mask first.
    pub async fn send(&self, text: &str) {
        let masked = mask_secrets(text);
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": masked,
            "disable_web_page_preview": true,
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Notification delivered ({} chars)", masked.len());
            }
            Ok(response) => {
                warn!("Notification rejected: HTTP {}", response.status());
            }
            Err(e) => {
                warn!("Notification failed: {}", e);
            }
        }
    }

    /// Alert with a correlation id for post-hoc ledger lookup.
    pub async fn alert(&self, title: &str, detail: &str, correlation_id: &str) {
        let text = format!("🚨 {title}\n{detail}\ncorrelation: {correlation_id}");
        self.send(&text).await;
    }
}

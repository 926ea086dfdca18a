use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ProviderError;

/// Outbound mail seam. Bodies stay one-line text; formatting is the mail
/// provider's problem.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ProviderError>;
}

/// Delivery through an HTTP mail API: one JSON POST per message, bearer key.
pub struct HttpMailer {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(api_url: String, api_key: String, from: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url,
            api_key,
            from,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ProviderError> {
        let payload = serde_json::json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "text": body,
        });

        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Transport(format!(
                "mail API answered {}: {}",
                status, body
            )));
        }

        debug!("Mail accepted for {}", to);
        Ok(())
    }
}

/// Dev-mode delivery when no mail API is configured: logs the message,
/// link included, instead of sending it.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ProviderError> {
        info!("Mail (dev mode, not sent) to {} | {} | {}", to, subject, body);
        Ok(())
    }
}

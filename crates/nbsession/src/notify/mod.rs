//! Best-effort notification fan-out.
//!
//! Operators hear about everything through a single webhook channel; the
//! requesting user gets the access URL by templated email. Neither path ever
//! returns an error to the caller: failures degrade to log lines, and email
//! failures are re-reported on the ops channel.

mod client;
mod error;

pub use client::{SPARKPOST_API_URL, SparkPostClient, WebhookClient};
pub use error::{NotifyError, NotifyResult};

use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;

/// Default template for the access email.
pub const ACCESS_EMAIL_TEMPLATE: &str = "data-science-online-assessment-url";

/// Operations channel transport.
#[async_trait]
pub trait OpsChannel: Send + Sync {
    /// Deliver one plain-text message.
    async fn post(&self, text: &str) -> NotifyResult<()>;
}

/// Templated transactional email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_template(
        &self,
        recipients: &[String],
        template: &str,
        substitution_data: &serde_json::Value,
    ) -> NotifyResult<()>;
}

/// Notification front door used by the session controller.
#[derive(Clone)]
pub struct Notifier {
    channel: Option<Arc<dyn OpsChannel>>,
    mailer: Option<Arc<dyn Mailer>>,
    template: String,
    retries: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("channel", &self.channel.is_some())
            .field("mailer", &self.mailer.is_some())
            .field("template", &self.template)
            .field("retries", &self.retries)
            .finish()
    }
}

impl Notifier {
    pub fn new(channel: Option<Arc<dyn OpsChannel>>, mailer: Option<Arc<dyn Mailer>>) -> Self {
        Self {
            channel,
            mailer,
            template: ACCESS_EMAIL_TEMPLATE.to_string(),
            retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Notifier that only logs.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Set the email template id.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Set how many times a failed webhook post is retried.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the base delay between webhook retries; grows linearly per attempt.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Post `text` to the ops channel. Returns whether it was delivered.
    pub async fn notify(&self, text: &str) -> bool {
        let Some(channel) = &self.channel else {
            warn!("no ops channel configured, dropping notification: {}", text);
            return false;
        };

        let attempts = self.retries.saturating_add(1);
        for attempt in 1..=attempts {
            match channel.post(text).await {
                Ok(()) => return true,
                Err(e) if attempt < attempts => {
                    warn!("ops notification attempt {}/{} failed: {}", attempt, attempts, e);
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => {
                    error!("giving up on ops notification after {} attempts: {}", attempts, e);
                }
            }
        }
        false
    }

    /// Email the access URL to `user_id`, reporting failures on the ops channel.
    ///
    /// Returns whether the email was accepted.
    pub async fn send_access_email(&self, user_id: &str, url: &str) -> bool {
        let Some(mailer) = &self.mailer else {
            debug!("email disabled, not mailing {}", user_id);
            return false;
        };

        let recipients = [user_id.to_string()];
        let substitution = serde_json::json!({
            "name": user_id,
            "url": url,
        });

        match mailer
            .send_template(&recipients, &self.template, &substitution)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("access email to {} failed: {}", user_id, e);
                self.notify(&format!("Failed to email {}: {}", user_id, e))
                    .await;
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeChannel, FakeMailer};
    use super::*;
    use std::sync::atomic::Ordering;

    fn notifier(channel: &Arc<FakeChannel>, mailer: &Arc<FakeMailer>) -> Notifier {
        Notifier::new(Some(channel.clone()), Some(mailer.clone())).retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn notify_delivers_text() {
        let channel = Arc::new(FakeChannel::default());
        let mailer = Arc::new(FakeMailer::default());
        assert!(notifier(&channel, &mailer).notify("hello ops").await);
        assert_eq!(channel.messages(), vec!["hello ops".to_string()]);
    }

    #[tokio::test]
    async fn notify_retries_then_gives_up() {
        let channel = Arc::new(FakeChannel::failing(10));
        let mailer = Arc::new(FakeMailer::default());
        let delivered = notifier(&channel, &mailer).retries(2).notify("x").await;
        assert!(!delivered);
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn notify_recovers_on_retry() {
        let channel = Arc::new(FakeChannel::failing(1));
        let mailer = Arc::new(FakeMailer::default());
        assert!(notifier(&channel, &mailer).notify("x").await);
        assert_eq!(channel.messages(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn notify_without_channel_is_a_no_op() {
        assert!(!Notifier::disabled().notify("nobody hears this").await);
    }

    #[tokio::test]
    async fn access_email_uses_template_and_substitution() {
        let channel = Arc::new(FakeChannel::default());
        let mailer = Arc::new(FakeMailer::default());
        let sent = notifier(&channel, &mailer)
            .send_access_email("alice@example.com", "http://h:1/?token=t")
            .await;

        assert!(sent);
        assert_eq!(
            mailer.sent(),
            vec![(
                vec!["alice@example.com".to_string()],
                ACCESS_EMAIL_TEMPLATE.to_string(),
                serde_json::json!({"name": "alice@example.com", "url": "http://h:1/?token=t"}),
            )]
        );
        assert!(channel.messages().is_empty());
    }

    #[tokio::test]
    async fn failed_email_is_reported_on_ops_channel() {
        let channel = Arc::new(FakeChannel::default());
        let mailer = Arc::new(FakeMailer::failing());
        let sent = notifier(&channel, &mailer)
            .send_access_email("bob", "http://h:1/")
            .await;

        assert!(!sent);
        let messages = channel.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Failed to email bob:"));
        assert!(messages[0].contains("Invalid recipient"));
    }
}

//! HTTP clients for the ops webhook and the SparkPost transmissions API.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{NotifyError, NotifyResult};
use super::{Mailer, OpsChannel};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default SparkPost API base.
pub const SPARKPOST_API_URL: &str = "https://api.sparkpost.com/api/v1";

fn http_client() -> NotifyResult<Client> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
}

/// Incoming-webhook client posting `{"text": ...}` payloads.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: Client,
    url: String,
}

impl WebhookClient {
    /// Create a client for the given webhook URL.
    pub fn new(url: impl Into<String>) -> NotifyResult<Self> {
        Ok(Self {
            client: http_client()?,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl OpsChannel for WebhookClient {
    async fn post(&self, text: &str) -> NotifyResult<()> {
        // `.json()` sets `Content-Type: application/json`.
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookMessage { text })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(NotifyError::Rejected {
            service: "webhook",
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Serialize)]
struct Transmission<'a> {
    recipients: Vec<Recipient<'a>>,
    content: TemplateContent<'a>,
    substitution_data: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    address: Address<'a>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct TemplateContent<'a> {
    template_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransmissionResponse {
    results: TransmissionResults,
}

#[derive(Debug, Deserialize)]
struct TransmissionResults {
    #[serde(default)]
    id: String,
    total_accepted_recipients: u64,
}

#[derive(Debug, Deserialize)]
struct SparkPostErrors {
    errors: Vec<SparkPostErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct SparkPostErrorEntry {
    message: String,
    #[serde(default)]
    description: Option<String>,
}

/// SparkPost transmissions client.
#[derive(Debug, Clone)]
pub struct SparkPostClient {
    client: Client,
    api_url: String,
    api_key: String,
}

impl SparkPostClient {
    /// Create a client against `api_url` (e.g. [`SPARKPOST_API_URL`]).
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> NotifyResult<Self> {
        Ok(Self {
            client: http_client()?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn rejection(response: Response) -> NotifyError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<SparkPostErrors>(&body) {
            Ok(parsed) => parsed
                .errors
                .into_iter()
                .map(|e| match e.description {
                    Some(description) => format!("{} ({})", e.message, description),
                    None => e.message,
                })
                .collect::<Vec<_>>()
                .join("; "),
            Err(_) => body,
        };
        NotifyError::Rejected {
            service: "sparkpost",
            status,
            message,
        }
    }
}

#[async_trait]
impl Mailer for SparkPostClient {
    async fn send_template(
        &self,
        recipients: &[String],
        template: &str,
        substitution_data: &serde_json::Value,
    ) -> NotifyResult<()> {
        let url = format!("{}/transmissions", self.api_url);
        let body = Transmission {
            recipients: recipients
                .iter()
                .map(|email| Recipient {
                    address: Address { email },
                })
                .collect(),
            content: TemplateContent {
                template_id: template,
            },
            substitution_data,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::rejection(response).await);
        }

        let parsed: TransmissionResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::ParseError(e.to_string()))?;
        if parsed.results.total_accepted_recipients == 0 {
            return Err(NotifyError::Rejected {
                service: "sparkpost",
                status: status.as_u16(),
                message: format!("transmission {} accepted no recipients", parsed.results.id),
            });
        }
        log::debug!("sparkpost transmission {} accepted", parsed.results.id);
        Ok(())
    }
}

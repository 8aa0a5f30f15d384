//! HTTP request handlers.

use axum::{
    Form, Json,
    extract::State,
    http::{HeaderMap, header},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Slash command payload, as Slack posts it (form encoded).
#[derive(Debug, Deserialize)]
pub struct SlashCommand {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// Slash command reply, visible only to the caller.
#[derive(Debug, Serialize)]
pub struct SlashReply {
    pub response_type: &'static str,
    pub text: String,
}

impl SlashReply {
    fn ephemeral(text: String) -> Self {
        Self {
            response_type: "ephemeral",
            text,
        }
    }
}

/// Run an `interview` slash command.
pub async fn slack_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(command): Form<SlashCommand>,
) -> ApiResult<Json<SlashReply>> {
    if let Some(expected) = &state.slack.token {
        if command.token.as_deref() != Some(expected.as_str()) {
            return Err(ApiError::unauthorized("invalid slash command token"));
        }
    }
    if let Some(expected) = &state.slack.team_id {
        if command.team_id.as_deref() != Some(expected.as_str()) {
            return Err(ApiError::forbidden("command from unexpected team"));
        }
    }

    let hostname = match &state.public_hostname {
        Some(hostname) => hostname.clone(),
        None => headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(request_hostname)
            .filter(|hostname| !hostname.is_empty())
            .ok_or_else(|| ApiError::bad_request("missing Host header"))?
            .to_string(),
    };

    info!(
        user = command.user_name.as_deref().unwrap_or("unknown"),
        command = command.command.as_deref().unwrap_or("/interview"),
        text = %command.text,
        "Slash command"
    );

    let reply = state.dispatcher.dispatch(&command.text, &hostname).await;
    Ok(Json(SlashReply::ephemeral(reply)))
}

/// Hostname part of a `Host` header value.
pub fn request_hostname(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal, keep the brackets
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

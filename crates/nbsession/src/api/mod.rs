//! HTTP API module.
//!
//! Serves the Slack slash-command endpoint and a health check.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{HealthResponse, SlashCommand, SlashReply, request_hostname};
pub use routes::create_router;
pub use state::{AppState, SlackState};

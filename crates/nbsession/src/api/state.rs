//! Application state shared across handlers.

use crate::dispatch::Dispatcher;

/// Slash-command verification settings.
///
/// A `None` field is not checked.
#[derive(Clone, Debug, Default)]
pub struct SlackState {
    /// Verification token Slack sends with every command.
    pub token: Option<String>,
    /// Workspace the command must come from.
    pub team_id: Option<String>,
}

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub slack: SlackState,
    /// Hostname used in access URLs instead of the request's `Host` header.
    pub public_hostname: Option<String>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, slack: SlackState, public_hostname: Option<String>) -> Self {
        Self {
            dispatcher,
            slack,
            public_hostname,
        }
    }
}

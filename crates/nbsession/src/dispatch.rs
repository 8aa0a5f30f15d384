//! Chat command parsing and dispatch.
//!
//! Turns the text of an `interview` slash command into a session operation
//! and renders the outcome as a single reply string.

use std::fmt;
use std::sync::Arc;

use log::info;

use crate::session::{SessionService, StartJob, StartQueue};

/// Reply for unknown verbs.
pub const INVALID_ACTION: &str = "Invalid action.";

/// Reply for `start` without a user.
pub const START_USAGE: &str = "Usage: start <user>";

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Start(String),
    Stop(Option<String>),
    /// `start` with no user.
    MissingUser,
    Invalid,
}

impl Command {
    /// Parse whitespace-separated command text. Extra arguments are ignored.
    pub fn parse(text: &str) -> Self {
        let mut words = text.split_whitespace();
        match words.next() {
            Some("list") => Command::List,
            Some("start") => match words.next() {
                Some(user) => Command::Start(user.to_string()),
                None => Command::MissingUser,
            },
            Some("stop") => Command::Stop(words.next().map(str::to_string)),
            _ => Command::Invalid,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::List => write!(f, "list"),
            Command::Start(user) => write!(f, "start {}", user),
            Command::Stop(Some(user)) => write!(f, "stop {}", user),
            Command::Stop(None) => write!(f, "stop"),
            Command::MissingUser => write!(f, "start"),
            Command::Invalid => write!(f, "invalid"),
        }
    }
}

/// Routes commands to the session service and start queue.
#[derive(Clone)]
pub struct Dispatcher {
    service: SessionService,
    queue: Arc<StartQueue>,
}

impl Dispatcher {
    pub fn new(service: SessionService, queue: Arc<StartQueue>) -> Self {
        Self { service, queue }
    }

    /// Run one command and return the chat reply.
    ///
    /// `start` only queues the job; `list` and `stop` run inline.
    pub async fn dispatch(&self, text: &str, hostname: &str) -> String {
        let command = Command::parse(text);
        info!("Dispatching '{}'", command);

        match command {
            Command::List => self
                .service
                .list()
                .await
                .unwrap_or_else(|e| e.to_string()),
            Command::Start(user_id) => {
                let job = StartJob {
                    user_id: user_id.clone(),
                    hostname: hostname.to_string(),
                };
                match self.queue.submit(job) {
                    Ok(()) => format!("Starting {}'s interview.", user_id),
                    Err(e) => e.to_string(),
                }
            }
            Command::Stop(user_id) => self
                .service
                .stop(user_id.as_deref())
                .await
                .unwrap_or_else(|e| e.to_string()),
            Command::MissingUser => START_USAGE.to_string(),
            Command::Invalid => INVALID_ACTION.to_string(),
        }
    }
}

//! Session management module.
//!
//! Handles the lifecycle of notebook sandboxes: listing, idempotent start with
//! workspace provisioning and token discovery, and forced stop.

mod error;
mod queue;
mod service;
mod slug;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{SessionError, SessionResult};
pub use queue::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS, QueueError, StartJob, StartQueue};
pub use service::{
    DEFAULT_IMAGE, DEFAULT_MOUNT_PATH, NO_SESSIONS, NOTEBOOK_PORT, SessionService,
    SessionServiceConfig, access_url,
};
pub use slug::slugify;

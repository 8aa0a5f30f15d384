//! Notebook Sandbox Library
//!
//! Core components for running per-user notebook sandboxes on demand from
//! chat commands.

pub mod api;
pub mod container;
pub mod dispatch;
pub mod notify;
pub mod session;
pub mod token;
pub mod workspace;

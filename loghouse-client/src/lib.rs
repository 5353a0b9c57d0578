//! Leader-aware client for the loghouse record service.
//!
//! The client resolves a single endpoint into the full member set via
//! `GetServers`, then routes each call by kind: produce goes to the leader,
//! consume rotates across followers (falling back to the leader when it is
//! the only node). Stale routing self-heals: a not-leader rejection triggers
//! a re-resolve and one retry.

mod client;
mod error;
mod picker;

pub use client::Client;
pub use error::{ClientError, Result};
pub use picker::{Picker, ServerInfo};

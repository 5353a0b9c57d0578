//! The record RPC service.

mod log;

pub use log::{CommitLog, LogService, ServersFetcher};

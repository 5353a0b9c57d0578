//! Protocol buffer definitions for loghouse.
//!
//! Two services share one TCP port per node:
//!
//! - **Log**: the record API clients use (produce, consume, streaming
//!   variants, and the `GetServers` membership view the client resolver
//!   consumes).
//! - **Raft**: the consensus transport. Messages are opaque envelopes; the
//!   cluster crate serializes the engine's own request/response types into
//!   the `data` field.

/// Generated types for the `loghouse.v1` package.
pub mod v1 {
    tonic::include_proto!("loghouse.v1");
}

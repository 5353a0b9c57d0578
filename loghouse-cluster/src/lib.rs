//! Distributed replication for the loghouse commit log.
//!
//! This crate wires the storage engine from `loghouse-core` into a Raft
//! cluster and exposes the record RPC service:
//!
//! - [`raft::DistributedLog`] proposes appends through consensus and serves
//!   reads from the local log. The consensus engine stores its own log with
//!   the same segmented engine (initial offset 1) and its metadata in an
//!   embedded B-tree store.
//! - [`stream::StreamLayer`] multiplexes consensus and record traffic over a
//!   single TCP port per node, tagging outgoing consensus connections with a
//!   leading byte and routing untagged connections to the record service.
//! - [`membership::Membership`] gossips the live member set over UDP and
//!   drives voter joins/leaves on the leader.
//! - [`service::LogService`] is the record API: produce (leader-only),
//!   consume, tailing consume streams, and the `GetServers` view the client
//!   resolver uses.
//! - [`agent::Agent`] assembles all of the above for one node.

pub mod agent;
pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod membership;
pub mod network;
pub mod raft;
pub mod service;
pub mod stream;
pub mod tls;
pub mod types;

pub use agent::Agent;
pub use auth::{AclAuthorizer, Authorizer};
pub use command::{Command, CommandResponse};
pub use config::{NodeConfig, RaftTuning};
pub use error::{ClusterError, ClusterResult};
pub use raft::DistributedLog;
pub use service::{CommitLog, LogService, ServersFetcher};
pub use types::{NodeId, TypeConfig};

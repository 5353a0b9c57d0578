//! Consensus transport: gRPC client and server carrying opaque engine
//! messages over stream-layer connections.

mod client;
mod server;

pub use client::RaftNetworkClient;
pub use server::RaftRpcServer;

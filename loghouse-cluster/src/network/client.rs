//! Network client implementing the consensus engine's network traits.
//!
//! Connections to peers are dialed through the stream layer (tag byte plus
//! optional peer TLS) and cached per node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use loghouse_proto::v1::raft_service_client::RaftServiceClient;
use loghouse_proto::v1::RaftRequest;
use openraft::error::{InstallSnapshotError, NetworkError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use parking_lot::RwLock;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::{ClusterError, RPCError};
use crate::stream::StreamLayer;
use crate::types::{NodeId, TypeConfig};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory for connections to other cluster members.
#[derive(Clone)]
pub struct RaftNetworkClient {
    stream_layer: Arc<StreamLayer>,
    connections: Arc<RwLock<HashMap<NodeId, Channel>>>,
}

impl RaftNetworkClient {
    pub fn new(stream_layer: Arc<StreamLayer>) -> Self {
        Self {
            stream_layer,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get or create a channel to a node, dialing through the stream layer.
    async fn get_connection(&self, target: NodeId, addr: &str) -> Result<Channel, ClusterError> {
        {
            let connections = self.connections.read();
            if let Some(channel) = connections.get(&target) {
                return Ok(channel.clone());
            }
        }

        let layer = Arc::clone(&self.stream_layer);
        let dial_addr = addr.to_string();
        let channel = Endpoint::try_from(format!("http://{addr}"))
            .map_err(|e| ClusterError::Config(e.to_string()))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let layer = Arc::clone(&layer);
                let addr = dial_addr.clone();
                async move { layer.dial(&addr, DIAL_TIMEOUT).await }
            }))
            .await?;

        {
            let mut connections = self.connections.write();
            connections.insert(target, channel.clone());
        }

        Ok(channel)
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkClient {
    type Network = RaftConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        RaftConnection {
            target,
            addr: node.addr.clone(),
            client: self.clone(),
        }
    }
}

/// A connection to one specific peer.
pub struct RaftConnection {
    target: NodeId,
    addr: String,
    client: RaftNetworkClient,
}

impl RaftNetwork<TypeConfig> for RaftConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError> {
        let channel = self
            .client
            .get_connection(self.target, &self.addr)
            .await
            .map_err(|e| to_network_error(&e))?;
        let mut client = RaftServiceClient::new(channel);

        let data = serde_json::to_vec(&req).map_err(|e| to_network_error(&e))?;
        let response = client
            .append_entries(RaftRequest { data })
            .await
            .map_err(|e| to_unreachable_error(&e))?;
        serde_json::from_slice(&response.into_inner().data).map_err(|e| to_network_error(&e))
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError> {
        let channel = self
            .client
            .get_connection(self.target, &self.addr)
            .await
            .map_err(|e| to_network_error(&e))?;
        let mut client = RaftServiceClient::new(channel);

        let data = serde_json::to_vec(&req).map_err(|e| to_network_error(&e))?;
        let response = client
            .vote(RaftRequest { data })
            .await
            .map_err(|e| to_unreachable_error(&e))?;
        serde_json::from_slice(&response.into_inner().data).map_err(|e| to_network_error(&e))
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<InstallSnapshotError>> {
        let channel = self
            .client
            .get_connection(self.target, &self.addr)
            .await
            .map_err(|e| to_network_error_snapshot(&e))?;
        let mut client = RaftServiceClient::new(channel);

        let data = serde_json::to_vec(&req).map_err(|e| to_network_error_snapshot(&e))?;
        let response = client
            .install_snapshot(RaftRequest { data })
            .await
            .map_err(|e| to_unreachable_error_snapshot(&e))?;
        serde_json::from_slice(&response.into_inner().data)
            .map_err(|e| to_network_error_snapshot(&e))
    }
}

fn to_network_error(err: &(impl std::error::Error + 'static)) -> RPCError {
    openraft::error::RPCError::Network(NetworkError::new(err))
}

fn to_unreachable_error(err: &tonic::Status) -> RPCError {
    openraft::error::RPCError::Unreachable(Unreachable::new(err))
}

fn to_network_error_snapshot(
    err: &(impl std::error::Error + 'static),
) -> RPCError<InstallSnapshotError> {
    openraft::error::RPCError::Network(NetworkError::new(err))
}

fn to_unreachable_error_snapshot(err: &tonic::Status) -> RPCError<InstallSnapshotError> {
    openraft::error::RPCError::Unreachable(Unreachable::new(err))
}

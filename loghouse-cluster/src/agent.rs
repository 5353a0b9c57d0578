//! The agent: everything one node runs, wired together.
//!
//! One TCP listener carries both gRPC services through the stream layer;
//! gossip runs on its own UDP port. Startup order matters: storage and
//! consensus come up first, then the servers start draining the mux, and
//! discovery goes last so join traffic finds working endpoints.

use std::sync::Arc;

use loghouse_proto::v1::log_server::LogServer;
use loghouse_proto::v1::raft_service_server::RaftServiceServer;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;

use crate::auth::{AclAuthorizer, Authorizer};
use crate::config::NodeConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::membership::{MemberInfo, Membership, MembershipConfig, MembershipHandler};
use crate::network::RaftRpcServer;
use crate::raft::DistributedLog;
use crate::service::{CommitLog, LogService, ServersFetcher};
use crate::stream::{MuxStream, StreamLayer};
use crate::tls;

/// One running loghouse node.
pub struct Agent {
    config: NodeConfig,
    distributed_log: Arc<DistributedLog>,
    membership: Membership,
    accept_task: JoinHandle<()>,
    server_tasks: Vec<JoinHandle<()>>,
    server_shutdowns: Vec<oneshot::Sender<()>>,
    shut_down: bool,
}

impl Agent {
    /// Starts a node from its configuration.
    pub async fn start(config: NodeConfig) -> ClusterResult<Self> {
        config.validate().map_err(ClusterError::Config)?;

        let server_tls = config
            .server_tls
            .as_ref()
            .map(tls::server_config)
            .transpose()?;
        let peer_tls = config.peer_tls.as_ref().map(tls::client_config).transpose()?;
        let stream_layer = Arc::new(StreamLayer::new(server_tls, peer_tls));

        let rpc_addr = config.rpc_addr();
        let listener = TcpListener::bind(&rpc_addr).await?;

        let distributed_log =
            Arc::new(DistributedLog::open(&config, Arc::clone(&stream_layer)).await?);

        let (raft_tx, raft_rx) = mpsc::channel::<MuxStream>(64);
        let (record_tx, record_rx) = mpsc::channel::<MuxStream>(64);
        let accept_task = Arc::clone(&stream_layer).serve(listener, raft_tx, record_tx);

        let mut server_shutdowns = Vec::with_capacity(2);
        let mut server_tasks = Vec::with_capacity(2);

        let raft_service = RaftRpcServer::new(distributed_log.raft());
        let (raft_stop_tx, raft_stop_rx) = oneshot::channel();
        server_shutdowns.push(raft_stop_tx);
        server_tasks.push(tokio::spawn(async move {
            let incoming = ReceiverStream::new(raft_rx).map(Ok::<_, std::io::Error>);
            if let Err(e) = Server::builder()
                .add_service(RaftServiceServer::new(raft_service))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = raft_stop_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "consensus server exited");
            }
        }));

        let authorizer: Arc<dyn Authorizer> = match &config.acl_policy_file {
            Some(path) => Arc::new(AclAuthorizer::from_policy_file(path)?),
            None => Arc::new(AclAuthorizer::permit_all()),
        };
        let log_service = LogService::new(
            Arc::clone(&distributed_log) as Arc<dyn CommitLog>,
            Arc::clone(&distributed_log) as Arc<dyn ServersFetcher>,
            authorizer,
        );
        let (record_stop_tx, record_stop_rx) = oneshot::channel();
        server_shutdowns.push(record_stop_tx);
        server_tasks.push(tokio::spawn(async move {
            let incoming = ReceiverStream::new(record_rx).map(Ok::<_, std::io::Error>);
            if let Err(e) = Server::builder()
                .add_service(LogServer::new(log_service))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = record_stop_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "record server exited");
            }
        }));

        let membership = Membership::start(
            MembershipConfig::new(
                MemberInfo {
                    id: config.node_id,
                    name: config.node_name.clone(),
                    rpc_addr: rpc_addr.clone(),
                    gossip_addr: config.bind_addr.clone(),
                },
                config.start_join_addrs.clone(),
            ),
            Arc::clone(&distributed_log) as Arc<dyn MembershipHandler>,
        )
        .await?;

        tracing::info!(
            node_id = config.node_id,
            rpc_addr = %rpc_addr,
            bind_addr = %config.bind_addr,
            "agent started"
        );

        Ok(Self {
            config,
            distributed_log,
            membership,
            accept_task,
            server_tasks,
            server_shutdowns,
            shut_down: false,
        })
    }

    /// The node's record/consensus address.
    pub fn rpc_addr(&self) -> String {
        self.config.rpc_addr()
    }

    /// The node's gossip address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The distributed log this agent serves.
    pub fn distributed_log(&self) -> &Arc<DistributedLog> {
        &self.distributed_log
    }

    /// Leaves the gossip ring without shutting the node down. The leader
    /// removes this node's vote when it observes the departure; the node
    /// stops receiving replicated records.
    pub async fn leave(&mut self) -> ClusterResult<()> {
        self.membership.leave().await
    }

    /// Stops discovery, the servers, and consensus, then closes the logs.
    pub async fn shutdown(&mut self) -> ClusterResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.membership.leave().await?;
        for stop in self.server_shutdowns.drain(..) {
            let _ = stop.send(());
        }
        self.accept_task.abort();
        // Streaming consumers can hold a graceful drain open indefinitely;
        // give each server a moment, then cut it off.
        for mut task in self.server_tasks.drain(..) {
            if tokio::time::timeout(std::time::Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        self.distributed_log.shutdown().await?;

        tracing::info!(node_id = self.config.node_id, "agent shut down");
        Ok(())
    }
}

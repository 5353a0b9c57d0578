//! DistributedLog: the replicated commit log facade.
//!
//! Appends travel through consensus so every node's state machine applies
//! the same command sequence and assigns the same offsets; reads are served
//! from the local log with no consensus involvement.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use loghouse_core::{Log, LogConfig};
use loghouse_proto::v1::{Record, Server};
use openraft::error::InitializeError;
use openraft::{BasicNode, SnapshotPolicy};
use tokio::time::Instant;

use crate::command::Command;
use crate::config::NodeConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::network::RaftNetworkClient;
use crate::raft::{LogStore, StableStore, StateMachine};
use crate::stream::StreamLayer;
use crate::types::{
    extract_forward_to_leader, is_forward_to_leader, LogRaft, NodeId, RaftWriteError,
};

/// A replicated log node: the record log plus the consensus engine
/// coordinating it with its peers.
pub struct DistributedLog {
    id: NodeId,
    rpc_addr: String,
    log: Arc<Log>,
    log_store: LogStore,
    raft: LogRaft,
    apply_timeout: Duration,
}

impl DistributedLog {
    /// Builds the node's storage and consensus stack under
    /// `config.data_dir`:
    ///
    /// ```text
    /// <data_dir>/log              record segments
    /// <data_dir>/raft/log         consensus log segments (initial offset 1)
    /// <data_dir>/raft/stable      consensus metadata KV
    /// <data_dir>/raft/snapshots   file snapshot store
    /// ```
    ///
    /// When `config.bootstrap` is set and no prior state exists, the node
    /// bootstraps a single-voter cluster with itself.
    pub async fn open(config: &NodeConfig, stream_layer: Arc<StreamLayer>) -> ClusterResult<Self> {
        let log_config = LogConfig {
            segment: config.segment.clone(),
        };
        let log = Arc::new(Log::open(config.data_dir.join("log"), log_config.clone())?);

        let raft_dir = config.data_dir.join("raft");
        fs::create_dir_all(&raft_dir)?;
        let stable = Arc::new(StableStore::open(&raft_dir.join("stable"))?);
        let log_store = LogStore::open(&raft_dir.join("log"), Arc::clone(&stable), log_config)?;
        let state_machine = Arc::new(StateMachine::open(
            Arc::clone(&log),
            stable,
            &raft_dir.join("snapshots"),
            config.raft.snapshot_retain,
        )?);

        let raft_config = openraft::Config {
            cluster_name: "loghouse".to_string(),
            heartbeat_interval: config.raft.heartbeat_interval_ms,
            election_timeout_min: config.raft.election_timeout_ms.0,
            election_timeout_max: config.raft.election_timeout_ms.1,
            max_payload_entries: config.raft.max_entries_per_append,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.raft.snapshot_threshold),
            ..Default::default()
        };
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        );

        let network = RaftNetworkClient::new(stream_layer);
        let raft = LogRaft::new(
            config.node_id,
            raft_config,
            network,
            log_store.clone(),
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::Raft(format!("starting consensus: {e:?}")))?;

        let node = Self {
            id: config.node_id,
            rpc_addr: config.rpc_addr(),
            log,
            log_store,
            raft,
            apply_timeout: config.apply_timeout(),
        };

        if config.bootstrap {
            node.bootstrap().await?;
        }
        Ok(node)
    }

    /// Bootstraps a single-voter cluster. A node that already has state is
    /// left alone so restarts are safe.
    async fn bootstrap(&self) -> ClusterResult<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.id,
            BasicNode {
                addr: self.rpc_addr.clone(),
            },
        );
        match self.raft.initialize(members).await {
            Ok(()) => {
                tracing::info!(node_id = self.id, "bootstrapped single-voter cluster");
                Ok(())
            }
            Err(openraft::error::RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::debug!(node_id = self.id, "prior state exists, skipping bootstrap");
                Ok(())
            }
            Err(e) => Err(ClusterError::Raft(format!("bootstrap: {e:?}"))),
        }
    }

    /// Proposes an append through consensus and returns the offset the
    /// state machine assigned. Leader-only: on followers this surfaces
    /// [`ClusterError::NotLeader`] with a leader hint when one is known.
    pub async fn append(&self, record: Record) -> ClusterResult<u64> {
        let frame = Command::append(record).encode();
        let result = tokio::time::timeout(self.apply_timeout, self.raft.client_write(frame))
            .await
            .map_err(|_| ClusterError::ProposalTimeout)?;

        match result {
            Ok(resp) => {
                let data = resp.data;
                if let Some(error) = data.error {
                    return Err(ClusterError::Apply(error));
                }
                data.offset
                    .ok_or_else(|| ClusterError::Apply("append returned no offset".to_string()))
            }
            Err(e) => Err(write_error(e)),
        }
    }

    /// Reads a record from the local log. Followers may lag the leader by
    /// their applied index; reads never touch consensus.
    pub fn read(&self, offset: u64) -> ClusterResult<Record> {
        Ok(self.log.read(offset)?)
    }

    /// Adds a server to the cluster as a voter. An exact `(id, addr)` match
    /// is a no-op; a conflicting pairing on either key removes the stale
    /// voter first. Must run on the leader.
    pub async fn join(&self, id: NodeId, addr: &str) -> ClusterResult<()> {
        let membership = self.raft.metrics().borrow().membership_config.clone();
        let mut stale = None;
        for (node_id, node) in membership.nodes() {
            if *node_id == id && node.addr == addr {
                tracing::debug!(node_id = id, addr, "server already joined");
                return Ok(());
            }
            if *node_id == id || node.addr == addr {
                stale = Some(*node_id);
            }
        }
        if let Some(stale_id) = stale {
            tracing::info!(node_id = stale_id, "removing stale pairing before join");
            self.leave(stale_id).await?;
        }

        self.raft
            .add_learner(
                id,
                BasicNode {
                    addr: addr.to_string(),
                },
                true,
            )
            .await
            .map_err(write_error)?;

        let mut voters: BTreeSet<NodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .voter_ids()
            .collect();
        voters.insert(id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;

        tracing::info!(node_id = id, addr, "server joined as voter");
        Ok(())
    }

    /// Removes a voter. Removing the current leader triggers an election.
    /// Must run on the leader.
    pub async fn leave(&self, id: NodeId) -> ClusterResult<()> {
        let mut voters: BTreeSet<NodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .voter_ids()
            .collect();
        if !voters.remove(&id) {
            tracing::debug!(node_id = id, "server is not a voter");
            return Ok(());
        }
        if voters.is_empty() {
            return Err(ClusterError::Config(
                "cannot remove the last voter".to_string(),
            ));
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;
        tracing::info!(node_id = id, "server left the cluster");
        Ok(())
    }

    /// Blocks until the cluster has a leader, polling once per second, or
    /// fails with [`ClusterError::NoLeader`] after `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<NodeId> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if let Some(leader) = self.raft.current_leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::NoLeader);
            }
        }
    }

    /// The cluster view served to client resolvers: every member's rpc
    /// address, tagged with whether it is the current leader.
    pub fn servers(&self) -> Vec<Server> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader;
        metrics
            .membership_config
            .nodes()
            .map(|(node_id, node)| Server {
                id: *node_id,
                rpc_addr: node.addr.clone(),
                is_leader: Some(*node_id) == leader,
            })
            .collect()
    }

    /// The current leader's ID, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        self.raft.current_leader().await
    }

    /// Whether this node is the current leader.
    pub async fn is_leader(&self) -> bool {
        self.raft.current_leader().await == Some(self.id)
    }

    /// This node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn raft(&self) -> Arc<LogRaft> {
        Arc::new(self.raft.clone())
    }

    /// Shuts consensus down, then closes both logs.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Raft(format!("shutdown: {e:?}")))?;
        self.log_store.close()?;
        self.log.close()?;
        tracing::info!(node_id = self.id, "distributed log shut down");
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::service::CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> ClusterResult<u64> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> ClusterResult<Record> {
        DistributedLog::read(self, offset)
    }
}

#[async_trait::async_trait]
impl crate::service::ServersFetcher for DistributedLog {
    async fn get_servers(&self) -> ClusterResult<Vec<Server>> {
        Ok(self.servers())
    }
}

/// Discovery events map straight onto voter changes. On followers these
/// fail with a not-leader rejection, which the gossip layer tolerates; the
/// leader's transition is the one that replicates.
#[async_trait::async_trait]
impl crate::membership::MembershipHandler for DistributedLog {
    async fn join(&self, id: NodeId, rpc_addr: &str) -> ClusterResult<()> {
        DistributedLog::join(self, id, rpc_addr).await
    }

    async fn leave(&self, id: NodeId) -> ClusterResult<()> {
        DistributedLog::leave(self, id).await
    }
}

/// Maps an engine write error onto the cluster error surface: leader
/// rejections become [`ClusterError::NotLeader`], everything else is opaque.
fn write_error(e: RaftWriteError) -> ClusterError {
    if let Some(info) = extract_forward_to_leader(&e) {
        return ClusterError::NotLeader {
            leader: Some(info.leader_id),
        };
    }
    if is_forward_to_leader(&e) {
        return ClusterError::NotLeader { leader: None };
    }
    ClusterError::Raft(format!("{e:?}"))
}

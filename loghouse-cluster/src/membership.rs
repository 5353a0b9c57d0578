//! Gossip membership: maintains the live set of cluster members and fires
//! join/leave callbacks used to add and remove consensus voters.
//!
//! The protocol is deliberately small. Every node periodically sends its
//! member table over UDP to the peers it knows (seeded by the start-join
//! addresses); receiving a table upserts the sender and introduces unseen
//! members. Explicit leave messages and a liveness cutoff retire members.
//! Every node observes every event, but only the leader's join/leave
//! transitions matter: handlers failing with a not-leader rejection are
//! logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ClusterError, ClusterResult};
use crate::types::NodeId;

/// How many peers each gossip round sends the member table to.
const GOSSIP_FANOUT: usize = 3;

/// Receives membership transitions. The distributed log plugs in here to
/// add and remove voters on the leader.
#[async_trait]
pub trait MembershipHandler: Send + Sync + 'static {
    async fn join(&self, id: NodeId, rpc_addr: &str) -> ClusterResult<()>;
    async fn leave(&self, id: NodeId) -> ClusterResult<()>;
}

/// One member as carried in gossip messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: NodeId,
    pub name: String,
    /// Address of the member's record/consensus port.
    pub rpc_addr: String,
    /// Address the member gossips on.
    pub gossip_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    /// The sender's view of the cluster, including itself.
    Sync {
        from: MemberInfo,
        members: Vec<MemberInfo>,
    },
    /// The member is leaving on purpose.
    Leave { id: NodeId },
}

/// Configuration for the gossip layer.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub local: MemberInfo,
    /// Gossip addresses of members already in the cluster; empty on the
    /// bootstrap node.
    pub start_join_addrs: Vec<String>,
    /// Cadence of table exchanges.
    pub gossip_interval: Duration,
    /// Members silent for longer than this are presumed failed.
    pub failure_timeout: Duration,
}

impl MembershipConfig {
    pub fn new(local: MemberInfo, start_join_addrs: Vec<String>) -> Self {
        Self {
            local,
            start_join_addrs,
            gossip_interval: Duration::from_millis(300),
            failure_timeout: Duration::from_secs(5),
        }
    }
}

struct MemberState {
    info: MemberInfo,
    last_seen: Instant,
    /// Cleared until the handler accepted the join (or declared itself not
    /// responsible); retried each round while set.
    join_pending: bool,
}

struct Inner {
    config: MembershipConfig,
    socket: UdpSocket,
    handler: Arc<dyn MembershipHandler>,
    members: RwLock<HashMap<NodeId, MemberState>>,
}

/// The gossip session for one node.
pub struct Membership {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Membership {
    /// Binds the gossip socket and starts the exchange loop. The initial
    /// table is announced to the start-join addresses immediately.
    pub async fn start(
        config: MembershipConfig,
        handler: Arc<dyn MembershipHandler>,
    ) -> ClusterResult<Self> {
        let socket = UdpSocket::bind(&config.local.gossip_addr).await?;
        tracing::info!(
            node_id = config.local.id,
            bind_addr = %config.local.gossip_addr,
            "membership started"
        );
        let inner = Arc::new(Inner {
            config,
            socket,
            handler,
            members: RwLock::new(HashMap::new()),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let loop_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(loop_inner.config.gossip_interval);
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        loop_inner.gossip_round().await;
                    }
                    received = loop_inner.socket.recv_from(&mut buf) => {
                        match received {
                            Ok((n, _)) => loop_inner.receive(&buf[..n]).await,
                            Err(e) => tracing::warn!(error = %e, "gossip receive failed"),
                        }
                    }
                }
            }
        });

        Ok(Self {
            inner,
            task,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// The current member view: this node plus everyone it has heard from.
    pub async fn members(&self) -> Vec<MemberInfo> {
        let members = self.inner.members.read().await;
        let mut all = vec![self.inner.config.local.clone()];
        all.extend(members.values().map(|m| m.info.clone()));
        all
    }

    /// Announces departure to every known member and stops gossiping. The
    /// local node's voter removal happens on the leader when it handles the
    /// leave message.
    pub async fn leave(&mut self) -> ClusterResult<()> {
        let message = GossipMessage::Leave {
            id: self.inner.config.local.id,
        };
        let payload = serde_json::to_vec(&message)?;
        let members = self.inner.members.read().await;
        for member in members.values() {
            if let Err(e) = self
                .inner
                .socket
                .send_to(&payload, &member.info.gossip_addr)
                .await
            {
                tracing::warn!(
                    peer = %member.info.gossip_addr,
                    error = %e,
                    "failed to announce leave"
                );
            }
        }
        drop(members);

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        tracing::info!(node_id = self.inner.config.local.id, "left the gossip ring");
        Ok(())
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

impl Inner {
    /// One gossip round: retire silent members, retry pending joins, and
    /// send the member table to a sample of peers.
    async fn gossip_round(&self) {
        self.expire_members().await;
        self.retry_pending_joins().await;

        let (table, mut targets) = {
            let members = self.members.read().await;
            let mut table = vec![self.config.local.clone()];
            table.extend(members.values().map(|m| m.info.clone()));
            let targets: Vec<String> = members
                .values()
                .map(|m| m.info.gossip_addr.clone())
                .collect();
            (table, targets)
        };

        // Until peers answer, the seed addresses are all we have.
        if targets.is_empty() {
            targets = self.config.start_join_addrs.clone();
        } else {
            targets.shuffle(&mut rand::thread_rng());
            targets.truncate(GOSSIP_FANOUT);
        }

        let message = GossipMessage::Sync {
            from: self.config.local.clone(),
            members: table,
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode gossip message");
                return;
            }
        };
        for target in targets {
            if let Err(e) = self.socket.send_to(&payload, &target).await {
                tracing::debug!(peer = %target, error = %e, "gossip send failed");
            }
        }
    }

    async fn receive(&self, payload: &[u8]) {
        let message: GossipMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed gossip message");
                return;
            }
        };
        match message {
            GossipMessage::Sync { from, members } => {
                self.observe(from, true).await;
                for member in members {
                    self.observe(member, false).await;
                }
            }
            GossipMessage::Leave { id } => {
                if id == self.config.local.id {
                    return;
                }
                let removed = self.members.write().await.remove(&id);
                if removed.is_some() {
                    tracing::info!(node_id = id, "member left");
                    self.handle_leave(id).await;
                }
            }
        }
    }

    /// Upserts one member. Events about the local node are noise.
    async fn observe(&self, info: MemberInfo, direct: bool) {
        if info.id == self.config.local.id {
            return;
        }
        let mut members = self.members.write().await;
        if let Some(state) = members.get_mut(&info.id) {
            if direct {
                state.last_seen = Instant::now();
            }
            state.info = info;
            return;
        }
        tracing::info!(node_id = info.id, rpc_addr = %info.rpc_addr, "member joined");
        members.insert(
            info.id,
            MemberState {
                info: info.clone(),
                last_seen: Instant::now(),
                join_pending: true,
            },
        );
        drop(members);
        self.handle_join(info).await;
    }

    async fn retry_pending_joins(&self) {
        let pending: Vec<MemberInfo> = {
            let members = self.members.read().await;
            members
                .values()
                .filter(|m| m.join_pending)
                .map(|m| m.info.clone())
                .collect()
        };
        for info in pending {
            self.handle_join(info).await;
        }
    }

    async fn expire_members(&self) {
        let expired: Vec<NodeId> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|(_, m)| m.last_seen.elapsed() > self.config.failure_timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            tracing::info!(node_id = id, "member presumed failed");
            self.members.write().await.remove(&id);
            self.handle_leave(id).await;
        }
    }

    async fn handle_join(&self, info: MemberInfo) {
        match self.handler.join(info.id, &info.rpc_addr).await {
            Ok(()) => self.mark_joined(info.id).await,
            // Not being the leader is the normal case on n-1 nodes.
            Err(ClusterError::NotLeader { .. }) => self.mark_joined(info.id).await,
            Err(e) => {
                tracing::warn!(node_id = info.id, error = %e, "join handler failed; will retry");
            }
        }
    }

    async fn mark_joined(&self, id: NodeId) {
        if let Some(state) = self.members.write().await.get_mut(&id) {
            state.join_pending = false;
        }
    }

    async fn handle_leave(&self, id: NodeId) {
        match self.handler.leave(id).await {
            Ok(()) | Err(ClusterError::NotLeader { .. }) => {}
            Err(e) => {
                tracing::warn!(node_id = id, error = %e, "leave handler failed");
            }
        }
    }
}

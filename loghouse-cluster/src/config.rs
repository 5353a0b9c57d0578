//! Node configuration.

use loghouse_core::SegmentConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's unique ID in the cluster (1-based).
    pub node_id: u64,

    /// Human-readable node name used by discovery. Defaults to the ID.
    pub node_name: String,

    /// Address the gossip layer binds to (UDP), e.g. "127.0.0.1:8401".
    pub bind_addr: String,

    /// Port carrying both the record RPC service and consensus traffic.
    /// The listen host is taken from `bind_addr`.
    pub rpc_port: u16,

    /// Gossip addresses of nodes already in the cluster. Empty on the
    /// bootstrap node.
    pub start_join_addrs: Vec<String>,

    /// Whether this node bootstraps a fresh single-voter cluster. True on
    /// the first node only; ignored when prior consensus state exists.
    pub bootstrap: bool,

    /// Root directory for on-disk state.
    pub data_dir: PathBuf,

    /// Segment sizing for the record log and the consensus log store.
    pub segment: SegmentConfig,

    /// Consensus timing configuration.
    pub raft: RaftTuning,

    /// ACL policy file: a JSON list of `{subject, actions}` rules. When
    /// unset, every subject is allowed.
    pub acl_policy_file: Option<PathBuf>,

    /// TLS served to record clients and cluster peers. When unset the node
    /// speaks plaintext.
    pub server_tls: Option<TlsSettings>,

    /// TLS used when dialing cluster peers (mTLS for cluster traffic).
    pub peer_tls: Option<TlsSettings>,
}

/// Paths to PEM material for one TLS direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Certificate chain.
    pub cert_file: PathBuf,
    /// Private key.
    pub key_file: PathBuf,
    /// CA bundle used to verify the remote side. On the server side its
    /// presence makes client certificates mandatory.
    pub ca_file: Option<PathBuf>,
}

/// Consensus timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftTuning {
    /// Heartbeat interval in milliseconds. The leader asserts authority at
    /// this cadence.
    pub heartbeat_interval_ms: u64,

    /// Election timeout range (min, max) in milliseconds. Should be well
    /// above the heartbeat interval to avoid spurious elections.
    pub election_timeout_ms: (u64, u64),

    /// Maximum entries per replication batch.
    pub max_entries_per_append: u64,

    /// Build a snapshot after this many log entries since the last one.
    pub snapshot_threshold: u64,

    /// How many snapshots the file snapshot store retains.
    pub snapshot_retain: usize,

    /// How long a proposal may take to commit and apply before the caller
    /// gets a timeout.
    pub apply_timeout_ms: u64,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            // Standard Raft recommendation, >> heartbeat.
            election_timeout_ms: (150, 300),
            max_entries_per_append: 100,
            snapshot_threshold: 10_000,
            snapshot_retain: 1,
            apply_timeout_ms: 10_000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            node_name: "1".to_string(),
            bind_addr: "127.0.0.1:8401".to_string(),
            rpc_port: 8400,
            start_join_addrs: Vec::new(),
            bootstrap: false,
            data_dir: PathBuf::from("./loghouse-data"),
            segment: SegmentConfig::default(),
            raft: RaftTuning::default(),
            acl_policy_file: None,
            server_tls: None,
            peer_tls: None,
        }
    }
}

impl NodeConfig {
    /// Create a new configuration builder.
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// The address the record RPC and consensus port listens on: the
    /// gossip bind host paired with `rpc_port`.
    pub fn rpc_addr(&self) -> String {
        let host = self
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.bind_addr.as_str());
        format!("{host}:{}", self.rpc_port)
    }

    /// The proposal timeout as a Duration.
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.raft.apply_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id == 0 {
            return Err("node_id must be > 0".to_string());
        }
        if self.bind_addr.is_empty() {
            return Err("bind_addr is required".to_string());
        }
        if self.rpc_port == 0 {
            return Err("rpc_port is required".to_string());
        }
        let (min_election, max_election) = self.raft.election_timeout_ms;
        if min_election > max_election {
            return Err(format!(
                "election_timeout_ms range is inverted: ({min_election}, {max_election})"
            ));
        }
        if self.raft.heartbeat_interval_ms >= min_election / 2 {
            return Err(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.raft.heartbeat_interval_ms, min_election
            ));
        }
        Ok(())
    }
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
    name_set: bool,
}

impl NodeConfigBuilder {
    /// Set the node ID. Also sets the node name unless one was given.
    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node_id = id;
        if !self.name_set {
            self.config.node_name = id.to_string();
        }
        self
    }

    /// Set the node name used by discovery.
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self.name_set = true;
        self
    }

    /// Set the gossip bind address.
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Set the shared record/consensus port.
    pub fn rpc_port(mut self, port: u16) -> Self {
        self.config.rpc_port = port;
        self
    }

    /// Add a gossip address of a node already in the cluster.
    pub fn start_join_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.start_join_addrs.push(addr.into());
        self
    }

    /// Set all start-join addresses at once.
    pub fn start_join_addrs(mut self, addrs: impl IntoIterator<Item = String>) -> Self {
        self.config.start_join_addrs = addrs.into_iter().collect();
        self
    }

    /// Mark this node as the cluster bootstrap node.
    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap = bootstrap;
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the segment sizing configuration.
    pub fn segment(mut self, segment: SegmentConfig) -> Self {
        self.config.segment = segment;
        self
    }

    /// Set the snapshot threshold.
    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.config.raft.snapshot_threshold = entries;
        self
    }

    /// Set the proposal timeout in milliseconds.
    pub fn apply_timeout_ms(mut self, ms: u64) -> Self {
        self.config.raft.apply_timeout_ms = ms;
        self
    }

    /// Set the ACL policy file.
    pub fn acl_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.acl_policy_file = Some(path.into());
        self
    }

    /// Set the server-side TLS material.
    pub fn server_tls(mut self, tls: TlsSettings) -> Self {
        self.config.server_tls = Some(tls);
        self
    }

    /// Set the peer-side TLS material.
    pub fn peer_tls(mut self, tls: TlsSettings) -> Self {
        self.config.peer_tls = Some(tls);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<NodeConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

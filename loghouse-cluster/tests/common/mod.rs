//! Shared test utilities for cluster tests.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use loghouse_cluster::{Agent, NodeConfig};
use loghouse_proto::v1::log_client::LogClient;
use loghouse_proto::v1::{ConsumeRequest, ProduceRequest, Record};
use tempfile::TempDir;
use tonic::transport::Channel;

/// Atomic counter for allocating unique ports. Each node takes two
/// consecutive ports: gossip and rpc.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(24000);

pub fn get_test_ports() -> (u16, u16) {
    let base = PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

/// A running cluster and the temp directories backing it.
#[allow(dead_code)]
pub struct TestCluster {
    /// Kept alive for the test duration.
    _temp_dirs: Vec<TempDir>,
    pub agents: Vec<Agent>,
}

#[allow(dead_code)]
impl TestCluster {
    /// Starts `node_count` agents. The first bootstraps; the rest join it
    /// through gossip. Returns once the bootstrap node is leader.
    pub async fn new(node_count: usize) -> Self {
        let mut temp_dirs = Vec::with_capacity(node_count);
        let mut agents: Vec<Agent> = Vec::with_capacity(node_count);

        for i in 0..node_count {
            let (gossip_port, rpc_port) = get_test_ports();
            let temp_dir = TempDir::new().expect("create temp dir");

            let mut builder = NodeConfig::builder()
                .node_id(i as u64 + 1)
                .bind_addr(format!("127.0.0.1:{gossip_port}"))
                .rpc_port(rpc_port)
                .data_dir(temp_dir.path())
                .bootstrap(i == 0);
            if i != 0 {
                builder = builder.start_join_addr(agents[0].bind_addr().to_string());
            }
            let config = builder.build().expect("valid config");

            let agent = Agent::start(config).await.expect("start agent");
            if i == 0 {
                agent
                    .distributed_log()
                    .wait_for_leader(Duration::from_secs(10))
                    .await
                    .expect("bootstrap node should elect itself");
            }

            temp_dirs.push(temp_dir);
            agents.push(agent);
        }

        Self {
            _temp_dirs: temp_dirs,
            agents,
        }
    }

    /// Waits until every agent reports `voters` voting members.
    pub async fn wait_for_voters(&self, voters: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        'outer: loop {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {voters} voters"
            );
            for agent in &self.agents {
                let seen = agent
                    .distributed_log()
                    .servers()
                    .iter()
                    .filter(|s| !s.rpc_addr.is_empty())
                    .count();
                if seen < voters {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue 'outer;
                }
            }
            return;
        }
    }

    /// A record client connected to agent `i`.
    pub async fn client(&self, i: usize) -> LogClient<Channel> {
        connect_client(&self.agents[i].rpc_addr()).await
    }

    pub async fn shutdown(&mut self) {
        for agent in &mut self.agents {
            agent.shutdown().await.expect("shutdown agent");
        }
    }
}

pub async fn connect_client(rpc_addr: &str) -> LogClient<Channel> {
    LogClient::connect(format!("http://{rpc_addr}"))
        .await
        .expect("connect client")
}

pub async fn produce(client: &mut LogClient<Channel>, value: &[u8]) -> u64 {
    client
        .produce(ProduceRequest {
            record: Some(Record {
                value: value.to_vec(),
                ..Default::default()
            }),
        })
        .await
        .expect("produce")
        .into_inner()
        .offset
}

pub async fn consume(
    client: &mut LogClient<Channel>,
    offset: u64,
) -> Result<Record, tonic::Status> {
    let response = client.consume(ConsumeRequest { offset }).await?;
    Ok(response.into_inner().record.expect("record present"))
}

/// Polls until `check` passes or the deadline elapses.
pub async fn eventually<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

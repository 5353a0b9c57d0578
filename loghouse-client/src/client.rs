//! The record service client: endpoint resolution plus per-call routing.

use std::collections::HashMap;

use loghouse_proto::v1::log_client::LogClient;
use loghouse_proto::v1::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, ProduceRequest, Record,
};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::{Code, Streaming};

use crate::error::{ClientError, Result};
use crate::picker::{Picker, ServerInfo};

struct State {
    picker: Picker,
    channels: HashMap<String, Channel>,
}

/// A client for the loghouse record service.
///
/// # Example
///
/// ```no_run
/// use loghouse_client::Client;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::connect("127.0.0.1:8400").await?;
/// let offset = client.produce(b"hello".to_vec()).await?;
/// let record = client.consume(offset).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    /// The endpoint resolution bootstraps from.
    endpoint: String,
    state: Mutex<State>,
}

impl Client {
    /// Dials `endpoint` (host:port of any cluster member) and resolves the
    /// member set from it.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let client = Self {
            endpoint,
            state: Mutex::new(State {
                picker: Picker::default(),
                channels: HashMap::new(),
            }),
        };
        client.resolve().await?;
        Ok(client)
    }

    /// Re-resolves the member set via `GetServers`. Tries the known
    /// channels first and falls back to the bootstrap endpoint; on failure
    /// the previous state is kept.
    pub async fn resolve(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut addrs: Vec<String> = state.channels.keys().cloned().collect();
        addrs.push(self.endpoint.clone());

        let mut last_error = ClientError::NoServerAvailable;
        for addr in addrs {
            let channel = match Self::channel(&mut state.channels, &addr).await {
                Ok(channel) => channel,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };
            match LogClient::new(channel).get_servers(GetServersRequest {}).await {
                Ok(response) => {
                    let servers: Vec<ServerInfo> = response
                        .into_inner()
                        .servers
                        .into_iter()
                        .map(|s| ServerInfo {
                            id: s.id,
                            rpc_addr: s.rpc_addr,
                            is_leader: s.is_leader,
                        })
                        .collect();
                    tracing::debug!(count = servers.len(), "resolved servers");
                    state.picker.update(servers);
                    return Ok(());
                }
                Err(status) => {
                    tracing::warn!(%addr, error = %status, "failed to resolve servers");
                    last_error = ClientError::Rpc(status);
                }
            }
        }
        // Keep whatever routing state we had; the caller may still succeed.
        if self.state_has_servers().await {
            Ok(())
        } else {
            Err(last_error)
        }
    }

    async fn state_has_servers(&self) -> bool {
        !self.state.lock().await.picker.is_empty()
    }

    async fn channel(channels: &mut HashMap<String, Channel>, addr: &str) -> Result<Channel> {
        if let Some(channel) = channels.get(addr) {
            return Ok(channel.clone());
        }
        let channel = Channel::from_shared(format!("http://{addr}"))
            .map_err(|_| ClientError::NoServerAvailable)?
            .connect()
            .await?;
        channels.insert(addr.to_string(), channel.clone());
        Ok(channel)
    }

    async fn leader_client(&self) -> Result<LogClient<Channel>> {
        let mut state = self.state.lock().await;
        let leader = state.picker.pick_leader().ok_or(ClientError::NoServerAvailable)?;
        let channel = Self::channel(&mut state.channels, &leader.rpc_addr).await?;
        Ok(LogClient::new(channel))
    }

    async fn follower_client(&self) -> Result<LogClient<Channel>> {
        let mut state = self.state.lock().await;
        let follower = state
            .picker
            .pick_follower()
            .ok_or(ClientError::NoServerAvailable)?;
        let channel = Self::channel(&mut state.channels, &follower.rpc_addr).await?;
        Ok(LogClient::new(channel))
    }

    /// Appends a record on the leader and returns its offset. A stale
    /// leader view re-resolves and retries once.
    pub async fn produce(&self, value: Vec<u8>) -> Result<u64> {
        let request = ProduceRequest {
            record: Some(Record {
                value,
                ..Default::default()
            }),
        };

        match self.try_produce(request.clone()).await {
            Ok(offset) => Ok(offset),
            Err(e) if is_stale_route(&e) => {
                tracing::debug!(error = %e, "stale leader view, re-resolving");
                self.resolve().await?;
                self.try_produce(request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_produce(&self, request: ProduceRequest) -> Result<u64> {
        let mut client = self.leader_client().await?;
        Ok(client.produce(request).await?.into_inner().offset)
    }

    /// Reads the record at `offset` from a rotating follower.
    pub async fn consume(&self, offset: u64) -> Result<Record> {
        let mut client = self.follower_client().await?;
        let response = client.consume(ConsumeRequest { offset }).await?;
        response
            .into_inner()
            .record
            .ok_or(ClientError::NoServerAvailable)
    }

    /// Opens a tailing stream from `offset` on a rotating follower. The
    /// stream pauses at the head of the log and resumes as records arrive.
    pub async fn consume_stream(&self, offset: u64) -> Result<Streaming<ConsumeResponse>> {
        let mut client = self.follower_client().await?;
        let response = client.consume_stream(ConsumeRequest { offset }).await?;
        Ok(response.into_inner())
    }

    /// The most recently resolved member set.
    pub async fn servers(&self) -> Vec<ServerInfo> {
        self.state.lock().await.picker.servers().to_vec()
    }
}

/// Whether an error means our routing table is stale: the callee is not the
/// leader, or the connection went away.
fn is_stale_route(e: &ClientError) -> bool {
    match e {
        ClientError::Rpc(status) => {
            matches!(status.code(), Code::FailedPrecondition | Code::Unavailable)
        }
        ClientError::Transport(_) => true,
        ClientError::NoServerAvailable => true,
    }
}

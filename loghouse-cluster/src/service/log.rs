//! The record service: produce, consume, their streaming variants, and the
//! membership view clients resolve against.
//!
//! The service depends on three narrow interfaces so it is not tied to the
//! distributed implementations: a commit log, a servers fetcher, and an
//! authorizer. The authenticated subject is the TLS peer certificate's
//! common name carried in the connection info; plaintext peers authenticate
//! as the empty subject.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loghouse_proto::v1::log_server::Log;
use loghouse_proto::v1::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest,
    ProduceResponse, Record, Server,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::auth::{Authorizer, CONSUME_ACTION, OBJECT_WILDCARD, PRODUCE_ACTION};
use crate::error::{ClusterError, ClusterResult};
use crate::stream::MuxConnectInfo;

/// How long a tailing consumer sleeps before retrying the offset at the
/// head of the log.
const TAIL_RETRY: Duration = Duration::from_millis(10);

/// The log the service appends to and reads from.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> ClusterResult<u64>;
    fn read(&self, offset: u64) -> ClusterResult<Record>;
}

/// The cluster view handed to client resolvers.
#[async_trait]
pub trait ServersFetcher: Send + Sync + 'static {
    async fn get_servers(&self) -> ClusterResult<Vec<Server>>;
}

/// gRPC implementation of the record service.
pub struct LogService {
    commit_log: Arc<dyn CommitLog>,
    servers: Arc<dyn ServersFetcher>,
    authorizer: Arc<dyn Authorizer>,
}

impl LogService {
    pub fn new(
        commit_log: Arc<dyn CommitLog>,
        servers: Arc<dyn ServersFetcher>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            commit_log,
            servers,
            authorizer,
        }
    }

    fn authorize<T>(&self, request: &Request<T>, action: &str) -> Result<(), Status> {
        self.authorizer
            .authorize(&subject(request), OBJECT_WILDCARD, action)
            .map_err(to_status)
    }
}

/// The peer's authenticated identity: the client certificate's subject
/// common name, or empty when the connection carries no certificate.
fn subject<T>(request: &Request<T>) -> String {
    request
        .extensions()
        .get::<MuxConnectInfo>()
        .and_then(|info| info.peer_subject.clone())
        .unwrap_or_default()
}

fn to_status(e: ClusterError) -> Status {
    match e {
        ClusterError::Log(loghouse_core::LogError::OffsetOutOfRange(offset)) => {
            Status::out_of_range(format!("offset out of range: {offset}"))
        }
        ClusterError::PermissionDenied { .. } => Status::permission_denied(e.to_string()),
        ClusterError::NotLeader { .. } => Status::failed_precondition(e.to_string()),
        ClusterError::ProposalTimeout => Status::deadline_exceeded(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

fn is_out_of_range(e: &ClusterError) -> bool {
    matches!(
        e,
        ClusterError::Log(loghouse_core::LogError::OffsetOutOfRange(_))
    )
}

#[tonic::async_trait]
impl Log for LogService {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        self.authorize(&request, PRODUCE_ACTION)?;
        let record = request
            .into_inner()
            .record
            .ok_or_else(|| Status::invalid_argument("produce request carries no record"))?;
        let offset = self.commit_log.append(record).await.map_err(to_status)?;
        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        self.authorize(&request, CONSUME_ACTION)?;
        let record = self
            .commit_log
            .read(request.into_inner().offset)
            .map_err(to_status)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream = ReceiverStream<Result<ProduceResponse, Status>>;

    /// Bidirectional produce: one response per request, in order. The first
    /// failed append ends the stream with its status.
    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        self.authorize(&request, PRODUCE_ACTION)?;
        let mut inbound = request.into_inner();
        let commit_log = Arc::clone(&self.commit_log);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let req = match inbound.message().await {
                    Ok(Some(req)) => req,
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };
                let result = match req.record {
                    Some(record) => commit_log
                        .append(record)
                        .await
                        .map(|offset| ProduceResponse { offset })
                        .map_err(to_status),
                    None => Err(Status::invalid_argument("produce request carries no record")),
                };
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ConsumeStreamStream = ReceiverStream<Result<ConsumeResponse, Status>>;

    /// Server-streaming consume that tails the log: reading past the head
    /// pauses and retries the same offset instead of erroring, so the
    /// stream serves records that do not exist yet. Any other error ends
    /// the stream.
    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        self.authorize(&request, CONSUME_ACTION)?;
        let mut offset = request.into_inner().offset;
        let commit_log = Arc::clone(&self.commit_log);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match commit_log.read(offset) {
                    Ok(record) => {
                        let response = ConsumeResponse {
                            record: Some(record),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                        offset += 1;
                    }
                    Err(ref e) if is_out_of_range(e) => {
                        if tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(TAIL_RETRY).await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(to_status(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> Result<Response<GetServersResponse>, Status> {
        let servers = self.servers.get_servers().await.map_err(to_status)?;
        Ok(Response::new(GetServersResponse { servers }))
    }
}

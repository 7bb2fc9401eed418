use crate::commitlog::{Index, LogError};
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{proto_request_range_error, proto_request_range_result, ProtoRequestRangeReq};
use crate::pipeline::TransactionToApply;
use crate::replica::entry_from_proto;
use crate::server::SharedLogReader;
use std::net::SocketAddr;
use tokio::time::Duration;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, thiserror::Error)]
pub enum CatchUpError {
    /// The range starts before the oldest retained entry. Only a snapshot of the store can bridge
    /// that, which is up to the store.
    #[error("Entries before {first_retained} are no longer retained; a snapshot is required")]
    SnapshotRequired { first_retained: u64 },

    #[error("Catch-up source unavailable: {0}")]
    Unavailable(String),
}

/// Somewhere committed entries can be fetched from again.
#[async_trait::async_trait]
pub trait CatchUpSource: Send + Sync {
    /// Returns entries starting exactly at `from`, in order, ending at or before `to_inclusive`.
    /// May return fewer than asked for, but never an empty list for a range that exists.
    async fn request_range(&self, from: u64, to_inclusive: u64) -> Result<Vec<TransactionToApply>, CatchUpError>;
}

/// Reads from this member's own log.
#[derive(Clone)]
pub struct LocalCatchUp {
    log_reader: SharedLogReader,
}

impl LocalCatchUp {
    pub(crate) fn new(log_reader: SharedLogReader) -> Self {
        LocalCatchUp { log_reader }
    }
}

#[async_trait::async_trait]
impl CatchUpSource for LocalCatchUp {
    async fn request_range(&self, from: u64, to_inclusive: u64) -> Result<Vec<TransactionToApply>, CatchUpError> {
        let (from, to) = match (Index::from_u64_opt(from), Index::from_u64_opt(to_inclusive)) {
            (Some(from), Some(to)) if from <= to => (from, to),
            _ => return Err(CatchUpError::Unavailable(format!("Invalid range [{}, {}]", from, to_inclusive))),
        };

        let log_reader = self.log_reader.clone();
        let entries = tokio::task::spawn_blocking(move || log_reader.read_range(from, to))
            .await
            .map_err(|e| CatchUpError::Unavailable(format!("Range read task failed: {:?}", e)))?
            .map_err(|e| match e {
                LogError::Pruned { first_retained, .. } => CatchUpError::SnapshotRequired {
                    first_retained: first_retained.as_u64(),
                },
                other => CatchUpError::Unavailable(other.to_string()),
            })?;

        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(offset, entry)| TransactionToApply {
                index: from.as_u64() + offset as u64,
                payload: entry.payload,
            })
            .collect())
    }
}

/// Fetches from another member over the raft gRPC service.
pub struct RemoteCatchUp {
    cluster_id: String,
    client: GrpcRaftClient<Channel>,
    rpc_timeout: Duration,
}

impl RemoteCatchUp {
    pub fn new(cluster_id: String, address: SocketAddr, rpc_timeout: Duration) -> Result<Self, CatchUpError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| CatchUpError::Unavailable(format!("Bad catch-up address: {:?}", e)))?;
        let channel = endpoint
            .connect_lazy()
            .map_err(|e| CatchUpError::Unavailable(format!("{:?}", e)))?;

        Ok(RemoteCatchUp {
            cluster_id,
            client: GrpcRaftClient::new(channel),
            rpc_timeout,
        })
    }
}

#[async_trait::async_trait]
impl CatchUpSource for RemoteCatchUp {
    async fn request_range(&self, from: u64, to_inclusive: u64) -> Result<Vec<TransactionToApply>, CatchUpError> {
        let request = ProtoRequestRangeReq {
            cluster_id: self.cluster_id.clone(),
            from_index: from,
            to_index: to_inclusive,
        };

        let mut client = self.client.clone();
        let reply = tokio::time::timeout(self.rpc_timeout, client.request_range(request))
            .await
            .map_err(|_| CatchUpError::Unavailable("RequestRange timed out".into()))?
            .map_err(|status| CatchUpError::Unavailable(format!("{:?}", status)))?
            .into_inner();

        match reply.result {
            Some(proto_request_range_result::Result::Ok(success)) => {
                if success.first_index != from {
                    return Err(CatchUpError::Unavailable(format!(
                        "Asked for entries from {}, got them from {}",
                        from, success.first_index
                    )));
                }
                success
                    .entries
                    .into_iter()
                    .enumerate()
                    .map(|(offset, proto)| {
                        entry_from_proto(proto)
                            .map(|entry| TransactionToApply {
                                index: from + offset as u64,
                                payload: entry.payload,
                            })
                            .map_err(CatchUpError::Unavailable)
                    })
                    .collect()
            }
            Some(proto_request_range_result::Result::Err(error)) => Err(match error.err {
                Some(proto_request_range_error::Err::SnapshotRequired(snapshot)) => CatchUpError::SnapshotRequired {
                    first_retained: snapshot.first_retained_index,
                },
                Some(proto_request_range_error::Err::ClientNotInCluster(_)) => {
                    CatchUpError::Unavailable("Remote member belongs to another cluster".into())
                }
                Some(proto_request_range_error::Err::ServerFault(fault)) => CatchUpError::Unavailable(fault.message),
                None => CatchUpError::Unavailable("Empty RequestRange error".into()),
            }),
            None => Err(CatchUpError::Unavailable("Empty RequestRange reply".into())),
        }
    }
}

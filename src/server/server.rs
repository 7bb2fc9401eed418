use crate::actor::WeakActorClient;
use crate::commitlog::{opt_index_as_u64, Index, LogError, LogReader};
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_request_range_error, proto_request_range_result,
    proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError, ProtoAppendEntriesReq,
    ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientNotInCluster, ProtoClientStaleTerm,
    ProtoRequestRangeError, ProtoRequestRangeReq, ProtoRequestRangeResult, ProtoRequestRangeSuccess,
    ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault,
    ProtoServerMissingPreviousLog, ProtoSnapshotRequired,
};
use crate::replica::{
    entry_from_proto, entry_to_proto, AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, MemberId,
    RequestVoteError, RequestVoteInput, RequestVoteOutput, Term, WriteAheadLogEntry,
};
use crate::server::RpcServerShutdownSignal;
use std::cmp;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Upper bound on entries returned by one RequestRange call. Callers page through longer ranges.
const MAX_RANGE_ENTRIES: u64 = 1024;

pub(crate) type SharedLogReader = Arc<dyn LogReader<WriteAheadLogEntry> + Send + Sync>;

/// RpcServer is the type that implements the Raft gRPC interface.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    cluster_id: String,
    local_replica: WeakActorClient,
    log_reader: SharedLogReader,
}

impl RpcServer {
    pub(crate) fn new(
        logger: slog::Logger,
        cluster_id: String,
        local_replica: WeakActorClient,
        log_reader: SharedLogReader,
    ) -> Self {
        RpcServer {
            logger,
            cluster_id,
            local_replica,
            log_reader,
        }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        match result {
            Ok(()) => slog::info!(logger, "Server run() has exited."),
            Err(e) => slog::error!(logger, "Server run() has exited with error: {:?}", e),
        }
    }

    fn is_my_cluster(&self, cluster_id: &str) -> bool {
        if cluster_id == self.cluster_id {
            return true;
        }
        slog::warn!(self.logger, "Rejecting request for cluster '{}'", cluster_id);
        false
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        if !self.is_my_cluster(&rpc_request.cluster_id) {
            return Ok(Self::convert_request_vote_result(Err(RequestVoteError::CandidateNotInCluster)));
        }

        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: MemberId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoRequestVoteResult {
                    result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                        vote_granted: ok.vote_granted,
                    })),
                }
            }
            Err(RequestVoteError::CandidateNotInCluster) => {
                proto_request_vote_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(RequestVoteError::RequestTermOutOfDate(term_info)) => {
                proto_request_vote_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(RequestVoteError::LocalStateIoError(e)) => proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                message: format!("Failed to persist vote: {:?}", e),
            }),
            Err(RequestVoteError::ActorExited) => proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError { err: Some(err) })),
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        if !self.is_my_cluster(&rpc_request.cluster_id) {
            return Ok(Self::convert_append_entries_result(Err(AppendEntriesError::ClientNotInCluster)));
        }

        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let leader_commit_index = Index::from_u64_opt(rpc_request.commit_index);

        let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
        for proto_entry in rpc_request.new_entries {
            new_entries.push(entry_from_proto(proto_entry).map_err(Status::invalid_argument)?);
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: MemberId::new(rpc_request.client_node_id),
            leader_previous_log_entry,
            leader_commit_index,
            new_entries,
        })
    }

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok(None),
            (0, _) => Err(Status::invalid_argument(
                "PreviousLogEntryTerm 0 and PreviousLogEntryIndex non-0",
            )),
            (_, 0) => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        // Empty
                    })),
                }
            }
            Err(AppendEntriesError::ClientNotInCluster) => {
                proto_append_entries_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: opt_index_as_u64(last_log_index),
                })
            }
            Err(AppendEntriesError::ServerIoError(e)) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: format!("Local IO failure: {:?}", e),
            }),
            Err(AppendEntriesError::ServerLogError(e)) => {
                proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message: format!("Local log failure: {}", e),
                })
            }
            Err(AppendEntriesError::ActorExited) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: Some(err) })),
        }
    }

    async fn handle_request_range(&self, rpc_request: ProtoRequestRangeReq) -> Result<ProtoRequestRangeResult, Status> {
        if !self.is_my_cluster(&rpc_request.cluster_id) {
            return Ok(range_error(proto_request_range_error::Err::ClientNotInCluster(
                ProtoClientNotInCluster {},
            )));
        }

        let from = Index::from_u64_opt(rpc_request.from_index)
            .ok_or_else(|| Status::invalid_argument("FromIndex must be non-0"))?;
        let to = Index::from_u64_opt(rpc_request.to_index)
            .filter(|to| *to >= from)
            .ok_or_else(|| Status::invalid_argument("ToIndex must be >= FromIndex"))?;
        let to = cmp::min(to, from.plus(MAX_RANGE_ENTRIES - 1));

        // Disk reads stay off the async workers.
        let log_reader = self.log_reader.clone();
        let read_result = tokio::task::spawn_blocking(move || log_reader.read_range(from, to))
            .await
            .map_err(|e| Status::internal(format!("Range read task failed: {:?}", e)))?;

        let rpc_reply = match read_result {
            Ok(entries) => ProtoRequestRangeResult {
                result: Some(proto_request_range_result::Result::Ok(ProtoRequestRangeSuccess {
                    first_index: from.as_u64(),
                    entries: entries.into_iter().map(entry_to_proto).collect(),
                })),
            },
            Err(LogError::Pruned { first_retained, .. }) => range_error(
                proto_request_range_error::Err::SnapshotRequired(ProtoSnapshotRequired {
                    first_retained_index: first_retained.as_u64(),
                }),
            ),
            Err(e) => {
                slog::warn!(self.logger, "Failed to serve range [{:?}, {:?}]: {}", from, to, e);
                range_error(proto_request_range_error::Err::ServerFault(ProtoServerFault {
                    message: e.to_string(),
                }))
            }
        };

        Ok(rpc_reply)
    }
}

fn range_error(err: proto_request_range_error::Err) -> ProtoRequestRangeResult {
    ProtoRequestRangeResult {
        result: Some(proto_request_range_result::Result::Err(ProtoRequestRangeError { err: Some(err) })),
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - AE from {} with {} entries",
            rpc_request.client_node_id,
            rpc_request.new_entries.len()
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn request_range(
        &self,
        rpc_request_wrapped: Request<ProtoRequestRangeReq>,
    ) -> Result<Response<ProtoRequestRangeResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_range(rpc_request).await;

        rpc_result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::commitlog::{InMemoryLog, Log};
    use crate::replica::EntryPayload;
    use bytes::Bytes;

    fn server_with_log(first_retained: u64, last: u64) -> (RpcServer, ActorClient) {
        let mut log = InMemoryLog::create().unwrap();
        for i in 1..=last {
            let entry = WriteAheadLogEntry {
                term: Term::new(1),
                payload: EntryPayload::Command(Bytes::from(format!("cmd-{}", i))),
            };
            log.append(Index::new(i), entry).unwrap();
        }
        if first_retained > 1 {
            log.prune(Index::new(first_retained - 1)).unwrap();
        }

        let (client, _rx) = ActorClient::new(1);
        let server = RpcServer::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            "cluster-1".to_string(),
            client.weak(),
            Arc::new(log.reader()),
        );
        (server, client)
    }

    fn range_req(cluster_id: &str, from_index: u64, to_index: u64) -> ProtoRequestRangeReq {
        ProtoRequestRangeReq {
            cluster_id: cluster_id.to_string(),
            from_index,
            to_index,
        }
    }

    #[tokio::test]
    async fn request_range_serves_entries_from_log() {
        // -- setup --
        let (server, _client) = server_with_log(1, 10);

        // -- execute --
        let reply = server.handle_request_range(range_req("cluster-1", 4, 6)).await.unwrap();

        // -- verify --
        match reply.result {
            Some(proto_request_range_result::Result::Ok(success)) => {
                assert_eq!(success.first_index, 4);
                let data: Vec<Vec<u8>> = success.entries.into_iter().map(|e| e.data).collect();
                assert_eq!(data, vec![b"cmd-4".to_vec(), b"cmd-5".to_vec(), b"cmd-6".to_vec()]);
            }
            other => panic!("Unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_range_below_retained_history_requires_snapshot() {
        // -- setup --
        let (server, _client) = server_with_log(5, 10);

        // -- execute --
        let reply = server.handle_request_range(range_req("cluster-1", 2, 6)).await.unwrap();

        // -- verify --
        match reply.result {
            Some(proto_request_range_result::Result::Err(ProtoRequestRangeError {
                err: Some(proto_request_range_error::Err::SnapshotRequired(required)),
            })) => assert!(required.first_retained_index > 2),
            other => panic!("Unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn requests_for_other_clusters_are_rejected() {
        // -- setup --
        let (server, _client) = server_with_log(1, 3);

        // -- execute --
        let range_reply = server.handle_request_range(range_req("cluster-2", 1, 3)).await.unwrap();
        let vote_reply = server
            .handle_request_vote(ProtoRequestVoteReq {
                cluster_id: "cluster-2".to_string(),
                client_node_id: "x".to_string(),
                term: 1,
                last_log_entry_term: 0,
                last_log_entry_index: 0,
            })
            .await
            .unwrap();

        // -- verify --
        assert!(matches!(
            range_reply.result,
            Some(proto_request_range_result::Result::Err(ProtoRequestRangeError {
                err: Some(proto_request_range_error::Err::ClientNotInCluster(_))
            }))
        ));
        assert!(matches!(
            vote_reply.result,
            Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::ClientNotInCluster(_))
            }))
        ));
    }

    #[test]
    fn inconsistent_previous_entry_metadata_is_invalid() {
        assert!(RpcServer::convert_log_entry_metadata(0, 0).unwrap().is_none());
        assert!(RpcServer::convert_log_entry_metadata(0, 3).is_err());
        assert!(RpcServer::convert_log_entry_metadata(3, 0).is_err());
        assert_eq!(
            RpcServer::convert_log_entry_metadata(2, 3).unwrap(),
            Some((Term::new(2), Index::new(3)))
        );
    }

    #[test]
    fn missing_log_error_carries_last_index() {
        let reply = RpcServer::convert_append_entries_result(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
            last_log_index: Some(Index::new(12)),
        }));

        assert!(matches!(
            reply.result,
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: 12
                }))
            }))
        ));
    }
}

use crate::actor::WeakActorClient;
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_request_vote_error, proto_request_vote_result,
    ProtoAppendEntriesResult, ProtoRequestVoteResult,
};
use crate::commitlog::Index;
use crate::replica::replica_api::{
    AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError,
    RequestVoteReplyFromPeer, RequestVoteResult,
};
use crate::replica::topology::TopologyService;
use crate::replica::transport::codec::{append_entries_to_proto, request_vote_to_proto};
use crate::replica::transport::monitor::{FailureMonitor, UnknownAddressMonitor};
use crate::replica::transport::{RaftMessage, RaftTransport};
use crate::replica::{MemberId, Term};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::error::Elapsed;
use tokio::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

const LOG_THROTTLE_WINDOW: Duration = Duration::from_secs(10);

/// gRPC implementation of `RaftTransport`. Each send resolves the target through the topology
/// service and runs the RPC on its own task; the reply is fed back to the replica actor.
pub(crate) struct Replicator {
    logger: slog::Logger,
    cluster_id: Option<String>,
    topology: Arc<dyn TopologyService>,
    actor_client: WeakActorClient,
    rpc_timeout: Duration,
    // Keyed by resolved address, never by member, so an address change takes effect on the next send.
    channels: Mutex<HashMap<SocketAddr, GrpcRaftClient<Channel>>>,
    unknown_address_monitor: UnknownAddressMonitor,
    failure_monitor: Arc<FailureMonitor>,
}

impl Replicator {
    pub(crate) fn new(
        logger: slog::Logger,
        topology: Arc<dyn TopologyService>,
        actor_client: WeakActorClient,
        rpc_timeout: Duration,
    ) -> Self {
        Replicator {
            logger,
            cluster_id: None,
            topology,
            actor_client,
            rpc_timeout,
            channels: Mutex::new(HashMap::new()),
            unknown_address_monitor: UnknownAddressMonitor::new(LOG_THROTTLE_WINDOW),
            failure_monitor: Arc::new(FailureMonitor::new(LOG_THROTTLE_WINDOW)),
        }
    }

    /// Messages are only sent once the replicator knows which cluster it speaks for.
    pub(crate) fn bind(&mut self, cluster_id: String) {
        self.cluster_id.replace(cluster_id);
    }

    fn client_for(&self, addr: SocketAddr) -> Result<GrpcRaftClient<Channel>, String> {
        let mut channels = self.channels.lock();
        if let Some(client) = channels.get(&addr) {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", addr)).map_err(|e| format!("{:?}", e))?;
        let channel = endpoint.connect_lazy().map_err(|e| format!("{:?}", e))?;
        let client = GrpcRaftClient::new(channel);
        channels.insert(addr, client.clone());

        Ok(client)
    }

    // An AppendEntries that never leaves this process still needs a reply, or the leader keeps
    // waiting on its outstanding request to that peer.
    fn fail_without_sending(&self, message: RaftMessage, reason: String) {
        if let RaftMessage::AppendEntries { descriptor, .. } = message {
            let actor_client = self.actor_client.clone();
            tokio::task::spawn(async move {
                let reply = AppendEntriesReplyFromPeer {
                    descriptor,
                    result: Err(AppendEntriesReplyFromPeerError::RetryableFailure(reason)),
                };
                let _ = actor_client.notify_append_entries_reply_from_peer(reply).await;
            });
        }
    }
}

impl RaftTransport for Replicator {
    fn send(&self, to: &MemberId, message: RaftMessage) {
        let cluster_id = match &self.cluster_id {
            Some(cluster_id) => cluster_id.clone(),
            None => {
                slog::warn!(self.logger, "Replicator is not bound to a cluster yet. Dropping {:?}", message);
                return self.fail_without_sending(message, "Replicator not bound".into());
            }
        };

        let addr = match self.topology.resolve(to) {
            Some(addr) => addr,
            None => {
                self.unknown_address_monitor
                    .log_attempt_to_send_to_unknown(&self.logger, to);
                return self.fail_without_sending(message, format!("No address for {:?}", to));
            }
        };

        let client = match self.client_for(addr) {
            Ok(client) => client,
            Err(e) => {
                self.failure_monitor.log_failure(&self.logger, addr, &e);
                return self.fail_without_sending(message, e);
            }
        };

        let logger = self.logger.new(slog::o!("Peer" => to.to_string()));
        let actor_client = self.actor_client.clone();
        let failure_monitor = self.failure_monitor.clone();
        let rpc_timeout = self.rpc_timeout;

        match message {
            RaftMessage::RequestVote(input) => {
                let request = request_vote_to_proto(&cluster_id, &input);
                let peer_id = to.clone();
                let term = input.candidate_term;
                tokio::task::spawn(async move {
                    let mut client = client;
                    slog::debug!(logger, "ClientWire - {:?}", request);
                    let rpc_reply = tokio::time::timeout(rpc_timeout, client.request_vote(request)).await;
                    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

                    let result = convert_request_vote_reply(rpc_reply);
                    if let RequestVoteResult::RetryableFailure = result {
                        failure_monitor.log_failure(&logger, addr, "RequestVote failed");
                    }
                    let reply = RequestVoteReplyFromPeer { peer_id, term, result };
                    let _ = actor_client.notify_request_vote_reply_from_peer(reply).await;
                });
            }
            RaftMessage::AppendEntries { input, descriptor } => {
                let request = append_entries_to_proto(&cluster_id, input);
                tokio::task::spawn(async move {
                    let mut client = client;
                    slog::debug!(logger, "ClientWire - AE seq-no {} with {} entries", descriptor.seq_no, request.new_entries.len());
                    let rpc_reply = tokio::time::timeout(rpc_timeout, client.append_entries(request)).await;
                    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

                    let result = convert_append_entries_reply(rpc_reply);
                    if let Err(AppendEntriesReplyFromPeerError::RetryableFailure(msg)) = &result {
                        failure_monitor.log_failure(&logger, addr, msg);
                    }
                    let reply = AppendEntriesReplyFromPeer { descriptor, result };
                    let _ = actor_client.notify_append_entries_reply_from_peer(reply).await;
                });
            }
        }
    }
}

fn convert_request_vote_reply(
    rpc_reply: Result<Result<tonic::Response<ProtoRequestVoteResult>, Status>, Elapsed>,
) -> RequestVoteResult {
    match rpc_reply {
        Ok(Ok(rpc_result)) => match rpc_result.into_inner().result {
            Some(proto_request_vote_result::Result::Ok(success)) => {
                if success.vote_granted {
                    RequestVoteResult::VoteGranted
                } else {
                    RequestVoteResult::VoteNotGranted
                }
            }
            Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                Some(proto_request_vote_error::Err::StaleTerm(payload)) => RequestVoteResult::StaleTerm {
                    new_term: Term::new(payload.current_term),
                },
                Some(proto_request_vote_error::Err::ServerFault(_)) => RequestVoteResult::RetryableFailure,
                // Peer doesn't know us. It won't vote for us either.
                Some(proto_request_vote_error::Err::ClientNotInCluster(_)) => RequestVoteResult::VoteNotGranted,
                None => RequestVoteResult::MalformedReply,
            },
            None => RequestVoteResult::MalformedReply,
        },
        Ok(Err(_)) | Err(_) => RequestVoteResult::RetryableFailure,
    }
}

fn convert_append_entries_reply(
    rpc_reply: Result<Result<tonic::Response<ProtoAppendEntriesResult>, Status>, Elapsed>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    match rpc_reply {
        Ok(Ok(rpc_result)) => match rpc_result.into_inner().result {
            Some(proto_append_entries_result::Result::Ok(_)) => Ok(()),
            Some(proto_append_entries_result::Result::Err(err)) => match err.err {
                Some(proto_append_entries_error::Err::ServerFault(payload)) => Err(
                    AppendEntriesReplyFromPeerError::RetryableFailure(format!("Explicit server fault: {}", payload.message)),
                ),
                Some(proto_append_entries_error::Err::StaleTerm(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    })
                }
                Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                        last_log_index: Index::from_u64_opt(payload.last_log_entry_index),
                    })
                }
                Some(proto_append_entries_error::Err::ClientNotInCluster(_)) => {
                    // Retry in case peer is out of date. Not expecting this in practice.
                    Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                        "Peer doesn't think we're in the cluster".into(),
                    ))
                }
                None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Malformed AppendEntries Err".into(),
                )),
            },
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Malformed AppendEntries Result".into(),
            )),
        },
        Ok(Err(rpc_status)) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(format!(
            "Un-modeled failure from AppendEntries RPC call: {:?}",
            rpc_status
        ))),
        Err(_timeout) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
            "Timed out calling AppendEntries".into(),
        )),
    }
}

use crate::actor::ActorClient;
use crate::api::types::{RaftEntryId, RaftLeaderInfo};
use crate::commitlog::LogError;
use crate::replica;
use crate::server::RpcServerShutdownHandle;
use bytes::Bytes;
use std::sync::Arc;

/// ReplicatedLog is the replicated log for external application to append to. Dropping every
/// clone shuts down the local replica and its gRPC server.
#[derive(Clone)]
pub struct RaftReplicatedLog {
    actor_client: ActorClient,
    _server_shutdown_handle: Arc<RpcServerShutdownHandle>,
}

impl RaftReplicatedLog {
    pub(crate) fn new(actor_client: ActorClient, server_shutdown_handle: RpcServerShutdownHandle) -> Self {
        RaftReplicatedLog {
            actor_client,
            _server_shutdown_handle: Arc::new(server_shutdown_handle),
        }
    }

    /// Appends to the leader's log and starts replication. Success means the entry is durable
    /// locally, not that it's committed; watch the commit stream for that.
    pub async fn enqueue_entry(&self, input: EnqueueEntryInput) -> Result<EnqueueEntryOutput, EnqueueEntryError> {
        let replica_input = replica::EnqueueForReplicationInput { data: input.data };

        self.actor_client
            .enqueue_for_replication(replica_input)
            .await
            .map(|o| o.into())
            .map_err(|e| e.into())
    }
}

#[derive(Debug)]
pub struct EnqueueEntryInput {
    pub data: Bytes,
}

#[derive(Debug)]
pub struct EnqueueEntryOutput {
    pub entry_id: RaftEntryId,
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueEntryError {
    #[error("I'm not leader. Leader is {0:?}")]
    LeaderRedirect(RaftLeaderInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    // Leader is partitioned from a majority. Retry later or against another member.
    #[error("Leader can't reach a majority of the cluster")]
    QuorumUnavailable,

    #[error("Local log is faulted until a leader repairs it: {0}")]
    IntegrityFault(String),

    #[error("Failed to persist log: {0}")]
    LocalIoError(#[source] LogError),

    // Replica logic runs on a background task. This error is returned if the task has exited.
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- Conversions --------

impl From<replica::EnqueueForReplicationOutput> for EnqueueEntryOutput {
    fn from(internal_output: replica::EnqueueForReplicationOutput) -> Self {
        EnqueueEntryOutput {
            entry_id: RaftEntryId {
                term: internal_output.enqueued_term,
                entry_index: internal_output.enqueued_index,
            },
        }
    }
}

impl From<replica::EnqueueForReplicationError> for EnqueueEntryError {
    fn from(internal_error: replica::EnqueueForReplicationError) -> Self {
        match internal_error {
            replica::EnqueueForReplicationError::LeaderRedirect { leader_id, leader_addr } => {
                EnqueueEntryError::LeaderRedirect(RaftLeaderInfo::new(leader_id, leader_addr))
            }
            replica::EnqueueForReplicationError::NoLeader => EnqueueEntryError::NoLeader,
            replica::EnqueueForReplicationError::QuorumUnavailable => EnqueueEntryError::QuorumUnavailable,
            replica::EnqueueForReplicationError::IntegrityFault(reason) => EnqueueEntryError::IntegrityFault(reason),
            replica::EnqueueForReplicationError::LocalIoError(e) => EnqueueEntryError::LocalIoError(e),
            replica::EnqueueForReplicationError::ActorExited => EnqueueEntryError::ReplicaExited,
        }
    }
}

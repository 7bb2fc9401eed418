use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftClient;
use crate::api::options::RaftOptionsValidated;
use crate::api::types::RaftMemberInfo;
use crate::commitlog::{InMemoryLog, Log, LogError, SegmentedDiskLog, StorageConfig};
use crate::replica::{
    ClusterTracker, FileLocalState, MemberId, PersistentLocalState, ReplicaConfig, Replicator, RetentionPolicy,
    StaticTopology, TopologyService, VolatileLocalState, WriteAheadLogEntry,
};
use crate::pipeline::LocalCatchUp;
use crate::server::{RpcServer, SharedLogReader};
use crate::{replica, server, RaftCommitStream};
use crate::{RaftEventListener, RaftOptions, RaftReplicatedLog};
use std::convert::TryFrom;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const REPLICATED_LOG_DIR_NAME: &str = "replicated-log";

pub struct RaftClientConfig {
    pub my_member_id: String,
    /// Members of different clusters refuse to talk to each other.
    pub cluster_id: String,
    pub cluster_members: Vec<RaftMemberInfo>,
    /// Where the replicated log and the term/vote metadata live. `None` keeps everything in
    /// memory, which is only useful for tests and demos.
    pub log_directory: Option<PathBuf>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
    /// Resolves members to addresses when replicating. Defaults to the addresses in
    /// `cluster_members`.
    pub topology: Option<Arc<dyn TopologyService>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Invalid cluster info")]
    InvalidClusterInfo(#[source] Box<dyn Error + Send + Sync>),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("Log initialization failure")]
    LogInitialization(#[source] LogError),
    #[error("Failed to load persisted term and vote")]
    LocalStateInitialization(#[source] io::Error),
    // We will need to relax this later when adding membership changes.
    #[error("my member ID not in cluster config")]
    MeNotInCluster,
}

/// Starts a local raft member: the replica actor, its outbound replicator and the inbound gRPC
/// server. Must be called from within a tokio runtime.
pub async fn try_create_raft_client(config: RaftClientConfig) -> Result<RaftClient, RaftClientCreationError> {
    let options = RaftOptionsValidated::try_from(config.options.clone())
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;

    let my_member_id = MemberId::new(config.my_member_id.clone());

    match config.log_directory.clone() {
        None => {
            let commit_log = InMemoryLog::create().map_err(RaftClientCreationError::LogInitialization)?;
            let local_state = VolatileLocalState::new(my_member_id);

            start_member(config, options, commit_log, Box::new(local_state))
        }
        Some(directory) => {
            let commit_log = SegmentedDiskLog::open(
                StorageConfig {
                    directory: directory.join(REPLICATED_LOG_DIR_NAME),
                    max_segment_bytes: options.max_segment_bytes,
                    max_segment_entries: options.max_segment_entries,
                },
                config.info_logger.clone(),
            )
            .map_err(RaftClientCreationError::LogInitialization)?;
            let local_state = FileLocalState::open(&directory, my_member_id)
                .map_err(RaftClientCreationError::LocalStateInitialization)?;

            start_member(config, options, commit_log, Box::new(local_state))
        }
    }
}

fn start_member<L>(
    config: RaftClientConfig,
    options: RaftOptionsValidated,
    commit_log: L,
    local_state: Box<dyn PersistentLocalState>,
) -> Result<RaftClient, RaftClientCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
{
    let root_logger = config.info_logger;

    let my_server_addr = my_info(&config.my_member_id, &config.cluster_members)
        .map(|info| info.address)
        .ok_or(RaftClientCreationError::MeNotInCluster)?;

    let cluster_tracker = ClusterTracker::create_valid(
        MemberId::new(config.my_member_id),
        config
            .cluster_members
            .iter()
            .map(|info| MemberId::new(info.member_id.clone()))
            .collect(),
    )
    .map_err(|e| RaftClientCreationError::InvalidClusterInfo(e.into()))?;

    let cluster_members = config.cluster_members;
    let topology: Arc<dyn TopologyService> = match config.topology {
        Some(topology) => topology,
        None => Arc::new(StaticTopology::new(
            cluster_members
                .into_iter()
                .map(|info| (MemberId::new(info.member_id), info.address)),
        )),
    };

    // Grab a reader before the log moves into the replica, so the server can serve catch-up ranges.
    let log_reader: SharedLogReader = Arc::new(commit_log.reader());

    let (actor_client, actor_queue_rx) = ActorClient::new(64);

    let mut replicator = Replicator::new(
        root_logger.clone(),
        topology.clone(),
        actor_client.weak(),
        options.leader_append_entries_timeout,
    );
    replicator.bind(config.cluster_id.clone());

    let (replica, replica_commit_stream, election_state_change_listener) = replica::create_replica(
        root_logger.clone(),
        ReplicaConfig {
            cluster_tracker,
            topology,
            local_state,
            leader_heartbeat_duration: options.leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout,
            follower_max_timeout: options.follower_max_timeout,
            max_append_entries_batch: options.max_append_entries_batch,
            retention: RetentionPolicy {
                min_retained_entries: options.min_retained_entries,
                max_retained_entries: options.max_retained_entries,
            },
        },
        commit_log,
        Box::new(replicator),
        actor_client.weak(),
    )
    .map_err(RaftClientCreationError::LogInitialization)?;

    let replica_actor = ReplicaActor::new(root_logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    let (server_shutdown_handle, server_shutdown_signal) = server::shutdown_signal();
    let local_catch_up = LocalCatchUp::new(log_reader.clone());
    let replica_raft_server = RpcServer::new(root_logger, config.cluster_id, actor_client.weak(), log_reader);
    tokio::spawn(replica_raft_server.run(my_server_addr, server_shutdown_signal));

    let replicated_log = RaftReplicatedLog::new(actor_client, server_shutdown_handle);
    let commit_stream = RaftCommitStream::new(replica_commit_stream);
    let event_listener = RaftEventListener::new(election_state_change_listener);

    Ok(RaftClient {
        replicated_log,
        commit_stream,
        event_listener,
        local_catch_up,
    })
}

fn my_info<'a>(my_member_id: &str, cluster_members: &'a [RaftMemberInfo]) -> Option<&'a RaftMemberInfo> {
    cluster_members.iter().find(|member_info| member_info.member_id == my_member_id)
}


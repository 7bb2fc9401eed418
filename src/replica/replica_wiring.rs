use crate::actor::WeakActorClient;
use crate::commitlog::{Log, LogError};
use crate::replica::election::{ElectionConfig, ElectionState};
use crate::replica::peers::ClusterTracker;
use crate::replica::transport::RaftTransport;
use crate::replica::{
    write_ahead_log, CommitStream, ElectionStateChangeListener, PersistentLocalState, Replica, RetentionPolicy,
    TopologyService, WriteAheadLogEntry,
};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ReplicaConfig {
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) topology: Arc<dyn TopologyService>,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) max_append_entries_batch: u64,
    pub(crate) retention: RetentionPolicy,
}

/// Assembles a replica from its parts. Must run inside a tokio runtime, since the initial
/// follower timer is spawned right away.
pub(crate) fn create_replica<L>(
    logger: slog::Logger,
    config: ReplicaConfig,
    commit_log: L,
    transport: Box<dyn RaftTransport>,
    actor_client: WeakActorClient,
) -> Result<(Replica<L>, CommitStream, ElectionStateChangeListener), LogError>
where
    L: Log<WriteAheadLogEntry>,
{
    let my_member_id = config.cluster_tracker.my_member_id().clone();
    let persisted_commit_index = config.local_state.commit_index();

    let (write_ahead_log, commit_stream) =
        write_ahead_log::wired(logger.clone(), commit_log, config.retention, persisted_commit_index)?;

    let (election_state, election_state_change_listener) = ElectionState::new_follower(
        ElectionConfig {
            my_member_id,
            leader_heartbeat_duration: config.leader_heartbeat_duration,
            follower_min_timeout: config.follower_min_timeout,
            follower_max_timeout: config.follower_max_timeout,
        },
        actor_client,
    );

    let replica = Replica::new(
        logger,
        config.cluster_tracker,
        config.topology,
        config.local_state,
        election_state,
        write_ahead_log,
        transport,
        config.max_append_entries_batch,
        // Leader stays writable while a majority answered within one minimum election timeout.
        config.follower_min_timeout,
    );

    Ok((replica, commit_stream, election_state_change_listener))
}

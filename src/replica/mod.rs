mod election;
mod local_state;
mod peers;
#[allow(clippy::module_inception)]
mod replica;
mod replica_api;
mod replica_wiring;
mod topology;
mod transport;
mod write_ahead_log;

#[cfg(test)]
mod cluster_tests;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use peers::ClusterTracker;
pub(crate) use peers::ClusterTrackerError;
pub use peers::MemberId;
pub(crate) use replica::Replica;
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaConfig;
pub use topology::StaticTopology;
pub use topology::TopologyService;
pub(crate) use transport::entry_from_proto;
pub(crate) use transport::entry_to_proto;
pub(crate) use transport::RaftMessage;
pub(crate) use transport::RaftTransport;
pub(crate) use transport::Replicator;
pub(crate) use write_ahead_log::CommitStream;
pub(crate) use write_ahead_log::CommittedEntry;
pub use write_ahead_log::EntryPayload;
pub(crate) use write_ahead_log::RetentionPolicy;
pub use write_ahead_log::WriteAheadLogEntry;

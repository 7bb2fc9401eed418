mod actor;
mod api;
mod commitlog;
mod pipeline;
mod replica;
mod server;
mod state_machines;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::try_create_raft_client;
pub use api::EnqueueEntryError;
pub use api::EnqueueEntryInput;
pub use api::EnqueueEntryOutput;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftCommitStream;
pub use api::RaftCommittedEntry;
pub use api::RaftElectionState;
pub use api::RaftEntryId;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftOptions;
pub use api::RaftReplicatedLog;

pub use commitlog::Entry;
pub use commitlog::EntryDecodeError;
pub use commitlog::InMemoryLog;
pub use commitlog::Index;
pub use commitlog::Log;
pub use commitlog::LogError;
pub use commitlog::LogReader;
pub use commitlog::SegmentedDiskLog;
pub use commitlog::StorageConfig;

pub use replica::EntryPayload;
pub use replica::MemberId;
pub use replica::StaticTopology;
pub use replica::Term;
pub use replica::TopologyService;
pub use replica::WriteAheadLogEntry;

pub use pipeline::BatchingApplier;
pub use pipeline::CatchUpError;
pub use pipeline::CatchUpSource;
pub use pipeline::CommitMode;
pub use pipeline::CommitPipeline;
pub use pipeline::CommitPipelineHandle;
pub use pipeline::CommittedEntries;
pub use pipeline::LocalCatchUp;
pub use pipeline::PipelineConfig;
pub use pipeline::PipelineError;
pub use pipeline::QueueOutcome;
pub use pipeline::RemoteCatchUp;
pub use pipeline::ShutdownPolicy;
pub use pipeline::TransactionCommitProcess;
pub use pipeline::TransactionToApply;
pub use pipeline::TxId;

pub use state_machines::AllocationOutcome;
pub use state_machines::ApplyError;
pub use state_machines::CommandDecodeError;
pub use state_machines::CommittedTransaction;
pub use state_machines::DistributedOperation;
pub use state_machines::GlobalSession;
pub use state_machines::IdAllocationRequest;
pub use state_machines::IdType;
pub use state_machines::InMemoryTransactionStore;
pub use state_machines::ReplicatedCommand;
pub use state_machines::ReplicatedIdAllocationStateMachine;
pub use state_machines::ReplicatedStateMachine;
pub use state_machines::ReplicatedStateMachines;
pub use state_machines::ReplicatedTokenStateMachine;
pub use state_machines::SessionIdAllocator;
pub use state_machines::StateMachinesSnapshot;
pub use state_machines::TokenRequest;
pub use state_machines::TokenType;
pub use state_machines::TransactionStore;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.

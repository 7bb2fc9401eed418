//! Deterministic state machines fed by the commit pipeline, and the command format they share.
mod command;
mod dispatcher;
mod id_allocation;
mod session;
mod snapshot;
mod state_machine;
mod store;
mod token;

pub use command::CommandDecodeError;
pub use command::DistributedOperation;
pub use command::GlobalSession;
pub use command::IdType;
pub use command::ReplicatedCommand;
pub use command::TokenType;
pub use dispatcher::ReplicatedStateMachines;
pub use id_allocation::AllocationOutcome;
pub use id_allocation::IdAllocationRequest;
pub use id_allocation::ReplicatedIdAllocationStateMachine;
pub use session::SessionIdAllocator;
pub use snapshot::StateMachinesSnapshot;
pub use state_machine::ApplyError;
pub use state_machine::ReplicatedStateMachine;
pub use store::CommittedTransaction;
pub use store::InMemoryTransactionStore;
pub use store::TransactionStore;
pub use token::ReplicatedTokenStateMachine;
pub use token::TokenRequest;

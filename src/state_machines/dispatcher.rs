use crate::pipeline::{CommitMode, TransactionCommitProcess, TransactionToApply, TxId};
use crate::replica::EntryPayload;
use crate::state_machines::command::ReplicatedCommand;
use crate::state_machines::id_allocation::{IdAllocationRequest, ReplicatedIdAllocationStateMachine};
use crate::state_machines::snapshot::StateMachinesSnapshot;
use crate::state_machines::state_machine::{ApplyError, ReplicatedStateMachine};
use crate::state_machines::store::TransactionStore;
use crate::state_machines::token::{ReplicatedTokenStateMachine, TokenRequest};
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp;
use std::sync::Arc;

/// Routes committed entries to the state machine that owns them. Transactions go to the external
/// store. Token and id allocation state is kept in memory, and a snapshot of it is committed to the
/// store with every batch, so a restarted member resumes from the store's position.
pub struct ReplicatedStateMachines<S: TransactionStore> {
    logger: slog::Logger,
    tokens: Arc<RwLock<ReplicatedTokenStateMachine>>,
    id_allocation: Arc<RwLock<ReplicatedIdAllocationStateMachine>>,
    store: S,
    last_applied_index: u64,
}

enum Routed {
    Token(TokenRequest),
    IdAllocation(IdAllocationRequest),
    Transaction(Bytes),
    Barrier,
}

impl<S: TransactionStore> ReplicatedStateMachines<S> {
    /// Restores token and id allocation state from the snapshot last committed to `store`.
    pub fn new(logger: slog::Logger, store: S) -> Result<Self, ApplyError> {
        let store_index = store.last_committed_index();
        let snapshot = match store.state_machines() {
            Some(encoded) => StateMachinesSnapshot::decode(encoded).map_err(ApplyError::Restore)?,
            None => StateMachinesSnapshot::default(),
        };
        if snapshot.last_applied_index != store_index {
            return Err(ApplyError::SnapshotMismatch {
                snapshot_index: snapshot.last_applied_index,
                store_index,
            });
        }
        if store_index > 0 {
            slog::info!(logger, "Restored state machines at index {}", store_index);
        }

        Ok(ReplicatedStateMachines {
            tokens: Arc::new(RwLock::new(ReplicatedTokenStateMachine::restore(
                logger.new(slog::o!("StateMachine" => "tokens")),
                store_index,
                &snapshot.tokens,
            ))),
            id_allocation: Arc::new(RwLock::new(ReplicatedIdAllocationStateMachine::restore(
                logger.new(slog::o!("StateMachine" => "id-allocation")),
                store_index,
                &snapshot.first_unallocated,
            ))),
            logger,
            store,
            last_applied_index: store_index,
        })
    }

    /// Read access to the token state, for lookups while the pipeline keeps applying.
    pub fn tokens(&self) -> Arc<RwLock<ReplicatedTokenStateMachine>> {
        self.tokens.clone()
    }

    pub fn id_allocation(&self) -> Arc<RwLock<ReplicatedIdAllocationStateMachine>> {
        self.id_allocation.clone()
    }

    fn route(entry: &TransactionToApply) -> Result<Routed, ApplyError> {
        let data = match &entry.payload {
            EntryPayload::LeaderBarrier => return Ok(Routed::Barrier),
            EntryPayload::Command(data) => data.clone(),
        };

        let command = ReplicatedCommand::decode(data).map_err(|source| ApplyError::Decode {
            index: entry.index,
            source,
        })?;

        let routed = match command {
            ReplicatedCommand::TokenRequest { token_type, name, .. } => {
                Routed::Token(TokenRequest { token_type, name })
            }
            ReplicatedCommand::IdAllocationRequest {
                id_type,
                range_start,
                range_length,
                ..
            } => Routed::IdAllocation(IdAllocationRequest {
                id_type,
                range_start,
                range_length,
            }),
            ReplicatedCommand::Transaction { representation, .. } => Routed::Transaction(representation),
        };

        Ok(routed)
    }
}

impl<S: TransactionStore> TransactionCommitProcess for ReplicatedStateMachines<S> {
    fn last_committed_index(&self) -> u64 {
        self.store.last_committed_index()
    }

    fn commit(&mut self, batch: &[TransactionToApply], mode: CommitMode) -> Result<TxId, ApplyError> {
        let (first, last) = match (batch.first(), batch.last()) {
            (Some(first), Some(last)) => (first.index, last.index),
            _ => return Ok(0),
        };
        if first > self.last_applied_index + 1 {
            return Err(ApplyError::OutOfOrder {
                index: first,
                last_applied: self.last_applied_index,
            });
        }
        slog::debug!(self.logger, "Applying [{}, {}] ({:?})", first, last, mode);

        // Decode everything up front so a bad entry leaves every state machine untouched.
        let routed = batch
            .iter()
            .filter(|entry| entry.index > self.last_applied_index)
            .map(|entry| Self::route(entry).map(|routed| (entry.index, routed)))
            .collect::<Result<Vec<_>, _>>()?;

        // Applied to copies, published only once the store has taken the batch.
        let mut tokens = self.tokens.read().clone();
        let mut id_allocation = self.id_allocation.read().clone();
        let mut transactions = Vec::new();
        for (index, routed) in routed {
            match routed {
                Routed::Token(request) => tokens.apply(index, request)?,
                Routed::IdAllocation(request) => id_allocation.apply(index, request)?,
                Routed::Transaction(representation) => transactions.push((index, representation)),
                Routed::Barrier => {}
            }
        }

        let through_index = cmp::max(self.last_applied_index, last);
        let snapshot = StateMachinesSnapshot {
            last_applied_index: through_index,
            tokens: tokens.export(),
            first_unallocated: id_allocation.export(),
        };
        let tx_id = self.store.commit(&transactions, through_index, snapshot.encode())?;

        *self.tokens.write() = tokens;
        *self.id_allocation.write() = id_allocation;
        self.last_applied_index = through_index;

        Ok(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machines::command::{DistributedOperation, GlobalSession, IdType, TokenType};
    use crate::state_machines::store::InMemoryTransactionStore;
    use crate::state_machines::AllocationOutcome;

    fn operation(local_operation_id: u64) -> DistributedOperation {
        DistributedOperation {
            global_session: GlobalSession {
                session_id: 1,
                owner_id: 1,
            },
            local_operation_id,
        }
    }

    fn command(index: u64, command: ReplicatedCommand) -> TransactionToApply {
        TransactionToApply {
            index,
            payload: EntryPayload::Command(command.encode()),
        }
    }

    fn barrier(index: u64) -> TransactionToApply {
        TransactionToApply {
            index,
            payload: EntryPayload::LeaderBarrier,
        }
    }

    #[test]
    fn batch_entries_reach_their_state_machines() {
        // -- setup --
        let store = InMemoryTransactionStore::new();
        let mut machines = ReplicatedStateMachines::new(slog::Logger::root(slog::Discard, slog::o!()), store.clone()).unwrap();

        let batch = vec![
            barrier(1),
            command(
                2,
                ReplicatedCommand::TokenRequest {
                    operation: operation(0),
                    token_type: TokenType::Label,
                    name: "Person".into(),
                },
            ),
            command(
                3,
                ReplicatedCommand::IdAllocationRequest {
                    operation: operation(1),
                    id_type: IdType::Node,
                    range_start: 0,
                    range_length: 64,
                },
            ),
            command(
                4,
                ReplicatedCommand::Transaction {
                    operation: operation(2),
                    representation: Bytes::from_static(b"CREATE (:Person)"),
                },
            ),
        ];

        // -- execute --
        let tx_id = machines.commit(&batch, CommitMode::External).unwrap();

        // -- verify --
        assert_eq!(tx_id, 1);
        assert_eq!(machines.tokens().read().token_id(TokenType::Label, "Person"), Some(0));
        assert_eq!(
            machines.id_allocation().read().last_outcome(),
            Some((3, AllocationOutcome::Granted))
        );
        assert_eq!(store.transactions()[0].index, 4);
        assert_eq!(machines.last_committed_index(), 4);
    }

    #[test]
    fn undecodable_entry_fails_the_whole_batch() {
        // -- setup --
        let store = InMemoryTransactionStore::new();
        let mut machines = ReplicatedStateMachines::new(slog::Logger::root(slog::Discard, slog::o!()), store.clone()).unwrap();

        let batch = vec![
            command(
                1,
                ReplicatedCommand::TokenRequest {
                    operation: operation(0),
                    token_type: TokenType::Label,
                    name: "Person".into(),
                },
            ),
            TransactionToApply {
                index: 2,
                payload: EntryPayload::Command(Bytes::from_static(b"garbage")),
            },
        ];

        // -- execute --
        let result = machines.commit(&batch, CommitMode::External);

        // -- verify --
        assert!(matches!(result, Err(ApplyError::Decode { index: 2, .. })));
        assert_eq!(machines.tokens().read().token_id(TokenType::Label, "Person"), None);
        assert_eq!(machines.last_committed_index(), 0);
    }

    #[test]
    fn batch_after_a_hole_is_refused() {
        let mut machines =
            ReplicatedStateMachines::new(slog::Logger::root(slog::Discard, slog::o!()), InMemoryTransactionStore::new())
                .unwrap();

        let result = machines.commit(&[barrier(3)], CommitMode::External);

        assert!(matches!(
            result,
            Err(ApplyError::OutOfOrder {
                index: 3,
                last_applied: 0
            })
        ));
    }

    /// Refuses every batch.
    struct BrokenStore;

    impl TransactionStore for BrokenStore {
        fn last_committed_index(&self) -> u64 {
            0
        }

        fn state_machines(&self) -> Option<Bytes> {
            None
        }

        fn commit(&mut self, _: &[(u64, Bytes)], through_index: u64, _: Bytes) -> Result<TxId, ApplyError> {
            Err(ApplyError::Store {
                index: through_index,
                reason: "disk full".into(),
            })
        }
    }

    fn token(index: u64, name: &str) -> TransactionToApply {
        command(
            index,
            ReplicatedCommand::TokenRequest {
                operation: operation(index),
                token_type: TokenType::Label,
                name: name.into(),
            },
        )
    }

    #[test]
    fn restarted_machines_resume_from_the_store() {
        // -- setup --
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let store = InMemoryTransactionStore::new();
        let mut machines = ReplicatedStateMachines::new(logger.clone(), store.clone()).unwrap();
        let batch = vec![
            token(1, "Person"),
            command(
                2,
                ReplicatedCommand::IdAllocationRequest {
                    operation: operation(2),
                    id_type: IdType::Node,
                    range_start: 0,
                    range_length: 64,
                },
            ),
            token(3, "City"),
        ];
        machines.commit(&batch, CommitMode::External).unwrap();
        drop(machines);

        // -- execute --
        let mut restarted = ReplicatedStateMachines::new(logger, store.clone()).unwrap();
        restarted.commit(&[token(4, "Movie")], CommitMode::External).unwrap();

        // -- verify --
        let tokens = restarted.tokens();
        assert_eq!(tokens.read().token_id(TokenType::Label, "City"), Some(1));
        assert_eq!(tokens.read().token_id(TokenType::Label, "Movie"), Some(2));
        assert_eq!(restarted.id_allocation().read().first_unallocated(IdType::Node), 64);
        assert_eq!(restarted.last_committed_index(), 4);
    }

    #[test]
    fn store_failure_leaves_state_machines_untouched() {
        // -- setup --
        let mut machines = ReplicatedStateMachines::new(slog::Logger::root(slog::Discard, slog::o!()), BrokenStore).unwrap();

        // -- execute --
        let result = machines.commit(&[token(1, "Person")], CommitMode::External);

        // -- verify --
        assert!(matches!(result, Err(ApplyError::Store { index: 1, .. })));
        assert_eq!(machines.tokens().read().token_id(TokenType::Label, "Person"), None);
        assert_eq!(machines.tokens().read().last_applied_index(), 0);
        assert_eq!(machines.last_committed_index(), 0);
    }

    #[test]
    fn unreadable_snapshot_refuses_to_start() {
        // -- setup --
        let mut store = InMemoryTransactionStore::new();
        store.commit(&[], 5, Bytes::from_static(b"junk")).unwrap();

        // -- execute --
        let result = ReplicatedStateMachines::new(slog::Logger::root(slog::Discard, slog::o!()), store);

        // -- verify --
        assert!(matches!(result, Err(ApplyError::Restore(_))));
    }
}

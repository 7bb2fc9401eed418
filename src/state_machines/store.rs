use crate::pipeline::TxId;
use crate::state_machines::ApplyError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// The store that finally receives replicated transactions, in log order.
pub trait TransactionStore: Send {
    /// Highest log index the store has durably recorded, transactions or not.
    fn last_committed_index(&self) -> u64;

    /// Encoded `StateMachinesSnapshot` recorded with `last_committed_index()`. `None` for a store
    /// that has never committed.
    fn state_machines(&self) -> Option<Bytes>;

    /// Records `transactions` (each tagged with its log index), the encoded state machine snapshot
    /// and the store's new position `through_index`, atomically. Transactions at or below the
    /// current position are skipped.
    fn commit(
        &mut self,
        transactions: &[(u64, Bytes)],
        through_index: u64,
        state_machines: Bytes,
    ) -> Result<TxId, ApplyError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommittedTransaction {
    pub tx_id: TxId,
    pub index: u64,
    pub representation: Bytes,
}

/// Keeps transactions in memory. Clones share the same contents, so a test can keep one handle
/// and give the other to the pipeline.
#[derive(Clone, Default)]
pub struct InMemoryTransactionStore {
    inner: Arc<Mutex<InMemoryStoreInner>>,
}

#[derive(Default)]
struct InMemoryStoreInner {
    transactions: Vec<CommittedTransaction>,
    last_committed_index: u64,
    last_tx_id: TxId,
    state_machines: Option<Bytes>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> Vec<CommittedTransaction> {
        self.inner.lock().transactions.clone()
    }

    pub fn last_tx_id(&self) -> TxId {
        self.inner.lock().last_tx_id
    }
}

impl TransactionStore for InMemoryTransactionStore {
    fn last_committed_index(&self) -> u64 {
        self.inner.lock().last_committed_index
    }

    fn state_machines(&self) -> Option<Bytes> {
        self.inner.lock().state_machines.clone()
    }

    fn commit(
        &mut self,
        transactions: &[(u64, Bytes)],
        through_index: u64,
        state_machines: Bytes,
    ) -> Result<TxId, ApplyError> {
        let mut inner = self.inner.lock();
        if through_index < inner.last_committed_index {
            return Ok(inner.last_tx_id);
        }

        let mut next_tx_id = inner.last_tx_id;
        let mut staged = Vec::with_capacity(transactions.len());
        for (index, representation) in transactions {
            if *index <= inner.last_committed_index {
                continue;
            }
            if *index > through_index {
                return Err(ApplyError::Store {
                    index: *index,
                    reason: format!("Transaction beyond batch end {}", through_index),
                });
            }
            next_tx_id += 1;
            staged.push(CommittedTransaction {
                tx_id: next_tx_id,
                index: *index,
                representation: representation.clone(),
            });
        }

        inner.transactions.extend(staged);
        inner.last_tx_id = next_tx_id;
        inner.last_committed_index = through_index;
        inner.state_machines = Some(state_machines);

        Ok(next_tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replayed_transactions_are_skipped() {
        // -- setup --
        let mut store = InMemoryTransactionStore::new();
        store
            .commit(
                &[(1, Bytes::from_static(b"a")), (3, Bytes::from_static(b"b"))],
                3,
                Bytes::from_static(b"s3"),
            )
            .unwrap();

        // -- execute --
        let tx_id = store
            .commit(
                &[(3, Bytes::from_static(b"b")), (4, Bytes::from_static(b"c"))],
                5,
                Bytes::from_static(b"s5"),
            )
            .unwrap();

        // -- verify --
        assert_eq!(tx_id, 3);
        assert_eq!(store.last_committed_index(), 5);
        let indexes: Vec<u64> = store.transactions().iter().map(|tx| tx.index).collect();
        assert_eq!(indexes, vec![1, 3, 4]);
        assert_eq!(store.state_machines(), Some(Bytes::from_static(b"s5")));
    }

    #[test]
    fn batch_is_rejected_whole() {
        // -- setup --
        let mut store = InMemoryTransactionStore::new();

        // -- execute --
        let result = store.commit(
            &[(1, Bytes::from_static(b"a")), (9, Bytes::from_static(b"b"))],
            2,
            Bytes::from_static(b"s2"),
        );

        // -- verify --
        assert!(matches!(result, Err(ApplyError::Store { index: 9, .. })));
        assert!(store.transactions().is_empty());
        assert_eq!(store.last_committed_index(), 0);
        assert_eq!(store.state_machines(), None);
    }
}

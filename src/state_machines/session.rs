use crate::state_machines::command::{DistributedOperation, GlobalSession};
use std::sync::atomic::{AtomicU64, Ordering};

impl GlobalSession {
    /// A fresh session for `owner_id`. Session ids are random so that a restarted member never
    /// reuses the operation ids of its previous incarnation.
    pub fn random(owner_id: u64) -> Self {
        GlobalSession {
            session_id: rand::random(),
            owner_id,
        }
    }
}

/// Hands out operation ids within one cluster session. Each member owns one and passes it to
/// whatever submits commands; ids are never shared across sessions.
#[derive(Debug)]
pub struct SessionIdAllocator {
    global_session: GlobalSession,
    next_local_operation_id: AtomicU64,
}

impl SessionIdAllocator {
    pub fn new(global_session: GlobalSession) -> Self {
        Self::starting_at(global_session, 0)
    }

    pub fn starting_at(global_session: GlobalSession, first_local_operation_id: u64) -> Self {
        SessionIdAllocator {
            global_session,
            next_local_operation_id: AtomicU64::new(first_local_operation_id),
        }
    }

    pub fn global_session(&self) -> GlobalSession {
        self.global_session
    }

    pub fn next_operation(&self) -> DistributedOperation {
        DistributedOperation {
            global_session: self.global_session,
            local_operation_id: self.next_local_operation_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn operations_are_unique_within_a_session() {
        // -- setup --
        let allocator = Arc::new(SessionIdAllocator::starting_at(
            GlobalSession {
                session_id: 1,
                owner_id: 2,
            },
            10,
        ));

        // -- execute --
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || (0..100).map(|_| allocator.next_operation()).collect::<Vec<_>>())
            })
            .collect();
        let operations: Vec<DistributedOperation> =
            handles.into_iter().flat_map(|handle| handle.join().unwrap()).collect();

        // -- verify --
        let local_ids: HashSet<u64> = operations.iter().map(|op| op.local_operation_id).collect();
        assert_eq!(local_ids.len(), 400);
        assert_eq!(local_ids.iter().min(), Some(&10));
        assert!(operations.iter().all(|op| op.global_session == allocator.global_session()));
    }

    #[test]
    fn separate_sessions_have_separate_counters() {
        let a = SessionIdAllocator::new(GlobalSession::random(1));
        let b = SessionIdAllocator::new(GlobalSession::random(1));

        assert_eq!(a.next_operation().local_operation_id, 0);
        assert_eq!(a.next_operation().local_operation_id, 1);
        assert_eq!(b.next_operation().local_operation_id, 0);
    }
}

use crate::state_machines::command::IdType;
use crate::state_machines::state_machine::{ApplyError, ReplicatedStateMachine};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub struct IdAllocationRequest {
    pub id_type: IdType,
    pub range_start: u64,
    pub range_length: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocationOutcome {
    Granted,
    /// Someone else got a range first. Retry starting at `first_unallocated`.
    Rejected { first_unallocated: u64 },
}

/// Hands out contiguous id ranges per id type. A request names the range it wants; it is granted
/// only if it starts exactly at the first unallocated id, so members race optimistically and the
/// log order decides the winner.
#[derive(Clone)]
pub struct ReplicatedIdAllocationStateMachine {
    logger: slog::Logger,
    first_unallocated: HashMap<IdType, u64>,
    last_outcome: Option<(u64, AllocationOutcome)>,
    last_applied_index: u64,
}

impl ReplicatedIdAllocationStateMachine {
    pub fn new(logger: slog::Logger) -> Self {
        ReplicatedIdAllocationStateMachine {
            logger,
            first_unallocated: HashMap::new(),
            last_outcome: None,
            last_applied_index: 0,
        }
    }

    /// Rebuilds the machine from per-type allocation frontiers as of `last_applied_index`.
    pub(super) fn restore(logger: slog::Logger, last_applied_index: u64, first_unallocated: &[(IdType, u64)]) -> Self {
        ReplicatedIdAllocationStateMachine {
            logger,
            first_unallocated: first_unallocated.iter().copied().collect(),
            last_outcome: None,
            last_applied_index,
        }
    }

    /// Allocation frontiers per type, in a fixed type order.
    pub(super) fn export(&self) -> Vec<(IdType, u64)> {
        let mut frontiers: Vec<(IdType, u64)> = self
            .first_unallocated
            .iter()
            .map(|(id_type, first_unallocated)| (*id_type, *first_unallocated))
            .collect();
        frontiers.sort_by_key(|(id_type, _)| *id_type);
        frontiers
    }

    pub fn first_unallocated(&self, id_type: IdType) -> u64 {
        self.first_unallocated.get(&id_type).copied().unwrap_or(0)
    }

    /// Outcome of the most recent request, with the index it was applied at.
    pub fn last_outcome(&self) -> Option<(u64, AllocationOutcome)> {
        self.last_outcome
    }
}

impl ReplicatedStateMachine for ReplicatedIdAllocationStateMachine {
    type Command = IdAllocationRequest;

    fn apply(&mut self, index: u64, request: IdAllocationRequest) -> Result<(), ApplyError> {
        if index <= self.last_applied_index {
            slog::debug!(self.logger, "Ignoring id allocation at already applied index {}", index);
            return Ok(());
        }

        let first_unallocated = self.first_unallocated.entry(request.id_type).or_insert(0);
        let range_end = first_unallocated.checked_add(request.range_length);
        let outcome = match range_end {
            Some(range_end) if request.range_start == *first_unallocated && request.range_length > 0 => {
                *first_unallocated = range_end;
                AllocationOutcome::Granted
            }
            _ => {
                slog::debug!(
                    self.logger,
                    "Rejecting {:?} range [{}, +{}); first unallocated is {}",
                    request.id_type,
                    request.range_start,
                    request.range_length,
                    first_unallocated
                );
                AllocationOutcome::Rejected {
                    first_unallocated: *first_unallocated,
                }
            }
        };

        self.last_outcome = Some((index, outcome));
        self.last_applied_index = index;
        Ok(())
    }

    fn last_applied_index(&self) -> u64 {
        self.last_applied_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id_type: IdType, range_start: u64, range_length: u64) -> IdAllocationRequest {
        IdAllocationRequest {
            id_type,
            range_start,
            range_length,
        }
    }

    #[test]
    fn only_the_request_at_the_allocation_frontier_wins() {
        // -- setup --
        let mut ids = ReplicatedIdAllocationStateMachine::new(slog::Logger::root(slog::Discard, slog::o!()));

        // -- execute & verify --
        ids.apply(1, request(IdType::Node, 0, 100)).unwrap();
        assert_eq!(ids.last_outcome(), Some((1, AllocationOutcome::Granted)));

        // Two members raced for the same range; the second one in the log loses.
        ids.apply(2, request(IdType::Node, 0, 100)).unwrap();
        assert_eq!(
            ids.last_outcome(),
            Some((2, AllocationOutcome::Rejected { first_unallocated: 100 }))
        );

        ids.apply(3, request(IdType::Node, 100, 50)).unwrap();
        ids.apply(4, request(IdType::Relationship, 0, 10)).unwrap();

        assert_eq!(ids.first_unallocated(IdType::Node), 150);
        assert_eq!(ids.first_unallocated(IdType::Relationship), 10);
        assert_eq!(ids.first_unallocated(IdType::Property), 0);
    }

    #[test]
    fn empty_ranges_and_replays_change_nothing() {
        // -- setup --
        let mut ids = ReplicatedIdAllocationStateMachine::new(slog::Logger::root(slog::Discard, slog::o!()));
        ids.apply(1, request(IdType::String, 0, 8)).unwrap();

        // -- execute --
        ids.apply(2, request(IdType::String, 8, 0)).unwrap();
        ids.apply(2, request(IdType::String, 8, 8)).unwrap();
        ids.apply(1, request(IdType::String, 8, 8)).unwrap();

        // -- verify --
        assert_eq!(ids.first_unallocated(IdType::String), 8);
        assert_eq!(ids.last_applied_index(), 2);
    }

    #[test]
    fn range_past_the_end_of_the_id_space_is_rejected() {
        // -- setup --
        let mut ids = ReplicatedIdAllocationStateMachine::new(slog::Logger::root(slog::Discard, slog::o!()));
        ids.apply(1, request(IdType::Node, 0, u64::MAX)).unwrap();

        // -- execute --
        ids.apply(2, request(IdType::Node, u64::MAX, 1)).unwrap();

        // -- verify --
        assert_eq!(
            ids.last_outcome(),
            Some((2, AllocationOutcome::Rejected { first_unallocated: u64::MAX }))
        );
        assert_eq!(ids.first_unallocated(IdType::Node), u64::MAX);
    }

    #[test]
    fn restored_machine_keeps_its_frontiers() {
        // -- setup --
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let mut ids = ReplicatedIdAllocationStateMachine::new(logger.clone());
        ids.apply(1, request(IdType::Node, 0, 100)).unwrap();
        ids.apply(2, request(IdType::Array, 0, 4)).unwrap();

        // -- execute --
        let mut restored = ReplicatedIdAllocationStateMachine::restore(logger, 2, &ids.export());
        restored.apply(3, request(IdType::Node, 0, 10)).unwrap();

        // -- verify --
        assert_eq!(ids.export(), vec![(IdType::Node, 100), (IdType::Array, 4)]);
        assert_eq!(
            restored.last_outcome(),
            Some((3, AllocationOutcome::Rejected { first_unallocated: 100 }))
        );
        assert_eq!(restored.first_unallocated(IdType::Array), 4);
    }
}

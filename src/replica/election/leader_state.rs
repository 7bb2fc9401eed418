use crate::commitlog::{opt_index_as_u64, Index};
use crate::replica::election::timers::LeaderTimerHandle;
use crate::replica::MemberId;
use std::cmp;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<MemberId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<MemberId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &MemberId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn matched_indexes(&self) -> Vec<Option<Index>> {
        self.peer_state.values().map(|peer| peer.matched).collect()
    }

    /// Lowest index known to be on every follower. `None` when there are no followers at all.
    pub(crate) fn lowest_matched(&self) -> Option<Option<Index>> {
        self.peer_state.values().map(|peer| peer.matched).min()
    }

    /// Whether a majority (this leader included) has answered within `window` of `now`.
    pub(crate) fn has_recent_quorum(&self, now: Instant, window: Duration, majority: usize) -> bool {
        let recent_peers = self
            .peer_state
            .values()
            .filter(|peer| now.saturating_duration_since(peer.last_contact) <= window)
            .count();

        recent_peers + 1 >= majority
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer: LeaderTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // A logical clock of the leader's requests to this peer within one term. Each request takes
    // the next seq-no, and a reply older than the newest reply already handled is discarded.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,

    // Last time the peer answered an AppendEntries, successfully or with a log mismatch. Starts
    // at election time so a new leader isn't considered partitioned right away.
    last_contact: Instant,
}

impl PeerState {
    pub(super) fn new(heartbeat_timer: LeaderTimerHandle, previous_log_entry_index: Option<Index>, now: Instant) -> Self {
        PeerState {
            heartbeat_timer,
            next: previous_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
            last_contact: now,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
        now: Instant,
    ) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date seq-no({:?}): {:?}", received_seq_no, update);
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                self.last_contact = now;
                self.update_log(logger, previous_log_entry, num_entries_replicated);
            }
            PeerStateUpdate::PeerLogBehind { last_log_index } => {
                self.last_contact = now;
                self.rewind_log(logger, last_log_index);
            }
        }
    }

    fn update_log(&mut self, logger: &slog::Logger, previous_log_entry: Option<Index>, num_entries_replicated: usize) {
        // A successful heartbeat confirms the peer matches us up to the previous entry.
        let new_matched = match Index::from_u64_opt(opt_index_as_u64(previous_log_entry) + num_entries_replicated as u64)
        {
            Some(index) => index,
            None => return,
        };

        if matches!(self.matched, Some(matched) if matched >= new_matched) {
            slog::debug!(
                logger,
                "Peer already known to match {:?}, ignoring ack for {:?}",
                self.matched,
                new_matched
            );
            return;
        }

        self.matched.replace(new_matched);
        self.next = cmp::max(self.next, new_matched.plus(1));
    }

    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        // Jump straight past the peer's last entry when it told us where its log ends, otherwise
        // step back one at a time.
        let stepped_back = cmp::max(1, self.next.as_u64().saturating_sub(1));
        let hinted = opt_index_as_u64(peer_last_log_index) + 1;
        let new_next = Index::new(cmp::max(1, cmp::min(stepped_back, hinted)));

        if new_next == self.next {
            slog::warn!(logger, "Can't rewind peer log, already at {:?}.", self.next);
            return;
        }

        if let Some(matched) = self.matched {
            if matched >= new_next {
                // Only a volatile peer that restarted can lose acknowledged entries.
                slog::warn!(
                    logger,
                    "Peer no longer has entries it acknowledged. Matched {:?}, peer log ends at {:?}",
                    matched,
                    peer_last_log_index
                );
                self.matched = new_next.checked_minus(1);
            }
        }

        self.next = new_next;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    PeerLogBehind {
        last_log_index: Option<Index>,
    },
    OtherError,
}

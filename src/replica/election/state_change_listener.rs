use crate::replica::MemberId;
use tokio::sync::watch;

/// Point-in-time view of this member's role.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(MemberId),
    FollowerNoLeader,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state.clone());

    (
        ElectionStateChangeNotifier {
            snd,
            last_sent: initial_state,
        },
        ElectionStateChangeListener { rcv },
    )
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
    last_sent: ElectionStateSnapshot,
}

impl ElectionStateChangeNotifier {
    /// Publishes `new_state` unless listeners already see it. A candidate starting another election
    /// stays `Candidate`, so listeners aren't woken for it.
    pub(super) fn notify_new_state(&mut self, new_state: ElectionStateSnapshot) {
        if new_state == self.last_sent {
            return;
        }
        self.last_sent = new_state.clone();

        // No listener is fine.
        let _ = self.snd.send(new_state);
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Waits for the next role change. `None` once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }
}

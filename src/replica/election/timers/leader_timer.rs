use crate::replica::election::timers::deadline::SharedDeadline;
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::{actor, replica};
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// Per-follower heartbeat timer held by the leader. Dropping the handle stops the task.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_interval: Duration,
    next_heartbeat: SharedDeadline,
    clock: C,
}

struct LeaderTimerTask<C: Clock> {
    alive: Weak<Shared<C>>,
    next_heartbeat: SharedDeadline,
    actor_client: actor::WeakActorClient,
    tick: replica::LeaderTimerTick,
    clock: C,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_interval: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::MemberId,
        term: replica::Term,
    ) -> Self {
        let (task, handle) = LeaderTimerTask::new(heartbeat_interval, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> LeaderTimerHandle<C> {
    /// Postpones the next heartbeat; something was just sent to this peer.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        self.next_heartbeat.set(self.clock.now() + self.heartbeat_interval);
    }
}

impl<C: Clock> LeaderTimerTask<C> {
    fn new(
        heartbeat_interval: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::MemberId,
        term: replica::Term,
        clock: C,
    ) -> (Self, LeaderTimerHandle<C>) {
        let next_heartbeat = SharedDeadline::default();
        let shared = Arc::new(Shared {
            heartbeat_interval,
            next_heartbeat: next_heartbeat.clone(),
            clock: clock.clone(),
        });

        let task = LeaderTimerTask {
            alive: Arc::downgrade(&shared),
            next_heartbeat,
            actor_client,
            tick: replica::LeaderTimerTick { peer_id, term },
            clock,
        };

        (task, LeaderTimerHandle { shared })
    }

    async fn run(mut self) {
        // No deadline is stored initially, so the first tick goes out right away. A new leader
        // wants to reach every follower as soon as possible.
        loop {
            match self.next_heartbeat.take() {
                Some(deadline) => self.clock.sleep_until(deadline).await,
                None => {
                    let shared = match self.alive.upgrade() {
                        Some(shared) => shared,
                        None => return,
                    };
                    if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                        return;
                    }
                    shared.reset_heartbeat_timer();
                }
            }
        }
    }
}

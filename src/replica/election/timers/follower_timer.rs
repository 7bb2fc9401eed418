use crate::actor;
use crate::replica::election::timers::deadline::SharedDeadline;
use crate::replica::election::timers::time::{Clock, RealClock};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// Election timeout for followers and candidates. Dropping the handle stops the task.
pub(crate) struct FollowerTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    next_timeout: SharedDeadline,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct FollowerTimerTask<C: Clock> {
    alive: Weak<Shared<C>>,
    next_timeout: SharedDeadline,
    actor_client: actor::WeakActorClient,
    clock: C,
    // Pause between two consecutive timeout events while the actor keeps ignoring them, e.g.
    // while the replica is faulted.
    retrigger_delay: Duration,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = FollowerTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> FollowerTimerHandle<C> {
    /// Pushes the timeout back by a fresh random duration. Called whenever we hear from a leader.
    pub(crate) fn reset_timeout(&self) {
        self.shared.reset_timeout();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_timeout(&self) {
        let jitter = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.next_timeout.set(self.clock.now() + jitter);
    }
}

impl<C: Clock> FollowerTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, FollowerTimerHandle<C>) {
        let next_timeout = SharedDeadline::default();
        let shared = Arc::new(Shared {
            next_timeout: next_timeout.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock: clock.clone(),
        });

        // The first deadline must exist before the task runs, or it would fire immediately.
        shared.reset_timeout();

        let task = FollowerTimerTask {
            alive: Arc::downgrade(&shared),
            next_timeout,
            actor_client,
            clock,
            retrigger_delay: min_timeout,
        };

        (task, FollowerTimerHandle { shared })
    }

    async fn run(mut self) {
        loop {
            match self.next_timeout.take() {
                Some(deadline) => self.clock.sleep_until(deadline).await,
                None => {
                    // Nobody reset the deadline while we slept: no leader contact.
                    if self.alive.upgrade().is_none() {
                        return;
                    }
                    if self.actor_client.follower_timeout().await.is_err() {
                        return;
                    }
                    self.clock.sleep(self.retrigger_delay).await;
                }
            }

            // Handle dropped: we're no longer a follower/candidate in the same term.
            if self.alive.upgrade().is_none() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::test_utils::TestUtilActor;
    use crate::replica::election::timers::time;

    #[tokio::test]
    async fn follower_timer_handle_reset_and_timeout() {
        // -- setup --
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut clock_controller) = time::mocked_clock();

        // Jitter isn't under test, so min == max.
        let (timer_task, timer_handle) =
            FollowerTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(timer_task.run());

        // -- execute & verify --
        actor.assert_no_event().await;

        // Keep resetting at half the timeout: never fires.
        for _ in 0..5 {
            clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.assert_no_event().await;
        assert_eq!(clock_controller.elapsed_time(), timeout * 5 / 2);

        // Last reset at T=2.5, so nothing before T=3.5...
        let one_ns = Duration::from_nanos(1);
        clock_controller.advance(timeout - one_ns);
        actor.assert_no_event().await;

        // ...and a timeout exactly at T=3.5.
        clock_controller.advance(one_ns);
        actor.assert_follower_timeout_event().await;
    }

    #[tokio::test]
    async fn follower_timer_task_exits_when_handle_dropped() {
        // -- setup --
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut clock_controller) = time::mocked_clock();

        let (timer_task, timer_handle) =
            FollowerTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        let join_handle = tokio::task::spawn(timer_task.run());

        // -- execute --
        drop(timer_handle);
        clock_controller.advance(timeout * 2);

        // -- verify --
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn follower_timer_keeps_running_after_a_timeout() {
        // -- setup --
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut clock_controller) = time::mocked_clock();

        let (timer_task, timer_handle) =
            FollowerTimerTask::new(timeout, timeout, strong_actor_client.weak(), mock_clock);
        tokio::task::spawn(timer_task.run());
        actor.assert_no_event().await;

        // -- execute --
        // The actor may still be a follower after a timeout it chose to ignore, and an
        // AppendEntries can reset the timer right after the timeout was sent.
        clock_controller.advance(timeout);
        actor.assert_follower_timeout_event().await;
        timer_handle.reset_timeout();

        // -- verify --
        for _ in 0..5 {
            clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.assert_no_event().await;
    }
}

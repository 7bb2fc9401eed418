#[cfg(test)]
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Source of time for the election timers. Production uses tokio's clock, tests drive a mock.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let start = Instant::now();
    let (tx, rx) = watch::channel(start);

    (MockClock { now: rx }, MockClockController { now: tx, start })
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    now: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        while *self.now.borrow() < deadline {
            if self.now.changed().await.is_err() {
                // Controller is gone, time will never move again.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    now: watch::Sender<Instant>,
    start: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn current_time(&self) -> Instant {
        *self.now.borrow()
    }

    pub(crate) fn elapsed_time(&self) -> Duration {
        self.current_time() - self.start
    }

    /// Moves mock time forward. Sleepers wake once `now` is at or past their deadline, so a big
    /// jump wakes them late rather than once per skipped interval. Advance in steps smaller than
    /// what the test wants to observe.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let new_now = self.current_time() + duration;
        let _ = self.now.send(new_now);
    }
}

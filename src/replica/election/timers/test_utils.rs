use crate::actor::Event;
use crate::replica::LeaderTimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stands in for the replica actor: receives the events timers send and asserts on them.
pub(super) struct TestUtilActor {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl TestUtilActor {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    async fn recv(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Timed out waiting for an event")
            .expect("Event queue closed")
    }

    pub(super) async fn assert_leader_heartbeat_event(&mut self, expected: LeaderTimerTick) {
        match self.recv().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn assert_follower_timeout_event(&mut self) {
        match self.recv().await {
            Event::FollowerTimeout => {}
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn assert_no_event(&mut self) {
        tokio::time::timeout(self.quiet_period, self.rx.recv())
            .await
            .expect_err("Expected no event");
    }
}

use crate::replica::MemberId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Remembers when something was last logged per key, so a flapping peer doesn't flood the log.
pub(super) struct LogThrottle<K> {
    window: Duration,
    last_logged: Mutex<HashMap<K, Instant>>,
}

impl<K: Hash + Eq> LogThrottle<K> {
    pub(super) fn new(window: Duration) -> Self {
        LogThrottle {
            window,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and records `now` if nothing was logged for `key` within the window.
    pub(super) fn should_log_at(&self, key: K, now: Instant) -> bool {
        let mut last_logged = self.last_logged.lock();
        match last_logged.get(&key) {
            Some(previous) if now.saturating_duration_since(*previous) < self.window => false,
            _ => {
                last_logged.insert(key, now);
                true
            }
        }
    }
}

/// Reports members the topology service couldn't resolve. Sends to them are dropped.
pub(super) struct UnknownAddressMonitor {
    throttle: LogThrottle<MemberId>,
}

impl UnknownAddressMonitor {
    pub(super) fn new(window: Duration) -> Self {
        UnknownAddressMonitor {
            throttle: LogThrottle::new(window),
        }
    }

    pub(super) fn log_attempt_to_send_to_unknown(&self, logger: &slog::Logger, member_id: &MemberId) {
        if self.throttle.should_log_at(member_id.clone(), Instant::now()) {
            slog::warn!(
                logger,
                "No address known for member {:?}. Dropping outbound message.",
                member_id
            );
        }
    }
}

/// Reports transport failures per address.
pub(super) struct FailureMonitor {
    throttle: LogThrottle<SocketAddr>,
}

impl FailureMonitor {
    pub(super) fn new(window: Duration) -> Self {
        FailureMonitor {
            throttle: LogThrottle::new(window),
        }
    }

    pub(super) fn log_failure(&self, logger: &slog::Logger, addr: SocketAddr, failure: &str) {
        if self.throttle.should_log_at(addr, Instant::now()) {
            slog::warn!(logger, "Failed to reach {}: {}", addr, failure);
        }
    }
}

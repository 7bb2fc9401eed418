use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// Next instant a timer task should act on, shared between the task and its handle. The task
/// `take()`s it; if nothing was stored in the meantime, the deadline has passed without a reset.
#[derive(Clone, Default)]
pub(super) struct SharedDeadline {
    next: Arc<Mutex<Option<Instant>>>,
}

impl SharedDeadline {
    pub(super) fn set(&self, deadline: Instant) {
        self.next.lock().replace(deadline);
    }

    pub(super) fn take(&self) -> Option<Instant> {
        self.next.lock().take()
    }
}

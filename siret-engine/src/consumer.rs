use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A consumer session on a subscription.
///
/// The active flag flips to false on disconnect and back to true when the
/// same consumer name reconnects and is validated against the subscription.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub consumer_id: u64,
    pub consumer_name: String,
    active: Arc<AtomicBool>,
}

impl Consumer {
    pub(crate) fn new(consumer_id: u64, consumer_name: &str) -> Self {
        Consumer {
            consumer_id,
            consumer_name: consumer_name.to_string(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

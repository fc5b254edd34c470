use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStatus {
    Disabled,
    Enabled,
}

/// Admission verdict for one (producer, sequence id) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// New sequence id, append it.
    Admit,
    /// Already persisted, acknowledge without a new append.
    Duplicate,
    /// Admitted but the append has not completed; the outcome is unknown
    /// until the in-flight publish persists or fails.
    Unresolved,
}

#[derive(Debug, Default, Clone, Copy)]
struct SequencePair {
    last_published: Option<u64>,
    last_persisted: Option<u64>,
}

/// Per-producer sequence tracking that turns at-least-once publishes into
/// at-most-once appends.
///
/// Admission compares against the highest sequence id already admitted for
/// the producer; persist-completions record the highest persisted id. Both
/// counters for one producer are updated under that producer's map entry, so
/// concurrent persist-completions cannot reorder recorded ids.
#[derive(Debug)]
pub struct MessageDeduplication {
    enabled: AtomicBool,
    sequences: DashMap<String, SequencePair>,
    // producer name -> millis when it disconnected
    inactive_since: DashMap<String, u64>,
}

impl MessageDeduplication {
    pub fn new(enabled: bool) -> Self {
        MessageDeduplication {
            enabled: AtomicBool::new(enabled),
            sequences: DashMap::new(),
            inactive_since: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn status(&self) -> DedupStatus {
        if self.is_enabled() {
            DedupStatus::Enabled
        } else {
            DedupStatus::Disabled
        }
    }

    /// Publish admission for one sequence id.
    ///
    /// A sequence id above the published watermark is admitted and moves the
    /// watermark. At or below the *persisted* watermark it is a duplicate the
    /// producer can safely treat as acknowledged. In between the two
    /// watermarks the earlier publish is still in flight and its outcome is
    /// unknown, so the retry is neither admitted nor acknowledged.
    pub fn decide_publish(&self, producer_name: &str, sequence_id: u64) -> DedupDecision {
        if !self.is_enabled() {
            return DedupDecision::Admit;
        }
        let mut entry = self
            .sequences
            .entry(producer_name.to_string())
            .or_default();
        if entry
            .last_published
            .map(|last| sequence_id > last)
            .unwrap_or(true)
        {
            entry.last_published = Some(sequence_id);
            return DedupDecision::Admit;
        }
        if entry
            .last_persisted
            .map(|last| sequence_id <= last)
            .unwrap_or(false)
        {
            DedupDecision::Duplicate
        } else {
            DedupDecision::Unresolved
        }
    }

    /// Record a successful append for the producer.
    pub fn record_persisted(&self, producer_name: &str, sequence_id: u64) {
        let mut entry = self
            .sequences
            .entry(producer_name.to_string())
            .or_default();
        if entry
            .last_persisted
            .map(|last| sequence_id > last)
            .unwrap_or(true)
        {
            entry.last_persisted = Some(sequence_id);
        }
    }

    /// A failed append must not poison the admission window: roll the
    /// published watermark back to what actually persisted so the producer
    /// can retry the same sequence id.
    pub fn record_publish_failed(&self, producer_name: &str) {
        if let Some(mut entry) = self.sequences.get_mut(producer_name) {
            entry.last_published = entry.last_persisted;
        }
    }

    pub fn last_published_sequence(&self, producer_name: &str) -> Option<u64> {
        self.sequences.get(producer_name).and_then(|e| e.last_published)
    }

    pub fn last_persisted_sequence(&self, producer_name: &str) -> Option<u64> {
        self.sequences.get(producer_name).and_then(|e| e.last_persisted)
    }

    pub fn producer_added(&self, producer_name: &str) {
        self.inactive_since.remove(producer_name);
    }

    pub fn producer_removed(&self, producer_name: &str) {
        self.inactive_since
            .insert(producer_name.to_string(), now_millis());
    }

    /// Drop sequence state for producers that disconnected longer than
    /// `grace` ago. A reconnect within the grace window keeps its window.
    pub fn purge_inactive_producers(&self, grace: Duration) {
        let cutoff = now_millis().saturating_sub(grace.as_millis() as u64);
        let expired: Vec<String> = self
            .inactive_since
            .iter()
            .filter(|e| *e.value() <= cutoff)
            .map(|e| e.key().clone())
            .collect();
        for producer_name in expired {
            self.inactive_since.remove(&producer_name);
            self.sequences.remove(&producer_name);
        }
    }

    pub fn tracked_producers(&self) -> usize {
        self.sequences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// What this test validates
    ///
    /// - Scenario: the same (producer, sequence id) is offered twice, with
    ///   the append completing in between.
    /// - Expectation: the first offer is admitted, the second is a
    ///   duplicate; higher sequence ids are admitted again.
    #[test]
    fn duplicate_sequence_is_rejected_once_persisted() {
        let dedup = MessageDeduplication::new(true);
        assert_eq!(dedup.decide_publish("p1", 0), DedupDecision::Admit);
        dedup.record_persisted("p1", 0);
        assert_eq!(dedup.decide_publish("p1", 0), DedupDecision::Duplicate);
        assert_eq!(dedup.decide_publish("p1", 1), DedupDecision::Admit);
    }

    /// What this test validates
    ///
    /// - Scenario: an out-of-order (lower) sequence id after a higher one.
    /// - Expectation: acknowledged as duplicate without admission.
    #[test]
    fn out_of_order_duplicates_are_rejected() {
        let dedup = MessageDeduplication::new(true);
        assert_eq!(dedup.decide_publish("p1", 5), DedupDecision::Admit);
        dedup.record_persisted("p1", 5);
        assert_eq!(dedup.decide_publish("p1", 3), DedupDecision::Duplicate);
        assert_eq!(dedup.last_persisted_sequence("p1"), Some(5));
    }

    /// What this test validates
    ///
    /// - Scenario: a sequence id is retried while the first publish of that
    ///   id is still in flight, then again after the append fails.
    /// - Expectation: the retry during the in-flight window is unresolved,
    ///   never a duplicate acknowledgement; after the failure rolls the
    ///   watermark back the same id is admitted again, and nothing was ever
    ///   recorded as persisted.
    #[test]
    fn inflight_retry_is_unresolved_not_acknowledged() {
        let dedup = MessageDeduplication::new(true);
        assert_eq!(dedup.decide_publish("p1", 7), DedupDecision::Admit);
        assert_eq!(dedup.decide_publish("p1", 7), DedupDecision::Unresolved);
        assert_eq!(dedup.last_persisted_sequence("p1"), None);

        dedup.record_publish_failed("p1");
        assert_eq!(dedup.last_persisted_sequence("p1"), None);
        assert_eq!(dedup.decide_publish("p1", 7), DedupDecision::Admit);
        dedup.record_persisted("p1", 7);
        assert_eq!(dedup.decide_publish("p1", 7), DedupDecision::Duplicate);
    }

    /// What this test validates
    ///
    /// - Scenario: an admitted publish fails at the log.
    /// - Expectation: the published watermark rolls back so the retry of
    ///   the same sequence id is admitted.
    #[test]
    fn failed_publish_allows_retry_of_same_sequence() {
        let dedup = MessageDeduplication::new(true);
        assert_eq!(dedup.decide_publish("p1", 7), DedupDecision::Admit);
        dedup.record_publish_failed("p1");
        assert_eq!(dedup.decide_publish("p1", 7), DedupDecision::Admit);
    }

    /// What this test validates
    ///
    /// - Scenario: disabled tracker.
    /// - Expectation: everything is admitted, including exact duplicates.
    #[test]
    fn disabled_tracker_admits_everything() {
        let dedup = MessageDeduplication::new(false);
        assert_eq!(dedup.decide_publish("p1", 1), DedupDecision::Admit);
        assert_eq!(dedup.decide_publish("p1", 1), DedupDecision::Admit);
    }

    /// What this test validates
    ///
    /// - Scenario: producer disconnects and the grace window elapses.
    /// - Expectation: its sequence state is purged; a producer still within
    ///   the grace window keeps its state.
    #[test]
    fn purge_respects_grace_window() {
        let dedup = MessageDeduplication::new(true);
        assert_eq!(dedup.decide_publish("gone", 1), DedupDecision::Admit);
        assert_eq!(dedup.decide_publish("fresh", 1), DedupDecision::Admit);
        dedup.producer_removed("gone");

        dedup.purge_inactive_producers(Duration::from_secs(3600));
        assert_eq!(dedup.tracked_producers(), 2);

        dedup.purge_inactive_producers(Duration::from_secs(0));
        assert_eq!(dedup.last_published_sequence("gone"), None);
        assert_eq!(dedup.last_published_sequence("fresh"), Some(1));
    }
}

use metrics::counter;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use siret_core::message::{Position, StreamMessage};
use siret_core::storage::OrderedLog;

use crate::engine_metrics::{COMPACTION_FAILED_TOTAL, COMPACTION_RUNS_TOTAL};
use crate::errors::{Result, TopicError};

/// Observable state of the topic's compaction slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionStatus {
    NotRun,
    Running,
    Success { horizon: Position },
    Error(String),
}

/// Published result of a compaction run: the entries that survived, keyed by
/// their original position, authoritative up to `horizon`.
///
/// Positions never change across compaction; readers below the horizon
/// consult `contains` to decide whether an original entry is still visible.
#[derive(Debug, Default)]
pub struct CompactedSegment {
    horizon: Option<Position>,
    entries: BTreeMap<Position, Vec<u8>>,
    // key -> position of its latest write within the compacted range
    latest_by_key: HashMap<String, Position>,
}

impl CompactedSegment {
    pub fn horizon(&self) -> Option<Position> {
        self.horizon
    }

    /// True when the entry at `position` survived compaction. Only
    /// meaningful for positions at or below the horizon.
    pub fn contains(&self, position: Position) -> bool {
        self.entries.contains_key(&position)
    }

    /// True when `position` holds the latest write for `key` within the
    /// compacted range. Batches survive whole even when some of their keys
    /// were overwritten later; readers use this to hide those members.
    pub fn is_latest_for(&self, key: &str, position: Position) -> bool {
        self.latest_by_key
            .get(key)
            .map(|latest| *latest == position)
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ScannedEntry {
    position: Position,
    raw: Vec<u8>,
    message: Option<StreamMessage>,
}

/// Two-phase, key-based backlog compaction.
///
/// Phase 1 scans the effective backlog (previous compacted segment plus
/// everything appended since its horizon) and records the latest position for
/// every key. Phase 2 walks the same range and retains an entry only when it
/// still speaks for at least one key, is keyless, or is a batch that cannot
/// be dropped whole. The new segment replaces the old one in a single swap,
/// so a failed run leaves the previous state fully intact.
#[derive(Debug)]
pub struct Compactor {
    status: Mutex<CompactionStatus>,
    segment: RwLock<Arc<CompactedSegment>>,
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compactor {
    pub fn new() -> Self {
        Compactor {
            status: Mutex::new(CompactionStatus::NotRun),
            segment: RwLock::new(Arc::new(CompactedSegment::default())),
        }
    }

    pub async fn status(&self) -> CompactionStatus {
        self.status.lock().await.clone()
    }

    /// Segment readers resolve positions through. Always present; an empty
    /// segment with no horizon means compaction has never completed.
    pub async fn current_segment(&self) -> Arc<CompactedSegment> {
        self.segment.read().await.clone()
    }

    /// Run one compaction to the log's current last confirmed position.
    ///
    /// Fails fast with `AlreadyRunning` when a run is in flight. An empty or
    /// already-fully-compacted backlog completes as a no-op success.
    pub async fn compact(&self, topic_name: &str, log: Arc<dyn OrderedLog>) -> Result<Position> {
        {
            let mut status = self.status.lock().await;
            if *status == CompactionStatus::Running {
                return Err(TopicError::AlreadyRunning);
            }
            *status = CompactionStatus::Running;
        }

        let outcome = self.run(topic_name, log).await;

        let mut status = self.status.lock().await;
        match &outcome {
            Ok(horizon) => {
                counter!(COMPACTION_RUNS_TOTAL.name).increment(1);
                *status = CompactionStatus::Success { horizon: *horizon };
            }
            Err(e) => {
                counter!(COMPACTION_FAILED_TOTAL.name).increment(1);
                warn!(topic = topic_name, error = %e, "compaction failed");
                *status = CompactionStatus::Error(e.to_string());
            }
        }
        outcome
    }

    async fn run(&self, topic_name: &str, log: Arc<dyn OrderedLog>) -> Result<Position> {
        let previous = self.segment.read().await.clone();
        let prev_horizon = previous.horizon();

        let last = match log
            .last_confirmed()
            .await
            .map_err(|e| TopicError::Persistence(e.to_string()))?
        {
            Some(last) => last,
            None => {
                debug!(topic = topic_name, "compaction no-op: empty backlog");
                return Ok(prev_horizon.unwrap_or_default());
            }
        };
        if prev_horizon == Some(last) {
            debug!(topic = topic_name, horizon = %last, "compaction no-op: horizon at tail");
            return Ok(last);
        }

        let fresh = log
            .read_range(prev_horizon, last)
            .await
            .map_err(|e| TopicError::Persistence(e.to_string()))?;

        // The effective backlog: survivors of the last run followed by the
        // entries appended since its horizon, in position order.
        let mut scanned: Vec<ScannedEntry> = Vec::with_capacity(previous.len() + fresh.len());
        for (position, raw) in previous
            .entries
            .iter()
            .map(|(p, r)| (*p, r.clone()))
            .chain(fresh)
        {
            let message = match StreamMessage::decode(&raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(topic = topic_name, position = %position, error = %e,
                        "undecodable entry passes through compaction");
                    None
                }
            };
            scanned.push(ScannedEntry {
                position,
                raw,
                message,
            });
        }

        // Phase 1: latest position per key, plus the always-pass-through set
        // (keyless entries and batches carrying a keyless message).
        let mut latest_by_key: HashMap<String, Position> = HashMap::new();
        let mut pass_through: HashSet<Position> = HashSet::new();
        for entry in &scanned {
            match &entry.message {
                Some(message) => match &message.batch {
                    Some(batch) => {
                        let mut has_keyless = batch.is_empty();
                        for batched in batch {
                            match &batched.partition_key {
                                Some(key) => {
                                    latest_by_key.insert(key.clone(), entry.position);
                                }
                                None => has_keyless = true,
                            }
                        }
                        if has_keyless {
                            pass_through.insert(entry.position);
                        }
                    }
                    None => match &message.partition_key {
                        Some(key) => {
                            latest_by_key.insert(key.clone(), entry.position);
                        }
                        None => {
                            pass_through.insert(entry.position);
                        }
                    },
                },
                None => {
                    pass_through.insert(entry.position);
                }
            }
        }

        // Phase 2: retain what still speaks for a key. Batches cannot be
        // split, so a batch survives when any of its keys is still latest
        // there. A tombstone that is itself the latest write for its key is
        // dropped along with the key.
        let mut retained: BTreeMap<Position, Vec<u8>> = BTreeMap::new();
        for entry in scanned {
            let keep = pass_through.contains(&entry.position)
                || match &entry.message {
                    Some(message) => match &message.batch {
                        Some(batch) => batch.iter().any(|batched| {
                            batched
                                .partition_key
                                .as_ref()
                                .map(|key| latest_by_key.get(key) == Some(&entry.position))
                                .unwrap_or(false)
                        }),
                        None => {
                            !message.is_tombstone()
                                && message
                                    .partition_key
                                    .as_ref()
                                    .map(|key| latest_by_key.get(key) == Some(&entry.position))
                                    .unwrap_or(false)
                        }
                    },
                    None => false,
                };
            if keep {
                retained.insert(entry.position, entry.raw);
            }
        }

        let segment = Arc::new(CompactedSegment {
            horizon: Some(last),
            entries: retained,
            latest_by_key,
        });
        info!(topic = topic_name, horizon = %last, retained = segment.len(),
            "compaction completed");
        *self.segment.write().await = segment;
        Ok(last)
    }
}

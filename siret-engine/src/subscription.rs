use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};

use siret_core::message::{Position, StreamMessage};
use siret_core::storage::{LogCursor, OrderedLog, StartPosition};

use crate::compaction::Compactor;
use crate::consumer::Consumer;
use crate::errors::{Result, TopicError};

/// Dispatch discipline of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubType {
    /// At most one consumer.
    Exclusive,
    /// Any number of consumers share the backlog.
    Shared,
    /// Many consumers connected, one active at a time.
    Failover,
}

/// A named consumption group over the topic, wrapping one cursor.
///
/// Durable subscriptions keep their cursor across topic reopen; non-durable
/// ones live exactly as long as their single consumer. A read-compacted
/// subscription resolves positions at or below the compaction horizon through
/// the compacted segment, and reads the live backlog beyond it, so consumer
/// visible positions never change when compaction runs.
#[derive(Debug)]
pub struct Subscription {
    pub topic_name: String,
    pub name: String,
    sub_type: Mutex<SubType>,
    cursor: Arc<dyn LogCursor>,
    read_compacted: bool,
    consumers: DashMap<u64, Consumer>,
    next_consumer_id: AtomicU64,
    compactor: Arc<Compactor>,
}

impl Subscription {
    pub(crate) fn new(
        topic_name: &str,
        name: &str,
        sub_type: SubType,
        cursor: Arc<dyn LogCursor>,
        read_compacted: bool,
        compactor: Arc<Compactor>,
    ) -> Self {
        Subscription {
            topic_name: topic_name.to_string(),
            name: name.to_string(),
            sub_type: Mutex::new(sub_type),
            cursor,
            read_compacted,
            consumers: DashMap::new(),
            next_consumer_id: AtomicU64::new(0),
            compactor,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.cursor.is_durable()
    }

    pub async fn sub_type(&self) -> SubType {
        *self.sub_type.lock().await
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    pub fn last_active(&self) -> u64 {
        self.cursor.last_active()
    }

    /// Attach a consumer under the subscription's dispatch discipline.
    ///
    /// When all consumers are gone the subscription adopts the type the next
    /// consumer asks for; while consumers are connected a mismatching type is
    /// rejected.
    pub async fn add_consumer(
        &self,
        consumer_name: &str,
        requested_type: SubType,
    ) -> Result<Consumer> {
        let mut sub_type = self.sub_type.lock().await;
        if self.consumers.is_empty() {
            *sub_type = requested_type;
        } else if *sub_type != requested_type {
            return Err(TopicError::NotAllowed(format!(
                "subscription {} is {:?}, requested {:?}",
                self.name, *sub_type, requested_type
            )));
        }

        match *sub_type {
            SubType::Exclusive if !self.consumers.is_empty() => {
                return Err(TopicError::ConsumerBusy(self.name.clone()));
            }
            _ => {}
        }

        let consumer_id = self.next_consumer_id.fetch_add(1, Ordering::AcqRel);
        let consumer = Consumer::new(consumer_id, consumer_name);
        // Failover keeps exactly one active consumer, the first to connect.
        if *sub_type == SubType::Failover && !self.consumers.is_empty() {
            consumer.set_active(false);
        }
        self.consumers.insert(consumer_id, consumer.clone());
        debug!(topic = %self.topic_name, subscription = %self.name,
            consumer = consumer_name, id = consumer_id, "consumer attached");
        Ok(consumer)
    }

    /// Detach a consumer; on failover the oldest remaining consumer is
    /// promoted to active.
    pub async fn remove_consumer(&self, consumer_id: u64) -> bool {
        let removed = self.consumers.remove(&consumer_id).is_some();
        if removed && *self.sub_type.lock().await == SubType::Failover {
            if let Some(next) = self
                .consumers
                .iter()
                .min_by_key(|c| c.consumer_id)
            {
                next.set_active(true);
            }
        }
        removed
    }

    pub fn disconnect_all(&self) {
        for consumer in self.consumers.iter() {
            consumer.set_active(false);
        }
        self.consumers.clear();
    }

    /// Read the next batch of entries for dispatch and advance the cursor.
    ///
    /// Under read-compacted mode, positions the compactor has superseded are
    /// skipped; the returned batch may therefore be shorter than `max` even
    /// when backlog remains. Batch entries below the horizon survive whole,
    /// so their individual members are filtered here: a keyed member whose
    /// key was overwritten after the batch, or whose latest write is a
    /// tombstone, is hidden from the consumer.
    pub async fn fetch(&self, max_entries: usize) -> Result<Vec<(Position, StreamMessage)>> {
        let raw = self.cursor.read_next(max_entries).await?;
        let segment = if self.read_compacted {
            Some(self.compactor.current_segment().await)
        } else {
            None
        };

        let mut out = Vec::with_capacity(raw.len());
        for (position, bytes) in raw {
            let mut message = StreamMessage::decode(&bytes)?;
            if let Some(segment) = &segment {
                if let Some(horizon) = segment.horizon() {
                    if position <= horizon {
                        if !segment.contains(position) {
                            continue;
                        }
                        if let Some(batch) = message.batch.as_mut() {
                            batch.retain(|member| match &member.partition_key {
                                Some(key) => {
                                    segment.is_latest_for(key, position)
                                        && !member.payload.is_empty()
                                }
                                None => true,
                            });
                            if batch.is_empty() {
                                continue;
                            }
                        }
                    }
                }
            }
            out.push((position, message));
        }
        Ok(out)
    }

    /// Acknowledge one position, possibly out of order.
    pub async fn ack(&self, position: Position) -> Result<()> {
        self.cursor.individual_delete(position).await?;
        Ok(())
    }

    /// Acknowledge everything up to and including `position`.
    pub async fn ack_cumulative(&self, position: Position) -> Result<()> {
        self.cursor.mark_delete(position).await?;
        Ok(())
    }

    pub async fn backlog(&self) -> u64 {
        self.cursor.backlog().await
    }

    pub async fn mark_delete_position(&self) -> Option<Position> {
        self.cursor.mark_delete_position().await
    }

    /// Drop the entire unread backlog: acknowledge through the log tail and
    /// move the read pointer past it.
    pub async fn clear_backlog(&self, log: &Arc<dyn OrderedLog>) -> Result<()> {
        if let Some(last) = log.last_confirmed().await? {
            self.cursor.mark_delete(last).await?;
        }
        self.cursor.seek(StartPosition::Latest).await?;
        info!(topic = %self.topic_name, subscription = %self.name, "backlog cleared");
        Ok(())
    }

    /// Acknowledge the contiguous prefix of the backlog older than `ttl`.
    ///
    /// Expiry never creates acknowledgement holes: it stops at the first
    /// entry young enough to keep, even if older entries follow.
    pub async fn expire_messages(&self, log: &Arc<dyn OrderedLog>, ttl: Duration) -> Result<u64> {
        let Some(last) = log.last_confirmed().await? else {
            return Ok(0);
        };
        let cutoff = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(ttl.as_millis() as u64);

        let after = self.cursor.mark_delete_position().await;
        let backlog = log.read_range(after, last).await?;

        let mut expired_up_to: Option<Position> = None;
        let mut expired = 0u64;
        for (position, bytes) in backlog {
            let message = StreamMessage::decode(&bytes)?;
            if message.publish_time >= cutoff {
                break;
            }
            expired_up_to = Some(position);
            expired += 1;
        }
        if let Some(position) = expired_up_to {
            self.cursor.mark_delete(position).await?;
            debug!(topic = %self.topic_name, subscription = %self.name,
                expired, up_to = %position, "expired messages");
        }
        Ok(expired)
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod subscription_tests;

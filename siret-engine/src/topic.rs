use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use siret_core::message::{Position, StreamMessage};
use siret_core::storage::{LogError, OrderedLog, StartPosition};

use crate::compaction::{CompactionStatus, Compactor};
use crate::consumer::Consumer;
use crate::cursor_kind::CursorKind;
use crate::dedup::{DedupDecision, DedupStatus, MessageDeduplication};
use crate::engine_metrics::{
    TOPICS_GC_DELETED_TOTAL, TOPIC_ACTIVE_PRODUCERS, TOPIC_ACTIVE_REPLICATORS,
    TOPIC_ACTIVE_SUBSCRIPTIONS, TOPIC_BYTES_IN_TOTAL, TOPIC_MESSAGES_IN_TOTAL,
    TOPIC_PUBLISH_DUPLICATES_TOTAL, TOPIC_PUBLISH_FAILURES_TOTAL,
};
use crate::errors::{Result, TopicError};
use crate::policies::{namespace_of, PolicySource, TopicPolicies};
use crate::producer::Producer;
use crate::replicator::{RemoteSink, Replicator};
use crate::subscription::{SubType, Subscription};

#[cfg(test)]
#[path = "topic_tests.rs"]
mod topic_tests;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopicState {
    Active,
    Fenced,
    Closed,
    Deleted,
}

/// Result of a publish: either a freshly persisted position, or an
/// acknowledgement that the sequence id was already admitted for this
/// producer and no new entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Persisted(Position),
    Duplicate,
}

/// How a consumer wants to attach to a topic.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub subscription_name: String,
    pub consumer_name: String,
    pub sub_type: SubType,
    pub durable: bool,
    /// Start for a cursor that does not exist yet; an existing durable
    /// cursor keeps its position.
    pub initial_position: StartPosition,
    pub read_compacted: bool,
    pub supports_batching: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        SubscriptionOptions {
            subscription_name: String::new(),
            consumer_name: String::new(),
            sub_type: SubType::Exclusive,
            durable: true,
            initial_position: StartPosition::Latest,
            read_compacted: false,
            supports_batching: true,
        }
    }
}

pub(crate) type TopicMap = DashMap<String, Arc<PersistentTopic>>;

// PersistentTopic
//
// The aggregate root of one named pub/sub topic backed by an ordered log.
// Owns admission control for producers and consumers, the dedup-gated
// publish path, subscription and replicator registries, compaction state,
// and the open -> active -> fenced -> closed/deleted lifecycle.
//
// Topic string representation:  /{namespace}/{topic-name}
//
#[derive(Debug)]
pub struct PersistentTopic {
    pub topic_name: String,
    log: Arc<dyn OrderedLog>,
    policy_source: Arc<dyn PolicySource>,
    sink: Arc<dyn RemoteSink>,
    local_cluster: String,
    // Admission paths hold the read side; close/delete take the write side.
    state: RwLock<TopicState>,
    // producer_name -> Producer
    producers: DashMap<String, Producer>,
    // subscription_name -> Subscription
    subscriptions: DashMap<String, Arc<Subscription>>,
    // remote_cluster -> Replicator
    replicators: DashMap<String, Arc<Replicator>>,
    dedup: MessageDeduplication,
    compactor: Arc<Compactor>,
    // producers + consumers currently attached
    usage_count: AtomicUsize,
    last_active: AtomicU64,
    has_batch_entries: AtomicBool,
    encryption_required: AtomicBool,
    // registry backing the fenced-log close-and-reopen path
    topics: Arc<TopicMap>,
}

impl PersistentTopic {
    /// Open a topic over its log, replaying every durable cursor into a
    /// subscription or replicator according to its name.
    pub(crate) async fn open(
        topic_name: &str,
        log: Arc<dyn OrderedLog>,
        policy_source: Arc<dyn PolicySource>,
        sink: Arc<dyn RemoteSink>,
        local_cluster: &str,
        topics: Arc<TopicMap>,
    ) -> Result<Arc<Self>> {
        let policies = match policy_source
            .namespace_policies(namespace_of(topic_name))
            .await
        {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => {
                warn!(topic = topic_name, error = %e,
                    "policy fetch failed on open, starting with defaults");
                TopicPolicies::default()
            }
        };

        let topic = Arc::new(PersistentTopic {
            topic_name: topic_name.to_string(),
            log: log.clone(),
            policy_source,
            sink,
            local_cluster: local_cluster.to_string(),
            state: RwLock::new(TopicState::Active),
            producers: DashMap::new(),
            subscriptions: DashMap::new(),
            replicators: DashMap::new(),
            dedup: MessageDeduplication::new(policies.deduplication_enabled),
            compactor: Arc::new(Compactor::new()),
            usage_count: AtomicUsize::new(0),
            last_active: AtomicU64::new(now_millis()),
            has_batch_entries: AtomicBool::new(false),
            encryption_required: AtomicBool::new(policies.encryption_required),
            topics,
        });

        for cursor_name in log.cursor_names().await {
            match CursorKind::parse(&cursor_name) {
                CursorKind::Subscription(name) => {
                    let cursor = log.open_cursor(&name, StartPosition::Latest).await?;
                    let subscription = Arc::new(Subscription::new(
                        topic_name,
                        &name,
                        SubType::Exclusive,
                        cursor,
                        false,
                        topic.compactor.clone(),
                    ));
                    topic.subscriptions.insert(name, subscription);
                }
                CursorKind::Replicator { remote_cluster } => {
                    let cursor = log.open_cursor(&cursor_name, StartPosition::Latest).await?;
                    let replicator = Replicator::new(
                        topic_name,
                        &remote_cluster,
                        cursor,
                        topic.sink.clone(),
                        policies.message_ttl_seconds,
                    );
                    topic.replicators.insert(remote_cluster, replicator);
                }
                // Engine-owned cursors carry no subscription state to replay.
                CursorKind::DedupMarker | CursorKind::Compaction => {}
            }
        }
        info!(topic = topic_name, subscriptions = topic.subscriptions.len(),
            replicators = topic.replicators.len(), "topic opened");
        Ok(topic)
    }

    pub async fn state(&self) -> TopicState {
        *self.state.read().await
    }

    pub fn usage_count(&self) -> usize {
        self.usage_count.load(Ordering::Acquire)
    }

    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub fn is_encryption_required(&self) -> bool {
        self.encryption_required.load(Ordering::Acquire)
    }

    pub fn has_batch_entries(&self) -> bool {
        self.has_batch_entries.load(Ordering::Acquire)
    }

    /// Record that the topic has carried at least one batched entry;
    /// subscribe gates batch-incompatible consumers on this.
    pub fn mark_batch_message_published(&self) {
        self.has_batch_entries.store(true, Ordering::Release);
    }

    fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Relaxed);
    }

    async fn check_active(&self) -> Result<tokio::sync::RwLockReadGuard<'_, TopicState>> {
        let guard = self.state.read().await;
        match *guard {
            TopicState::Fenced => Err(TopicError::Fenced),
            TopicState::Closed | TopicState::Deleted => Err(TopicError::Closed),
            TopicState::Active => Ok(guard),
        }
    }

    /// Attach a producer. Counted into `usage_count`; its name keys the
    /// deduplication window.
    pub async fn add_producer(&self, producer: Producer) -> Result<()> {
        let _state = self.check_active().await?;
        if self.log.is_terminated() {
            return Err(TopicError::Terminated);
        }

        let max = match self
            .policy_source
            .namespace_policies(namespace_of(&self.topic_name))
            .await
        {
            Ok(p) => p.map(|p| p.max_producers_per_topic).unwrap_or(0),
            Err(e) => {
                warn!(topic = %self.topic_name, error = %e,
                    "policy fetch failed, skipping producer limit check");
                0
            }
        };
        if max > 0 && self.producers.len() as u32 >= max {
            return Err(TopicError::ProducerBusy);
        }

        let name = producer.producer_name.clone();
        match self.producers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TopicError::NamingConflict(name));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(producer);
            }
        }
        self.usage_count.fetch_add(1, Ordering::AcqRel);
        self.dedup.producer_added(&name);
        self.touch();
        gauge!(TOPIC_ACTIVE_PRODUCERS.name).set(self.producers.len() as f64);
        // A producer coming back is the usual reason a stopped replicator
        // needs to move again.
        for replicator in self.replicators.iter() {
            replicator.start();
        }
        info!(topic = %self.topic_name, producer = %name, "producer attached");
        Ok(())
    }

    pub fn remove_producer(&self, producer_name: &str) {
        if self.producers.remove(producer_name).is_some() {
            self.usage_count.fetch_sub(1, Ordering::AcqRel);
            self.dedup.producer_removed(producer_name);
            self.touch();
            gauge!(TOPIC_ACTIVE_PRODUCERS.name).set(self.producers.len() as f64);
            info!(topic = %self.topic_name, producer = producer_name, "producer detached");
        }
    }

    /// The core data path: dedup-gated append to the ordered log.
    pub async fn publish(
        &self,
        producer_name: &str,
        mut message: StreamMessage,
    ) -> Result<PublishOutcome> {
        let _state = self.check_active().await?;
        if self.log.is_terminated() {
            return Err(TopicError::Terminated);
        }
        let origin = match self.producers.get(producer_name) {
            Some(producer) => producer.remote_cluster.clone(),
            None => {
                return Err(TopicError::NotAllowed(format!(
                    "producer {} is not attached to {}",
                    producer_name, self.topic_name
                )))
            }
        };
        message.origin_cluster = origin;
        if message.is_batch() {
            self.mark_batch_message_published();
        }

        match self.dedup.decide_publish(producer_name, message.sequence_id) {
            DedupDecision::Admit => {}
            DedupDecision::Duplicate => {
                counter!(TOPIC_PUBLISH_DUPLICATES_TOTAL.name).increment(1);
                debug!(topic = %self.topic_name, producer = producer_name,
                    sequence_id = message.sequence_id, "duplicate publish acknowledged");
                return Ok(PublishOutcome::Duplicate);
            }
            // The earlier publish of this id has not persisted yet; answering
            // Duplicate here would acknowledge a message that may still fail.
            DedupDecision::Unresolved => {
                return Err(TopicError::Busy(format!(
                    "sequence {} from producer {} is still in flight",
                    message.sequence_id, producer_name
                )));
            }
        }

        let sequence_id = message.sequence_id;
        let size = message.size() as u64;
        let bytes = message.encode()?;
        match self.log.append(bytes).await {
            Ok(position) => {
                self.dedup.record_persisted(producer_name, sequence_id);
                self.touch();
                counter!(TOPIC_MESSAGES_IN_TOTAL.name).increment(1);
                counter!(TOPIC_BYTES_IN_TOTAL.name).increment(size);
                Ok(PublishOutcome::Persisted(position))
            }
            Err(e) => {
                self.dedup.record_publish_failed(producer_name);
                counter!(TOPIC_PUBLISH_FAILURES_TOTAL.name).increment(1);
                if e == LogError::Fenced {
                    self.begin_close_on_fence();
                }
                Err(e.into())
            }
        }
    }

    /// Attach a consumer, creating or reusing the named subscription.
    pub async fn subscribe(
        &self,
        options: SubscriptionOptions,
    ) -> Result<(Arc<Subscription>, Consumer)> {
        let _state = self.check_active().await?;

        let name = options.subscription_name.trim();
        if name.is_empty() {
            return Err(TopicError::Naming("empty subscription name".to_string()));
        }
        if CursorKind::is_reserved_name(name) {
            return Err(TopicError::Naming(format!(
                "subscription name {} is reserved",
                name
            )));
        }
        if self.has_batch_entries() && !options.supports_batching {
            return Err(TopicError::UnsupportedVersion);
        }

        let subscription = match self.subscriptions.get(name) {
            Some(existing) => existing.clone(),
            None => {
                let cursor = if options.durable {
                    self.log.open_cursor(name, options.initial_position).await
                } else {
                    // When the requested position may sit inside a batch,
                    // step back one entry so no partial batch is skipped.
                    let start = match options.initial_position {
                        StartPosition::Position(p) if self.has_batch_entries() => {
                            StartPosition::Position(Position::new(
                                p.segment,
                                p.offset.saturating_sub(1),
                            ))
                        }
                        other => other,
                    };
                    self.log.new_nondurable_cursor(start).await
                };
                let cursor = match cursor {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        if e == LogError::Fenced {
                            self.begin_close_on_fence();
                            return Err(TopicError::Fenced);
                        }
                        return Err(TopicError::Persistence(e.to_string()));
                    }
                };
                let created = Arc::new(Subscription::new(
                    &self.topic_name,
                    name,
                    options.sub_type,
                    cursor,
                    options.read_compacted,
                    self.compactor.clone(),
                ));
                self.subscriptions
                    .entry(name.to_string())
                    .or_insert(created)
                    .clone()
            }
        };

        let consumer = subscription
            .add_consumer(&options.consumer_name, options.sub_type)
            .await?;
        self.usage_count.fetch_add(1, Ordering::AcqRel);
        self.touch();
        gauge!(TOPIC_ACTIVE_SUBSCRIPTIONS.name).set(self.subscriptions.len() as f64);
        info!(topic = %self.topic_name, subscription = name,
            consumer = %options.consumer_name, "consumer subscribed");
        Ok((subscription, consumer))
    }

    /// Detach a consumer; a drained non-durable subscription is dropped with
    /// its cursor.
    pub async fn remove_consumer(&self, subscription_name: &str, consumer_id: u64) {
        let Some(subscription) = self
            .subscriptions
            .get(subscription_name)
            .map(|s| s.value().clone())
        else {
            return;
        };
        if subscription.remove_consumer(consumer_id).await {
            self.usage_count.fetch_sub(1, Ordering::AcqRel);
            self.touch();
        }
        if !subscription.is_durable() && !subscription.has_consumers() {
            self.subscriptions.remove(subscription_name);
            gauge!(TOPIC_ACTIVE_SUBSCRIPTIONS.name).set(self.subscriptions.len() as f64);
        }
    }

    /// Remove a subscription and delete its durable cursor.
    pub async fn unsubscribe(&self, subscription_name: &str) -> Result<()> {
        let Some(subscription) = self
            .subscriptions
            .get(subscription_name)
            .map(|s| s.value().clone())
        else {
            return Err(TopicError::NotAllowed(format!(
                "subscription {} does not exist",
                subscription_name
            )));
        };
        if subscription.has_consumers() {
            return Err(TopicError::Busy(format!(
                "subscription {} has connected consumers",
                subscription_name
            )));
        }
        self.subscriptions.remove(subscription_name);
        if subscription.is_durable() {
            match self.log.delete_cursor(subscription_name).await {
                Ok(()) | Err(LogError::CursorNotFound(_)) => {}
                Err(e) => return Err(TopicError::Persistence(e.to_string())),
            }
        }
        gauge!(TOPIC_ACTIVE_SUBSCRIPTIONS.name).set(self.subscriptions.len() as f64);
        info!(topic = %self.topic_name, subscription = subscription_name, "unsubscribed");
        Ok(())
    }

    pub fn subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(name).map(|s| s.value().clone())
    }

    fn disconnect_clients(&self) {
        for replicator in self.replicators.iter() {
            replicator.disconnect();
        }
        for subscription in self.subscriptions.iter() {
            subscription.disconnect_all();
        }
        let producer_names: Vec<String> =
            self.producers.iter().map(|p| p.key().clone()).collect();
        for name in producer_names {
            self.dedup.producer_removed(&name);
        }
        self.producers.clear();
        self.usage_count.store(0, Ordering::Release);
        gauge!(TOPIC_ACTIVE_PRODUCERS.name).set(0.0);
    }

    /// Fence, disconnect every client, close the log, and evict the topic
    /// from the registry so the next lookup reopens fresh.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if matches!(*state, TopicState::Closed | TopicState::Deleted) {
            return Ok(());
        }
        let previous = *state;
        *state = TopicState::Fenced;

        self.disconnect_clients();
        if let Err(e) = self.log.close().await {
            *state = previous;
            return Err(TopicError::Persistence(e.to_string()));
        }
        *state = TopicState::Closed;
        self.topics.remove(&self.topic_name);
        info!(topic = %self.topic_name, "topic closed");
        Ok(())
    }

    /// Delete the topic: fence, optionally force-disconnect clients, delete
    /// every durable cursor and then the log itself. Any failure restores
    /// the pre-delete state so the topic stays usable.
    pub async fn delete(
        &self,
        fail_if_has_subscriptions: bool,
        close_if_clients_connected: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if matches!(*state, TopicState::Closed | TopicState::Deleted) {
            return Err(TopicError::Closed);
        }
        let previous = *state;
        *state = TopicState::Fenced;

        if !close_if_clients_connected && self.usage_count() > 0 {
            *state = previous;
            return Err(TopicError::Busy(format!(
                "topic has {} attached clients",
                self.usage_count()
            )));
        }
        if fail_if_has_subscriptions && !self.subscriptions.is_empty() {
            *state = previous;
            return Err(TopicError::Busy("topic has subscriptions".to_string()));
        }
        if close_if_clients_connected {
            self.disconnect_clients();
        }

        let mut cursor_names: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|s| s.is_durable())
            .map(|s| s.name.clone())
            .collect();
        cursor_names.extend(
            self.replicators
                .iter()
                .map(|r| CursorKind::replicator(r.key()).encode()),
        );
        let deletions = join_all(
            cursor_names
                .iter()
                .map(|name| self.log.delete_cursor(name)),
        )
        .await;
        for result in deletions {
            match result {
                Ok(()) | Err(LogError::CursorNotFound(_)) => {}
                Err(e) => {
                    *state = previous;
                    return Err(TopicError::Persistence(e.to_string()));
                }
            }
        }

        if let Err(e) = self.log.delete().await {
            *state = previous;
            return Err(TopicError::Persistence(e.to_string()));
        }

        self.subscriptions.clear();
        self.replicators.clear();
        *state = TopicState::Deleted;
        self.topics.remove(&self.topic_name);
        gauge!(TOPIC_ACTIVE_SUBSCRIPTIONS.name).set(0.0);
        gauge!(TOPIC_ACTIVE_REPLICATORS.name).set(0.0);
        info!(topic = %self.topic_name, "topic deleted");
        Ok(())
    }

    /// Seal the log against further appends. Producers are disconnected;
    /// consumers may drain the remaining backlog.
    pub async fn terminate(&self) -> Result<Position> {
        let _state = self.check_active().await?;
        let position = self.log.terminate().await?;
        let producer_names: Vec<String> =
            self.producers.iter().map(|p| p.key().clone()).collect();
        for name in &producer_names {
            self.dedup.producer_removed(name);
        }
        self.usage_count
            .fetch_sub(producer_names.len(), Ordering::AcqRel);
        self.producers.clear();
        gauge!(TOPIC_ACTIVE_PRODUCERS.name).set(0.0);
        info!(topic = %self.topic_name, last = %position, "topic terminated");
        Ok(position)
    }

    /// A fenced log means another writer owns it: evict ourselves and close
    /// in the background so the next lookup reopens a fresh instance.
    fn begin_close_on_fence(&self) {
        warn!(topic = %self.topic_name, "log fenced, closing topic for reopen");
        let topics = self.topics.clone();
        let topic_name = self.topic_name.clone();
        tokio::spawn(async move {
            if let Some((_, topic)) = topics.remove(&topic_name) {
                if let Err(e) = topic.close().await {
                    warn!(topic = %topic_name, error = %e, "close after fence failed");
                }
            }
        });
    }

    /// Reconcile the live replicator set against the namespace policy.
    ///
    /// A policy fetch failure skips the cycle. When the local cluster has
    /// been removed from a global namespace's replication set, the topic is
    /// force-deleted since it can no longer serve local traffic.
    pub async fn check_replication(&self) -> Result<()> {
        let policies = match self
            .policy_source
            .namespace_policies(namespace_of(&self.topic_name))
            .await
        {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => {
                warn!(topic = %self.topic_name, error = %e,
                    "policy fetch failed, skipping replication check");
                return Ok(());
            }
        };
        if !policies.global {
            return Ok(());
        }
        if !policies
            .replication_clusters
            .iter()
            .any(|c| c == &self.local_cluster)
        {
            info!(topic = %self.topic_name,
                "local cluster removed from replication set, deleting topic");
            return self.delete(false, true).await;
        }

        let configured: HashSet<&str> = policies
            .replication_clusters
            .iter()
            .map(|c| c.as_str())
            .filter(|c| *c != self.local_cluster)
            .collect();

        let mut work = Vec::new();
        for remote in &configured {
            if !self.replicators.contains_key(*remote) {
                let remote = remote.to_string();
                let ttl = policies.message_ttl_seconds;
                work.push(
                    async move { self.start_replicator(&remote, ttl).await }.boxed(),
                );
            }
        }
        let stale: Vec<String> = self
            .replicators
            .iter()
            .map(|r| r.key().clone())
            .filter(|remote| !configured.contains(remote.as_str()))
            .collect();
        for remote in stale {
            work.push(async move { self.stop_replicator(&remote).await }.boxed());
        }

        let results = join_all(work).await;
        for replicator in self.replicators.iter() {
            replicator.set_message_ttl(policies.message_ttl_seconds);
        }
        gauge!(TOPIC_ACTIVE_REPLICATORS.name).set(self.replicators.len() as f64);
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn start_replicator(&self, remote_cluster: &str, ttl_seconds: u32) -> Result<()> {
        let cursor_name = CursorKind::replicator(remote_cluster).encode();
        let cursor = self
            .log
            .open_cursor(&cursor_name, StartPosition::Latest)
            .await?;
        let replicator = Replicator::new(
            &self.topic_name,
            remote_cluster,
            cursor,
            self.sink.clone(),
            ttl_seconds,
        );
        replicator.start();
        self.replicators
            .insert(remote_cluster.to_string(), replicator);
        info!(topic = %self.topic_name, remote = remote_cluster, "replicator added");
        Ok(())
    }

    async fn stop_replicator(&self, remote_cluster: &str) -> Result<()> {
        if let Some((_, replicator)) = self.replicators.remove(remote_cluster) {
            replicator.disconnect();
            let cursor_name = CursorKind::replicator(remote_cluster).encode();
            match self.log.delete_cursor(&cursor_name).await {
                Ok(()) | Err(LogError::CursorNotFound(_)) => {}
                Err(e) => return Err(TopicError::Persistence(e.to_string())),
            }
            info!(topic = %self.topic_name, remote = remote_cluster, "replicator removed");
        }
        Ok(())
    }

    pub fn replicator(&self, remote_cluster: &str) -> Option<Arc<Replicator>> {
        self.replicators.get(remote_cluster).map(|r| r.value().clone())
    }

    pub fn replicator_count(&self) -> usize {
        self.replicators.len()
    }

    /// Garbage-collect the topic if it has been inactive past `gc_interval`
    /// and retention policy permits. Returns true when the topic was
    /// deleted. A `Busy` delete failure means it became active again.
    pub async fn check_gc(&self, gc_interval: Duration) -> Result<bool> {
        if self.usage_count() > 0 {
            self.touch();
            return Ok(false);
        }
        let idle_ms = now_millis().saturating_sub(self.last_active());
        if idle_ms < gc_interval.as_millis() as u64 {
            return Ok(false);
        }

        let policies = match self
            .policy_source
            .namespace_policies(namespace_of(&self.topic_name))
            .await
        {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => {
                warn!(topic = %self.topic_name, error = %e,
                    "policy fetch failed, skipping gc check");
                return Ok(false);
            }
        };
        if let Some(retention) = policies.retention {
            if retention.retention_time_minutes < 0 {
                return Ok(false);
            }
            let retain_ms = retention.retention_time_minutes as u64 * 60_000;
            if idle_ms < retain_ms {
                return Ok(false);
            }
        }
        if policies.global {
            for replicator in self.replicators.iter() {
                replicator.disconnect();
            }
            if self.producers.iter().any(|p| p.is_remote()) {
                return Ok(false);
            }
        }

        match self.delete(true, false).await {
            Ok(()) => {
                counter!(TOPICS_GC_DELETED_TOTAL.name).increment(1);
                Ok(true)
            }
            Err(TopicError::Busy(_)) => {
                debug!(topic = %self.topic_name, "gc skipped, topic became active");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// TTL-based expiry across durable subscriptions; failures are logged
    /// and skipped for the cycle.
    pub async fn check_message_expiry(&self) {
        let policies = match self
            .policy_source
            .namespace_policies(namespace_of(&self.topic_name))
            .await
        {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => {
                warn!(topic = %self.topic_name, error = %e,
                    "policy fetch failed, skipping expiry check");
                return;
            }
        };
        if policies.message_ttl_seconds == 0 {
            return;
        }
        let ttl = Duration::from_secs(u64::from(policies.message_ttl_seconds));
        let subscriptions: Vec<Arc<Subscription>> =
            self.subscriptions.iter().map(|s| s.value().clone()).collect();
        for subscription in subscriptions {
            if let Err(e) = subscription.expire_messages(&self.log, ttl).await {
                warn!(topic = %self.topic_name, subscription = %subscription.name,
                    error = %e, "message expiry failed");
            }
        }
    }

    /// Drop durable subscriptions with no consumer whose cursor has been
    /// idle past `expiry`. Returns the removed names.
    pub async fn check_inactive_subscriptions(&self, expiry: Duration) -> Vec<String> {
        let cutoff = now_millis().saturating_sub(expiry.as_millis() as u64);
        let candidates: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|s| s.is_durable() && !s.has_consumers() && s.last_active() <= cutoff)
            .map(|s| s.name.clone())
            .collect();
        let mut removed = Vec::new();
        for name in candidates {
            match self.unsubscribe(&name).await {
                Ok(()) => removed.push(name),
                Err(e) => {
                    debug!(topic = %self.topic_name, subscription = %name, error = %e,
                        "inactive subscription not removed");
                }
            }
        }
        removed
    }

    /// Trigger compaction when the backlog size crosses the policy
    /// threshold. A concurrent run is not an error.
    pub async fn check_compaction(&self) {
        let policies = match self
            .policy_source
            .namespace_policies(namespace_of(&self.topic_name))
            .await
        {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => {
                warn!(topic = %self.topic_name, error = %e,
                    "policy fetch failed, skipping compaction check");
                return;
            }
        };
        if policies.compaction_threshold == 0 {
            return;
        }
        if self.log.size_bytes().await < policies.compaction_threshold {
            return;
        }
        match self.trigger_compaction().await {
            Ok(_) | Err(TopicError::AlreadyRunning) => {}
            Err(e) => {
                warn!(topic = %self.topic_name, error = %e, "threshold compaction failed");
            }
        }
    }

    /// Re-derive deduplication enablement from the namespace policy.
    pub async fn check_deduplication_status(&self) {
        match self
            .policy_source
            .namespace_policies(namespace_of(&self.topic_name))
            .await
        {
            Ok(p) => {
                let enabled = p.map(|p| p.deduplication_enabled).unwrap_or(false);
                self.dedup.set_enabled(enabled);
            }
            Err(e) => {
                warn!(topic = %self.topic_name, error = %e,
                    "policy fetch failed, dedup status unchanged");
            }
        }
    }

    pub fn purge_inactive_producers(&self, grace: Duration) {
        self.dedup.purge_inactive_producers(grace);
    }

    pub fn deduplication_status(&self) -> DedupStatus {
        self.dedup.status()
    }

    pub fn last_persisted_sequence(&self, producer_name: &str) -> Option<u64> {
        self.dedup.last_persisted_sequence(producer_name)
    }

    /// Position of the newest persisted entry, `None` for an empty topic.
    pub async fn get_last_message_id(&self) -> Result<Option<Position>> {
        Ok(self.log.last_confirmed().await?)
    }

    /// Apply a pushed policy update: dedup enablement, encryption flag,
    /// replicator TTLs, then a full replication reconcile.
    pub async fn on_policies_update(&self, policies: &TopicPolicies) {
        self.dedup.set_enabled(policies.deduplication_enabled);
        self.encryption_required
            .store(policies.encryption_required, Ordering::Release);
        for replicator in self.replicators.iter() {
            replicator.set_message_ttl(policies.message_ttl_seconds);
        }
        if let Err(e) = self.check_replication().await {
            warn!(topic = %self.topic_name, error = %e,
                "replication reconcile after policy update failed");
        }
    }

    /// One compaction run to the current tail. Fails with `AlreadyRunning`
    /// while another run is in flight.
    pub async fn trigger_compaction(&self) -> Result<Position> {
        self.compactor
            .compact(&self.topic_name, self.log.clone())
            .await
    }

    pub async fn compaction_status(&self) -> CompactionStatus {
        self.compactor.status().await
    }

    /// Drop the unread backlog of every subscription.
    pub async fn clear_backlog(&self) -> Result<()> {
        let subscriptions: Vec<Arc<Subscription>> =
            self.subscriptions.iter().map(|s| s.value().clone()).collect();
        let results = join_all(
            subscriptions
                .iter()
                .map(|s| s.clear_backlog(&self.log)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    pub async fn clear_subscription_backlog(&self, subscription_name: &str) -> Result<()> {
        let Some(subscription) = self
            .subscriptions
            .get(subscription_name)
            .map(|s| s.value().clone())
        else {
            return Err(TopicError::NotAllowed(format!(
                "subscription {} does not exist",
                subscription_name
            )));
        };
        subscription.clear_backlog(&self.log).await
    }

    pub async fn get_stats(&self) -> TopicStats {
        let mut subscriptions = Vec::with_capacity(self.subscriptions.len());
        let handles: Vec<Arc<Subscription>> =
            self.subscriptions.iter().map(|s| s.value().clone()).collect();
        for subscription in handles {
            subscriptions.push(SubscriptionStats {
                name: subscription.name.clone(),
                durable: subscription.is_durable(),
                consumer_count: subscription.consumer_count(),
                backlog: subscription.backlog().await,
            });
        }
        TopicStats {
            topic_name: self.topic_name.clone(),
            state: self.state().await,
            producer_count: self.producers.len(),
            subscription_count: subscriptions.len(),
            replicator_count: self.replicators.len(),
            entry_count: self.log.entry_count().await,
            size_bytes: self.log.size_bytes().await,
            deduplication_enabled: self.dedup.is_enabled(),
            last_active: self.last_active(),
            subscriptions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub name: String,
    pub durable: bool,
    pub consumer_count: usize,
    pub backlog: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub topic_name: String,
    pub state: TopicState,
    pub producer_count: usize,
    pub subscription_count: usize,
    pub replicator_count: usize,
    pub entry_count: u64,
    pub size_bytes: u64,
    pub deduplication_enabled: bool,
    pub last_active: u64,
    pub subscriptions: Vec<SubscriptionStats>,
}

impl TopicStats {
    /// JSON form served by the admin status surface.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

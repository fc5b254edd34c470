use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use siret_core::storage::LogFactory;

use crate::errors::Result;
use crate::policies::PolicySource;
use crate::replicator::RemoteSink;
use crate::topic::{PersistentTopic, TopicMap};

/// Arena of live topics addressed by name.
///
/// Lookup opens the topic on demand, replaying its durable cursors; close,
/// delete, and the fenced-log path evict the entry so the next lookup gets a
/// fresh instance instead of a wedged one.
#[derive(Debug)]
pub struct TopicRegistry {
    topics: Arc<TopicMap>,
    log_factory: Arc<dyn LogFactory>,
    policy_source: Arc<dyn PolicySource>,
    sink: Arc<dyn RemoteSink>,
    local_cluster: String,
}

impl TopicRegistry {
    pub fn new(
        log_factory: Arc<dyn LogFactory>,
        policy_source: Arc<dyn PolicySource>,
        sink: Arc<dyn RemoteSink>,
        local_cluster: &str,
    ) -> Self {
        TopicRegistry {
            topics: Arc::new(DashMap::new()),
            log_factory,
            policy_source,
            sink,
            local_cluster: local_cluster.to_string(),
        }
    }

    pub fn get(&self, topic_name: &str) -> Option<Arc<PersistentTopic>> {
        self.topics.get(topic_name).map(|t| t.value().clone())
    }

    /// Live topic for `topic_name`, opening it when absent.
    pub async fn get_or_open(&self, topic_name: &str) -> Result<Arc<PersistentTopic>> {
        if let Some(existing) = self.topics.get(topic_name) {
            return Ok(existing.value().clone());
        }
        let log = self.log_factory.open(topic_name).await?;
        let topic = PersistentTopic::open(
            topic_name,
            log,
            self.policy_source.clone(),
            self.sink.clone(),
            &self.local_cluster,
            self.topics.clone(),
        )
        .await?;
        // A concurrent open may have won the race; keep whichever landed.
        let topic = self
            .topics
            .entry(topic_name.to_string())
            .or_insert(topic)
            .value()
            .clone();
        Ok(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.key().clone()).collect()
    }

    /// Run one garbage-collection pass over every live topic; returns the
    /// names of the topics that were deleted.
    pub async fn gc_cycle(&self, gc_interval: Duration) -> Vec<String> {
        let topics: Vec<Arc<PersistentTopic>> =
            self.topics.iter().map(|t| t.value().clone()).collect();
        let mut deleted = Vec::new();
        for topic in topics {
            match topic.check_gc(gc_interval).await {
                Ok(true) => deleted.push(topic.topic_name.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(topic = %topic.topic_name, error = %e, "gc pass failed");
                }
            }
        }
        if !deleted.is_empty() {
            info!(count = deleted.len(), "gc deleted inactive topics");
        }
        deleted
    }

    /// Close every live topic, aggregating the first failure.
    pub async fn close_all(&self) -> Result<()> {
        let topics: Vec<Arc<PersistentTopic>> =
            self.topics.iter().map(|t| t.value().clone()).collect();
        let results = join_all(topics.iter().map(|t| t.close())).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

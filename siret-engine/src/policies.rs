use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{Result, TopicError};

/// Time-based retention for inactive topics.
///
/// A negative retention time means the topic is retained indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub retention_time_minutes: i64,
}

/// Per-namespace policies the topic engine reacts to.
///
/// These come from the external configuration store; the engine polls them
/// on demand and re-derives replicator set, dedup enablement and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TopicPolicies {
    /// Clusters this namespace replicates to. Only meaningful when `global`.
    pub replication_clusters: Vec<String>,
    /// Namespaces replicated across clusters; non-global topics never
    /// reconcile replicators.
    pub global: bool,
    /// 0 disables message expiry.
    pub message_ttl_seconds: u32,
    /// 0 means unlimited.
    pub max_producers_per_topic: u32,
    pub retention: Option<RetentionPolicy>,
    pub encryption_required: bool,
    /// Backlog bytes that trigger automatic compaction; 0 disables.
    pub compaction_threshold: u64,
    pub deduplication_enabled: bool,
}

/// Boundary to the external configuration store.
#[async_trait]
pub trait PolicySource: Send + Sync + std::fmt::Debug {
    async fn namespace_policies(&self, namespace: &str) -> Result<Option<TopicPolicies>>;
}

/// Namespace of a `/{namespace}/{topic}` name.
pub(crate) fn namespace_of(topic_name: &str) -> &str {
    topic_name
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
}

/// In-memory policy source for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryPolicySource {
    inner: DashMap<String, TopicPolicies>,
    unavailable: AtomicBool,
}

impl MemoryPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, namespace: &str, policies: TopicPolicies) {
        self.inner.insert(namespace.to_string(), policies);
    }

    pub fn remove(&self, namespace: &str) {
        self.inner.remove(namespace);
    }

    /// Make every lookup fail, to exercise the skip-on-metadata-failure
    /// paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }
}

#[async_trait]
impl PolicySource for MemoryPolicySource {
    async fn namespace_policies(&self, namespace: &str) -> Result<Option<TopicPolicies>> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(TopicError::Metadata(
                "policy store unavailable".to_string(),
            ));
        }
        Ok(self.inner.get(namespace).map(|p| p.value().clone()))
    }
}

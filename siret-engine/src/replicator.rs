use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use siret_core::message::StreamMessage;
use siret_core::storage::{LogCursor, StartPosition};

use crate::errors::Result;

const REPLICATION_BATCH: usize = 100;
const IDLE_POLL: Duration = Duration::from_millis(50);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Outbound boundary to a remote cluster's copy of the topic.
///
/// The engine never speaks the wire protocol itself; whatever client layer
/// connects the clusters implements this and deals with retries below it.
#[async_trait]
pub trait RemoteSink: Send + Sync + std::fmt::Debug {
    async fn send(
        &self,
        remote_cluster: &str,
        topic_name: &str,
        message: StreamMessage,
    ) -> Result<()>;
}

const STATE_STOPPED: u8 = 0;
const STATE_STARTED: u8 = 1;

/// A cursor-driven agent forwarding the topic's backlog to one remote
/// cluster.
///
/// Entries that originated from the target cluster are acknowledged without
/// forwarding, so a message never echoes back to where it came from. Entries
/// older than the policy message TTL are likewise acknowledged and skipped.
#[derive(Debug)]
pub struct Replicator {
    pub topic_name: String,
    pub remote_cluster: String,
    cursor: Arc<dyn LogCursor>,
    sink: Arc<dyn RemoteSink>,
    state: AtomicU8,
    message_ttl_seconds: AtomicU32,
    shutdown: Notify,
}

impl Replicator {
    pub(crate) fn new(
        topic_name: &str,
        remote_cluster: &str,
        cursor: Arc<dyn LogCursor>,
        sink: Arc<dyn RemoteSink>,
        message_ttl_seconds: u32,
    ) -> Arc<Self> {
        Arc::new(Replicator {
            topic_name: topic_name.to_string(),
            remote_cluster: remote_cluster.to_string(),
            cursor,
            sink,
            state: AtomicU8::new(STATE_STOPPED),
            message_ttl_seconds: AtomicU32::new(message_ttl_seconds),
            shutdown: Notify::new(),
        })
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STARTED
    }

    /// 0 disables TTL-based skipping.
    pub fn set_message_ttl(&self, seconds: u32) {
        self.message_ttl_seconds.store(seconds, Ordering::Release);
    }

    pub fn message_ttl(&self) -> u32 {
        self.message_ttl_seconds.load(Ordering::Acquire)
    }

    pub async fn backlog(&self) -> u64 {
        self.cursor.backlog().await
    }

    /// Spawn the forwarding loop. Idempotent: a second start on a running
    /// replicator is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                STATE_STOPPED,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        info!(topic = %self.topic_name, remote = %self.remote_cluster, "replicator started");
        let replicator = self.clone();
        tokio::spawn(async move {
            while replicator.is_started() {
                match replicator.replicate_once().await {
                    Ok(0) => {
                        tokio::select! {
                            _ = replicator.shutdown.notified() => {}
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                        }
                    }
                    Ok(forwarded) => {
                        debug!(topic = %replicator.topic_name,
                            remote = %replicator.remote_cluster, forwarded,
                            "replicated batch");
                    }
                    Err(e) => {
                        warn!(topic = %replicator.topic_name,
                            remote = %replicator.remote_cluster, error = %e,
                            "replication batch failed, backing off");
                        tokio::select! {
                            _ = replicator.shutdown.notified() => {}
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                        }
                    }
                }
            }
        });
    }

    /// Stop the forwarding loop. The cursor stays durable; replication
    /// resumes where it left off on the next start.
    pub fn disconnect(&self) {
        if self
            .state
            .compare_exchange(
                STATE_STARTED,
                STATE_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(topic = %self.topic_name, remote = %self.remote_cluster,
                "replicator disconnected");
        }
        self.shutdown.notify_waiters();
    }

    /// Drain one batch of backlog: forward what qualifies, acknowledge
    /// everything read. Returns the number of entries forwarded.
    pub async fn replicate_once(&self) -> Result<u64> {
        let batch = self.cursor.read_next(REPLICATION_BATCH).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let ttl = self.message_ttl();
        let cutoff = if ttl == 0 {
            0
        } else {
            now_millis().saturating_sub(u64::from(ttl) * 1000)
        };

        let mut forwarded = 0u64;
        let mut last_position = None;
        for (position, bytes) in batch {
            let message = StreamMessage::decode(&bytes)?;
            let echo = message.origin_cluster.as_deref() == Some(self.remote_cluster.as_str());
            let expired = cutoff > 0 && message.publish_time < cutoff;
            if !echo && !expired {
                if let Err(e) = self
                    .sink
                    .send(&self.remote_cluster, &self.topic_name, message)
                    .await
                {
                    // Settle what already went out, rewind to the failed
                    // entry so the next pass re-reads it.
                    if let Some(acked) = last_position {
                        self.cursor.mark_delete(acked).await?;
                    }
                    self.cursor.seek(StartPosition::Position(position)).await?;
                    return Err(e);
                }
                forwarded += 1;
            }
            last_position = Some(position);
        }
        if let Some(position) = last_position {
            self.cursor.mark_delete(position).await?;
        }
        Ok(forwarded)
    }
}

#[cfg(test)]
#[path = "replicator_tests.rs"]
mod replicator_tests;

use super::*;
use siret_core::storage::{LogFactory, OrderedLog, StartPosition};
use siret_storage::MemoryLogFactory;
use std::sync::atomic::AtomicBool;
use tokio::sync::Mutex;

use crate::errors::TopicError;

#[derive(Debug, Default)]
struct RecordingSink {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail_next: AtomicBool,
}

impl RecordingSink {
    async fn payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().await.iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl RemoteSink for RecordingSink {
    async fn send(
        &self,
        remote_cluster: &str,
        _topic_name: &str,
        message: StreamMessage,
    ) -> crate::errors::Result<()> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(TopicError::Persistence("remote unavailable".to_string()));
        }
        self.sent
            .lock()
            .await
            .push((remote_cluster.to_string(), message.payload));
        Ok(())
    }
}

fn msg(seq: u64, origin: Option<&str>, payload: &[u8]) -> StreamMessage {
    StreamMessage {
        producer_name: "p1".to_string(),
        sequence_id: seq,
        publish_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64,
        origin_cluster: origin.map(|o| o.to_string()),
        partition_key: None,
        payload: payload.to_vec(),
        batch: None,
    }
}

async fn mk_replicator(topic: &str) -> (Arc<dyn OrderedLog>, Arc<RecordingSink>, Arc<Replicator>) {
    let log = MemoryLogFactory::new().open(topic).await.unwrap();
    let cursor = log
        .open_cursor("siret.repl.us-west", StartPosition::Earliest)
        .await
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let replicator = Replicator::new(topic, "us-west", cursor, sink.clone(), 0);
    (log, sink, replicator)
}

/// What this test validates
///
/// - Scenario: three local entries in the backlog, one drain pass.
/// - Expectation: all three are forwarded in log order and the cursor is
///   fully acknowledged.
#[tokio::test]
async fn forwards_backlog_in_order() {
    let (log, sink, replicator) = mk_replicator("/default/fwd").await;
    for (seq, payload) in [b"a", b"b", b"c"].iter().enumerate() {
        log.append(msg(seq as u64, None, *payload).encode().unwrap())
            .await
            .unwrap();
    }

    let forwarded = replicator.replicate_once().await.unwrap();
    assert_eq!(forwarded, 3);
    assert_eq!(
        sink.payloads().await,
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
    assert_eq!(replicator.backlog().await, 0);
}

/// What this test validates
///
/// - Scenario: an entry that was itself replicated in from the target
///   cluster sits between two local entries.
/// - Expectation: it is acknowledged but never forwarded back.
#[tokio::test]
async fn does_not_echo_to_origin_cluster() {
    let (log, sink, replicator) = mk_replicator("/default/echo").await;
    log.append(msg(0, None, b"local0").encode().unwrap())
        .await
        .unwrap();
    log.append(msg(1, Some("us-west"), b"inbound").encode().unwrap())
        .await
        .unwrap();
    log.append(msg(2, Some("eu-central"), b"third-party").encode().unwrap())
        .await
        .unwrap();

    let forwarded = replicator.replicate_once().await.unwrap();
    assert_eq!(forwarded, 2);
    assert_eq!(
        sink.payloads().await,
        vec![b"local0".to_vec(), b"third-party".to_vec()]
    );
    assert_eq!(replicator.backlog().await, 0);
}

/// What this test validates
///
/// - Scenario: a stale entry older than the replicator's message TTL.
/// - Expectation: it is skipped and acknowledged, fresh entries still flow.
#[tokio::test]
async fn skips_entries_older_than_ttl() {
    let (log, sink, replicator) = mk_replicator("/default/ttl").await;
    replicator.set_message_ttl(60);

    let mut stale = msg(0, None, b"stale");
    stale.publish_time = 1000;
    log.append(stale.encode().unwrap()).await.unwrap();
    log.append(msg(1, None, b"fresh").encode().unwrap())
        .await
        .unwrap();

    let forwarded = replicator.replicate_once().await.unwrap();
    assert_eq!(forwarded, 1);
    assert_eq!(sink.payloads().await, vec![b"fresh".to_vec()]);
}

/// What this test validates
///
/// - Scenario: the remote sink fails on the first entry of a batch.
/// - Expectation: the pass errors, nothing is acknowledged, and the next
///   pass re-reads the whole batch and delivers it in order.
#[tokio::test]
async fn failed_send_rewinds_to_failed_entry() {
    let (log, sink, replicator) = mk_replicator("/default/retry").await;
    log.append(msg(0, None, b"a").encode().unwrap())
        .await
        .unwrap();
    log.append(msg(1, None, b"b").encode().unwrap())
        .await
        .unwrap();

    sink.fail_next.store(true, Ordering::Release);
    let err = replicator.replicate_once().await.unwrap_err();
    assert!(matches!(err, TopicError::Persistence(_)));
    assert!(sink.payloads().await.is_empty());
    assert_eq!(replicator.backlog().await, 2);

    let forwarded = replicator.replicate_once().await.unwrap();
    assert_eq!(forwarded, 2);
    assert_eq!(sink.payloads().await, vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(replicator.backlog().await, 0);
}

/// What this test validates
///
/// - Scenario: start, then disconnect.
/// - Expectation: state transitions are observable and idempotent.
#[tokio::test]
async fn start_and_disconnect_are_idempotent() {
    let (_log, _sink, replicator) = mk_replicator("/default/state").await;
    assert!(!replicator.is_started());
    replicator.start();
    replicator.start();
    assert!(replicator.is_started());
    replicator.disconnect();
    replicator.disconnect();
    assert!(!replicator.is_started());
}

use super::*;
use siret_core::storage::{LogFactory, OrderedLog};
use siret_storage::MemoryLogFactory;

fn msg(seq: u64, key: Option<&str>, payload: &[u8]) -> StreamMessage {
    StreamMessage {
        producer_name: "p1".to_string(),
        sequence_id: seq,
        publish_time: now_millis(),
        origin_cluster: None,
        partition_key: key.map(|k| k.to_string()),
        payload: payload.to_vec(),
        batch: None,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

async fn mk_subscription(
    topic: &str,
    sub_type: SubType,
    read_compacted: bool,
) -> (Arc<dyn OrderedLog>, Arc<Compactor>, Subscription) {
    let log = MemoryLogFactory::new().open(topic).await.unwrap();
    let cursor = log
        .open_cursor("test-sub", StartPosition::Earliest)
        .await
        .unwrap();
    let compactor = Arc::new(Compactor::new());
    let sub = Subscription::new(
        topic,
        "test-sub",
        sub_type,
        cursor,
        read_compacted,
        compactor.clone(),
    );
    (log, compactor, sub)
}

/// What this test validates
///
/// - Scenario: two consumers attach to an exclusive subscription.
/// - Expectation: the second attach fails with `ConsumerBusy`; after the
///   first detaches, a new consumer is admitted.
#[tokio::test]
async fn exclusive_admits_one_consumer() {
    let (_log, _c, sub) = mk_subscription("/default/excl", SubType::Exclusive, false).await;
    let first = sub.add_consumer("c1", SubType::Exclusive).await.unwrap();
    let err = sub.add_consumer("c2", SubType::Exclusive).await.unwrap_err();
    assert!(matches!(err, TopicError::ConsumerBusy(_)));

    assert!(sub.remove_consumer(first.consumer_id).await);
    sub.add_consumer("c2", SubType::Exclusive).await.unwrap();
}

/// What this test validates
///
/// - Scenario: three consumers on a failover subscription; the active one
///   disconnects.
/// - Expectation: only the first is active initially; on removal the oldest
///   remaining consumer is promoted.
#[tokio::test]
async fn failover_promotes_oldest_on_disconnect() {
    let (_log, _c, sub) = mk_subscription("/default/fo", SubType::Failover, false).await;
    let c1 = sub.add_consumer("c1", SubType::Failover).await.unwrap();
    let c2 = sub.add_consumer("c2", SubType::Failover).await.unwrap();
    let c3 = sub.add_consumer("c3", SubType::Failover).await.unwrap();
    assert!(c1.is_active());
    assert!(!c2.is_active());
    assert!(!c3.is_active());

    sub.remove_consumer(c1.consumer_id).await;
    assert!(c2.is_active());
    assert!(!c3.is_active());
}

/// What this test validates
///
/// - Scenario: a consumer asks for a different type while another is still
///   connected, and again once the subscription is empty.
/// - Expectation: rejected while occupied; adopted once empty.
#[tokio::test]
async fn sub_type_changes_only_when_empty() {
    let (_log, _c, sub) = mk_subscription("/default/type", SubType::Shared, false).await;
    let c1 = sub.add_consumer("c1", SubType::Shared).await.unwrap();
    let err = sub.add_consumer("c2", SubType::Failover).await.unwrap_err();
    assert!(matches!(err, TopicError::NotAllowed(_)));

    sub.remove_consumer(c1.consumer_id).await;
    sub.add_consumer("c2", SubType::Failover).await.unwrap();
    assert_eq!(sub.sub_type().await, SubType::Failover);
}

/// What this test validates
///
/// - Scenario: keyed writes (key0,"a"), (key0,"b"), (key1,"c"); compaction
///   runs; a read-compacted subscription fetches from earliest.
/// - Expectation: exactly (key0,"b") then (key1,"c"), in that order, at
///   their original positions.
#[tokio::test]
async fn read_compacted_fetch_skips_superseded_entries() {
    let (log, compactor, sub) =
        mk_subscription("/default/compacted", SubType::Exclusive, true).await;
    log.append(msg(0, Some("key0"), b"a").encode().unwrap())
        .await
        .unwrap();
    let p_b = log
        .append(msg(1, Some("key0"), b"b").encode().unwrap())
        .await
        .unwrap();
    let p_c = log
        .append(msg(2, Some("key1"), b"c").encode().unwrap())
        .await
        .unwrap();

    compactor
        .compact("/default/compacted", log.clone())
        .await
        .unwrap();

    let batch = sub.fetch(10).await.unwrap();
    let got: Vec<(Position, Option<String>, Vec<u8>)> = batch
        .into_iter()
        .map(|(p, m)| (p, m.partition_key, m.payload))
        .collect();
    assert_eq!(
        got,
        vec![
            (p_b, Some("key0".to_string()), b"b".to_vec()),
            (p_c, Some("key1".to_string()), b"c".to_vec()),
        ]
    );
}

/// What this test validates
///
/// - Scenario: a batch [(a,"stale"), (b,"keep")] followed by a single write
///   (a,"fresh"), then compaction and a read-compacted fetch from earliest.
/// - Expectation: the batch entry survives but only the (b,"keep") member is
///   visible; the stale value of `a` never reaches the consumer, while the
///   fresh one does.
#[tokio::test]
async fn superseded_batch_members_are_hidden_from_readers() {
    let (log, compactor, sub) =
        mk_subscription("/default/partial-batch", SubType::Exclusive, true).await;
    let batch_entry = StreamMessage {
        batch: Some(vec![
            siret_core::message::BatchedMessage {
                partition_key: Some("a".to_string()),
                payload: b"stale".to_vec(),
            },
            siret_core::message::BatchedMessage {
                partition_key: Some("b".to_string()),
                payload: b"keep".to_vec(),
            },
        ]),
        ..msg(0, None, b"")
    };
    let p_batch = log.append(batch_entry.encode().unwrap()).await.unwrap();
    let p_fresh = log
        .append(msg(1, Some("a"), b"fresh").encode().unwrap())
        .await
        .unwrap();

    compactor
        .compact("/default/partial-batch", log.clone())
        .await
        .unwrap();

    let fetched = sub.fetch(10).await.unwrap();
    assert_eq!(fetched.len(), 2);

    let (position, batched) = &fetched[0];
    assert_eq!(*position, p_batch);
    let members: Vec<(Option<String>, Vec<u8>)> = batched
        .batch
        .as_ref()
        .unwrap()
        .iter()
        .map(|m| (m.partition_key.clone(), m.payload.clone()))
        .collect();
    assert_eq!(members, vec![(Some("b".to_string()), b"keep".to_vec())]);

    let (position, single) = &fetched[1];
    assert_eq!(*position, p_fresh);
    assert_eq!(single.payload, b"fresh".to_vec());
}

/// What this test validates
///
/// - Scenario: entries beyond the compaction horizon.
/// - Expectation: a read-compacted fetch falls through to the live backlog
///   past the horizon and returns them unfiltered.
#[tokio::test]
async fn fetch_reads_live_backlog_beyond_horizon() {
    let (log, compactor, sub) = mk_subscription("/default/beyond", SubType::Exclusive, true).await;
    log.append(msg(0, Some("k"), b"old").encode().unwrap())
        .await
        .unwrap();
    compactor.compact("/default/beyond", log.clone()).await.unwrap();

    let p_live = log
        .append(msg(1, Some("k"), b"live").encode().unwrap())
        .await
        .unwrap();

    let batch = sub.fetch(10).await.unwrap();
    let positions: Vec<Position> = batch.iter().map(|(p, _)| *p).collect();
    assert!(positions.contains(&p_live));
}

/// What this test validates
///
/// - Scenario: two expired entries, one fresh entry, one more expired entry
///   after the fresh one.
/// - Expectation: only the contiguous expired prefix is acknowledged; no
///   hole is created past the fresh entry.
#[tokio::test]
async fn expiry_stops_at_first_fresh_entry() {
    let (log, _c, sub) = mk_subscription("/default/ttl", SubType::Exclusive, false).await;
    let old = 1000u64;
    let mut stale = msg(0, None, b"stale0");
    stale.publish_time = old;
    log.append(stale.encode().unwrap()).await.unwrap();
    let mut stale = msg(1, None, b"stale1");
    stale.publish_time = old;
    let p_stale1 = log.append(stale.encode().unwrap()).await.unwrap();
    log.append(msg(2, None, b"fresh").encode().unwrap())
        .await
        .unwrap();
    let mut trailing = msg(3, None, b"stale2");
    trailing.publish_time = old;
    log.append(trailing.encode().unwrap()).await.unwrap();

    let expired = sub
        .expire_messages(&log, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(expired, 2);
    assert_eq!(sub.mark_delete_position().await, Some(p_stale1));
}

/// What this test validates
///
/// - Scenario: clear_backlog on a subscription with unread entries.
/// - Expectation: backlog drops to zero and a later publish is still
///   readable.
#[tokio::test]
async fn clear_backlog_drains_and_keeps_reading() {
    let (log, _c, sub) = mk_subscription("/default/clear", SubType::Exclusive, false).await;
    log.append(msg(0, None, b"a").encode().unwrap()).await.unwrap();
    log.append(msg(1, None, b"b").encode().unwrap()).await.unwrap();
    assert_eq!(sub.backlog().await, 2);

    sub.clear_backlog(&log).await.unwrap();
    assert_eq!(sub.backlog().await, 0);
    assert!(sub.fetch(10).await.unwrap().is_empty());

    log.append(msg(2, None, b"c").encode().unwrap()).await.unwrap();
    let batch = sub.fetch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].1.payload, b"c".to_vec());
}

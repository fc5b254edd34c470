use super::*;

async fn filled_log(entries: usize) -> MemoryLog {
    let log = MemoryLog::with_segment_size(4);
    for i in 0..entries {
        log.append(vec![i as u8]).await.expect("append");
    }
    log
}

/// What this test validates
///
/// - Scenario: append past the segment size.
/// - Expectation: positions roll over into the next segment and stay
///   strictly increasing.
#[tokio::test]
async fn positions_roll_over_segments() {
    let log = filled_log(6).await;
    assert_eq!(log.last_confirmed().await.unwrap(), Some(Position::new(1, 1)));
    let range = log
        .read_range(None, Position::new(1, 1))
        .await
        .expect("range");
    let positions: Vec<Position> = range.iter().map(|(p, _)| *p).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(positions[4], Position::new(1, 0));
}

/// What this test validates
///
/// - Scenario: a fenced log receives an append.
/// - Expectation: the append fails with `Fenced`; reads still work.
#[tokio::test]
async fn fenced_log_rejects_appends() {
    let log = filled_log(2).await;
    log.fence();
    assert_eq!(log.append(vec![9]).await.unwrap_err(), LogError::Fenced);
    assert_eq!(log.entry_count().await, 2);
}

/// What this test validates
///
/// - Scenario: terminate, then append.
/// - Expectation: terminate returns the last confirmed position and later
///   appends fail with `Terminated`.
#[tokio::test]
async fn terminated_log_rejects_appends() {
    let log = filled_log(3).await;
    let last = log.terminate().await.expect("terminate");
    assert_eq!(last, Position::new(0, 2));
    assert_eq!(log.append(vec![9]).await.unwrap_err(), LogError::Terminated);
}

/// What this test validates
///
/// - Scenario: out-of-order individual deletes around a gap.
/// - Expectation: mark-delete only advances once the gap closes.
#[tokio::test]
async fn individual_deletes_fold_into_mark_delete() {
    let log = filled_log(4).await;
    let cursor = log
        .open_cursor("s1", StartPosition::Earliest)
        .await
        .expect("cursor");

    cursor.individual_delete(Position::new(0, 1)).await.unwrap();
    assert_eq!(cursor.mark_delete_position().await, None);

    cursor.individual_delete(Position::new(0, 0)).await.unwrap();
    assert_eq!(
        cursor.mark_delete_position().await,
        Some(Position::new(0, 1))
    );
    assert_eq!(cursor.backlog().await, 2);
}

/// What this test validates
///
/// - Scenario: reopen a durable cursor by name.
/// - Expectation: the same cursor state comes back; the start position of
///   the second open is ignored.
#[tokio::test]
async fn durable_cursor_reopens_with_state() {
    let log = filled_log(3).await;
    let cursor = log
        .open_cursor("s1", StartPosition::Earliest)
        .await
        .expect("cursor");
    cursor.mark_delete(Position::new(0, 1)).await.unwrap();

    let reopened = log
        .open_cursor("s1", StartPosition::Latest)
        .await
        .expect("reopen");
    assert_eq!(
        reopened.mark_delete_position().await,
        Some(Position::new(0, 1))
    );
}

/// What this test validates
///
/// - Scenario: factory reopen after close, and after delete.
/// - Expectation: close is not durable (entries survive reopen), delete is
///   (the log comes back empty).
#[tokio::test]
async fn factory_reopen_semantics() {
    let factory = MemoryLogFactory::new();
    let log = factory.open("/default/t1").await.expect("open");
    log.append(vec![1]).await.expect("append");
    log.close().await.expect("close");

    let reopened = factory.open("/default/t1").await.expect("reopen");
    assert_eq!(reopened.entry_count().await, 1);

    reopened.delete().await.expect("delete");
    let fresh = factory.open("/default/t1").await.expect("fresh");
    assert_eq!(fresh.entry_count().await, 0);
}

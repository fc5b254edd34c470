use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};

use siret_core::message::Position;
use siret_core::storage::{LogCursor, LogError, LogFactory, LogResult, OrderedLog, StartPosition};

#[cfg(test)]
#[path = "memory_log_tests.rs"]
mod memory_log_tests;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory implementation of the ordered log boundary.
/// SHOULD BE USED ONLY FOR TESTING PURPOSES
///
/// Entries live in a flat vector; positions are derived by fixed-size segment
/// rollover so `(segment, offset)` pairs behave like the real service's.
/// Durable cursors are kept in the log and survive topic reopen as long as
/// the factory keeps the log alive.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

#[derive(Debug)]
struct LogInner {
    segment_size: u64,
    entries: RwLock<Vec<Vec<u8>>>,
    cursors: DashMap<String, Arc<MemoryCursor>>,
    fenced: AtomicBool,
    terminated: AtomicBool,
    closed: AtomicBool,
    nondurable_seq: AtomicU64,
}

impl LogInner {
    fn index_to_position(&self, index: u64) -> Position {
        Position::new(index / self.segment_size, index % self.segment_size)
    }

    fn position_to_index(&self, position: Position) -> u64 {
        position.segment * self.segment_size + position.offset.min(self.segment_size - 1)
    }

    fn check_writable(&self) -> LogResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::AlreadyClosed);
        }
        if self.fenced.load(Ordering::Acquire) {
            return Err(LogError::Fenced);
        }
        if self.terminated.load(Ordering::Acquire) {
            return Err(LogError::Terminated);
        }
        Ok(())
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_segment_size(1024)
    }

    /// Small segment sizes force rollover early, which keeps multi-segment
    /// positions covered by the tests.
    pub fn with_segment_size(segment_size: u64) -> Self {
        MemoryLog {
            inner: Arc::new(LogInner {
                segment_size: segment_size.max(1),
                entries: RwLock::new(Vec::new()),
                cursors: DashMap::new(),
                fenced: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                nondurable_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate another writer taking ownership of the log. Subsequent
    /// appends and cursor opens fail with `LogError::Fenced`.
    pub fn fence(&self) {
        self.inner.fenced.store(true, Ordering::Release);
    }

    fn reopen(&self) {
        self.inner.closed.store(false, Ordering::Release);
        self.inner.fenced.store(false, Ordering::Release);
    }

    fn clear(&self) {
        self.inner.cursors.clear();
        self.inner.terminated.store(false, Ordering::Release);
        self.inner.fenced.store(false, Ordering::Release);
        self.inner.closed.store(false, Ordering::Release);
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderedLog for MemoryLog {
    async fn append(&self, entry: Vec<u8>) -> LogResult<Position> {
        self.inner.check_writable()?;
        let mut entries = self.inner.entries.write().await;
        // Re-check under the write lock: a fence can land between the check
        // and the append.
        self.inner.check_writable()?;
        let index = entries.len() as u64;
        entries.push(entry);
        Ok(self.inner.index_to_position(index))
    }

    async fn open_cursor(&self, name: &str, start: StartPosition) -> LogResult<Arc<dyn LogCursor>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::AlreadyClosed);
        }
        if self.inner.fenced.load(Ordering::Acquire) {
            return Err(LogError::Fenced);
        }
        if let Some(existing) = self.inner.cursors.get(name) {
            return Ok(existing.value().clone() as Arc<dyn LogCursor>);
        }
        let cursor = MemoryCursor::new(name.to_string(), true, self.inner.clone(), start).await;
        let cursor = Arc::new(cursor);
        self.inner.cursors.insert(name.to_string(), cursor.clone());
        Ok(cursor as Arc<dyn LogCursor>)
    }

    async fn new_nondurable_cursor(&self, start: StartPosition) -> LogResult<Arc<dyn LogCursor>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::AlreadyClosed);
        }
        let seq = self.inner.nondurable_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("non-durable-{}", seq);
        let cursor = MemoryCursor::new(name, false, self.inner.clone(), start).await;
        Ok(Arc::new(cursor) as Arc<dyn LogCursor>)
    }

    async fn delete_cursor(&self, name: &str) -> LogResult<()> {
        match self.inner.cursors.remove(name) {
            Some(_) => Ok(()),
            None => Err(LogError::CursorNotFound(name.to_string())),
        }
    }

    async fn cursor_names(&self) -> Vec<String> {
        self.inner.cursors.iter().map(|e| e.key().clone()).collect()
    }

    async fn read_range(
        &self,
        after: Option<Position>,
        until: Position,
    ) -> LogResult<Vec<(Position, Vec<u8>)>> {
        let entries = self.inner.entries.read().await;
        let from = match after {
            Some(p) => self.inner.position_to_index(p) + 1,
            None => 0,
        };
        let to = (self.inner.position_to_index(until) + 1).min(entries.len() as u64);
        let mut out = Vec::new();
        for index in from..to {
            out.push((
                self.inner.index_to_position(index),
                entries[index as usize].clone(),
            ));
        }
        Ok(out)
    }

    async fn last_confirmed(&self) -> LogResult<Option<Position>> {
        let entries = self.inner.entries.read().await;
        if entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.inner.index_to_position(entries.len() as u64 - 1)))
        }
    }

    async fn entry_count(&self) -> u64 {
        self.inner.entries.read().await.len() as u64
    }

    async fn size_bytes(&self) -> u64 {
        let entries = self.inner.entries.read().await;
        entries.iter().map(|e| e.len() as u64).sum()
    }

    fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    fn is_fenced(&self) -> bool {
        self.inner.fenced.load(Ordering::Acquire)
    }

    async fn terminate(&self) -> LogResult<Position> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::AlreadyClosed);
        }
        self.inner.terminated.store(true, Ordering::Release);
        let entries = self.inner.entries.read().await;
        let last = if entries.is_empty() {
            Position::new(0, 0)
        } else {
            self.inner.index_to_position(entries.len() as u64 - 1)
        };
        Ok(last)
    }

    async fn close(&self) -> LogResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn delete(&self) -> LogResult<()> {
        let mut entries = self.inner.entries.write().await;
        entries.clear();
        drop(entries);
        self.clear();
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
struct CursorState {
    // Index of the next entry to read
    read_index: u64,
    // Highest contiguously acknowledged index
    mark_delete: Option<u64>,
    individually_deleted: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct MemoryCursor {
    name: String,
    durable: bool,
    log: Arc<LogInner>,
    state: Mutex<CursorState>,
    last_active: AtomicU64,
}

impl MemoryCursor {
    async fn new(name: String, durable: bool, log: Arc<LogInner>, start: StartPosition) -> Self {
        let read_index = Self::resolve_start(&log, start).await;
        MemoryCursor {
            name,
            durable,
            log,
            state: Mutex::new(CursorState {
                read_index,
                mark_delete: read_index.checked_sub(1),
                individually_deleted: BTreeSet::new(),
            }),
            last_active: AtomicU64::new(now_millis()),
        }
    }

    async fn resolve_start(log: &Arc<LogInner>, start: StartPosition) -> u64 {
        let len = log.entries.read().await.len() as u64;
        match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => len,
            StartPosition::Position(p) => log.position_to_index(p).min(len),
        }
    }

    fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Relaxed);
    }

    fn advance_mark_delete(state: &mut CursorState) {
        loop {
            let next = state.mark_delete.map(|m| m + 1).unwrap_or(0);
            if state.individually_deleted.remove(&next) {
                state.mark_delete = Some(next);
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl LogCursor for MemoryCursor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_durable(&self) -> bool {
        self.durable
    }

    async fn read_next(&self, max_entries: usize) -> LogResult<Vec<(Position, Vec<u8>)>> {
        self.touch();
        let entries = self.log.entries.read().await;
        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        while out.len() < max_entries && state.read_index < entries.len() as u64 {
            let index = state.read_index;
            out.push((
                self.log.index_to_position(index),
                entries[index as usize].clone(),
            ));
            state.read_index += 1;
        }
        Ok(out)
    }

    async fn seek(&self, start: StartPosition) -> LogResult<()> {
        self.touch();
        let read_index = Self::resolve_start(&self.log, start).await;
        let mut state = self.state.lock().await;
        state.read_index = read_index;
        Ok(())
    }

    async fn mark_delete(&self, position: Position) -> LogResult<()> {
        self.touch();
        let index = self.log.position_to_index(position);
        let mut state = self.state.lock().await;
        if state.mark_delete.map(|m| index > m).unwrap_or(true) {
            state.mark_delete = Some(index);
            state.individually_deleted.retain(|&i| i > index);
            Self::advance_mark_delete(&mut state);
        }
        if state.read_index <= index {
            state.read_index = index + 1;
        }
        Ok(())
    }

    async fn individual_delete(&self, position: Position) -> LogResult<()> {
        self.touch();
        let index = self.log.position_to_index(position);
        let mut state = self.state.lock().await;
        if state.mark_delete.map(|m| index > m).unwrap_or(true) {
            state.individually_deleted.insert(index);
            Self::advance_mark_delete(&mut state);
        }
        Ok(())
    }

    async fn mark_delete_position(&self) -> Option<Position> {
        let state = self.state.lock().await;
        state.mark_delete.map(|i| self.log.index_to_position(i))
    }

    async fn next_read_position(&self) -> Option<Position> {
        let len = self.log.entries.read().await.len() as u64;
        let state = self.state.lock().await;
        if state.read_index < len {
            Some(self.log.index_to_position(state.read_index))
        } else {
            None
        }
    }

    async fn backlog(&self) -> u64 {
        let len = self.log.entries.read().await.len() as u64;
        let state = self.state.lock().await;
        let consumed = state.mark_delete.map(|m| m + 1).unwrap_or(0);
        len.saturating_sub(consumed)
    }

    async fn backlog_size(&self) -> u64 {
        let entries = self.log.entries.read().await;
        let state = self.state.lock().await;
        let consumed = state.mark_delete.map(|m| m + 1).unwrap_or(0) as usize;
        entries
            .iter()
            .skip(consumed)
            .map(|e| e.len() as u64)
            .sum()
    }

    fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }
}

/// Opens and caches one `MemoryLog` per topic name.
///
/// Reopening a closed log clears the closed/fenced flags; termination sticks.
/// A deleted log comes back empty on the next open.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogFactory {
    logs: Arc<DashMap<String, MemoryLog>>,
}

impl MemoryLogFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle to a topic's log, mainly for test hooks like `fence`.
    pub fn get(&self, topic_name: &str) -> Option<MemoryLog> {
        self.logs.get(topic_name).map(|l| l.value().clone())
    }
}

#[async_trait]
impl LogFactory for MemoryLogFactory {
    async fn open(&self, topic_name: &str) -> LogResult<Arc<dyn OrderedLog>> {
        let log = self
            .logs
            .entry(topic_name.to_string())
            .or_insert_with(MemoryLog::new)
            .clone();
        log.reopen();
        Ok(Arc::new(log) as Arc<dyn OrderedLog>)
    }
}

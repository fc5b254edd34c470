use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::message::Position;

pub type LogResult<T> = std::result::Result<T, LogError>;

/// Failure taxonomy of the ordered log service.
///
/// The topic engine maps these onto its own error surface: `Fenced` forces a
/// close-and-reopen of the owning topic, `Terminated`/`AlreadyClosed` are
/// reported to the producer as terminal, everything else is a generic
/// persistence failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("log is fenced: another writer took ownership")]
    Fenced,

    #[error("log has been terminated")]
    Terminated,

    #[error("log is already closed")]
    AlreadyClosed,

    #[error("cursor not found: {0}")]
    CursorNotFound(String),

    #[error("entry codec error: {0}")]
    Codec(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Where a newly opened cursor starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
    Position(Position),
}

/// A named read pointer into the ordered log.
///
/// Durable cursors survive topic reopen; non-durable cursors exist only for
/// the lifetime of the handle. Mark-delete tracks the highest contiguously
/// acknowledged position; individual deletes record out-of-order
/// acknowledgements and fold into mark-delete once the gap closes.
#[async_trait]
pub trait LogCursor: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn is_durable(&self) -> bool;

    /// Read up to `max_entries` entries from the current read position and
    /// advance it past them.
    async fn read_next(&self, max_entries: usize) -> LogResult<Vec<(Position, Vec<u8>)>>;

    /// Reposition the read pointer.
    async fn seek(&self, start: StartPosition) -> LogResult<()>;

    /// Acknowledge everything up to and including `position`.
    async fn mark_delete(&self, position: Position) -> LogResult<()>;

    /// Acknowledge a single position, possibly out of order.
    async fn individual_delete(&self, position: Position) -> LogResult<()>;

    async fn mark_delete_position(&self) -> Option<Position>;

    /// Position of the next entry this cursor would read, or `None` when the
    /// cursor is caught up with the log tail.
    async fn next_read_position(&self) -> Option<Position>;

    /// Number of unacknowledged entries between mark-delete and the log tail.
    async fn backlog(&self) -> u64;

    /// Estimated unacknowledged bytes, used by compaction threshold checks.
    async fn backlog_size(&self) -> u64;

    /// Millis-since-epoch of the last read or acknowledgement.
    fn last_active(&self) -> u64;
}

/// The append-only ordered log a topic delegates persistence to.
///
/// This is the boundary to the external storage service: the engine never
/// sees placement, replication, or on-disk layout, only strictly increasing
/// positions and the cursor registry.
#[async_trait]
pub trait OrderedLog: Send + Sync + std::fmt::Debug {
    /// Append one entry, returning its position.
    async fn append(&self, entry: Vec<u8>) -> LogResult<Position>;

    /// Open (or reopen) a durable cursor. `start` only applies when the
    /// cursor does not exist yet.
    async fn open_cursor(&self, name: &str, start: StartPosition) -> LogResult<Arc<dyn LogCursor>>;

    /// Create an ephemeral cursor at the caller-specified position.
    async fn new_nondurable_cursor(&self, start: StartPosition) -> LogResult<Arc<dyn LogCursor>>;

    /// Delete a durable cursor and its persisted state.
    async fn delete_cursor(&self, name: &str) -> LogResult<()>;

    /// Names of all durable cursors, used to replay subscriptions on open.
    async fn cursor_names(&self) -> Vec<String>;

    /// Entries with position greater than `after` (or from the start when
    /// `None`) up to and including `until`, in position order.
    async fn read_range(
        &self,
        after: Option<Position>,
        until: Position,
    ) -> LogResult<Vec<(Position, Vec<u8>)>>;

    /// Position of the last confirmed entry, `None` for an empty log.
    async fn last_confirmed(&self) -> LogResult<Option<Position>>;

    async fn entry_count(&self) -> u64;

    /// Estimated total backlog size in bytes.
    async fn size_bytes(&self) -> u64;

    fn is_terminated(&self) -> bool;

    fn is_fenced(&self) -> bool;

    /// Seal the log against further appends; returns the last confirmed
    /// position. An empty log terminates at the zero position.
    async fn terminate(&self) -> LogResult<Position>;

    async fn close(&self) -> LogResult<()>;

    /// Delete the log and every durable cursor.
    async fn delete(&self) -> LogResult<()>;
}

/// Opens per-topic ordered logs. A closed log is reopened fresh; a deleted
/// log comes back empty. Termination is durable across reopen.
#[async_trait]
pub trait LogFactory: Send + Sync + std::fmt::Debug {
    async fn open(&self, topic_name: &str) -> LogResult<Arc<dyn OrderedLog>>;
}

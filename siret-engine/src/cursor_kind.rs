/// Prefix for replication cursors.
pub const REPLICATOR_PREFIX: &str = "siret.repl.";
/// Cursor name reserved for the deduplication sequence snapshot.
pub const DEDUPLICATION_CURSOR_NAME: &str = "siret.dedup";
/// Cursor tracking the earliest un-compacted position.
pub const COMPACTION_CURSOR_NAME: &str = "__compaction";

/// Classification of a durable cursor by name.
///
/// Replaces prefix string-matching scattered over call sites: every cursor
/// replayed on topic open goes through `parse`, and subscribe rejects any
/// name that does not classify as `Subscription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorKind {
    Subscription(String),
    Replicator { remote_cluster: String },
    DedupMarker,
    Compaction,
}

impl CursorKind {
    pub fn parse(cursor_name: &str) -> CursorKind {
        if let Some(remote) = cursor_name.strip_prefix(REPLICATOR_PREFIX) {
            return CursorKind::Replicator {
                remote_cluster: remote.to_string(),
            };
        }
        match cursor_name {
            DEDUPLICATION_CURSOR_NAME => CursorKind::DedupMarker,
            COMPACTION_CURSOR_NAME => CursorKind::Compaction,
            _ => CursorKind::Subscription(cursor_name.to_string()),
        }
    }

    pub fn replicator(remote_cluster: &str) -> CursorKind {
        CursorKind::Replicator {
            remote_cluster: remote_cluster.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            CursorKind::Subscription(name) => name.clone(),
            CursorKind::Replicator { remote_cluster } => {
                format!("{}{}", REPLICATOR_PREFIX, remote_cluster)
            }
            CursorKind::DedupMarker => DEDUPLICATION_CURSOR_NAME.to_string(),
            CursorKind::Compaction => COMPACTION_CURSOR_NAME.to_string(),
        }
    }

    /// True when `name` is owned by the engine and may not be used as a
    /// subscription name.
    pub fn is_reserved_name(name: &str) -> bool {
        !matches!(CursorKind::parse(name), CursorKind::Subscription(_))
    }
}

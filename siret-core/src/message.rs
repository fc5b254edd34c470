use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::storage::LogError;

/// Address of one entry in the ordered log.
///
/// Positions are strictly increasing per topic: first by segment, then by
/// offset within the segment. They define the global read order for every
/// cursor on the topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Position {
    pub segment: u64,
    pub offset: u64,
}

impl Position {
    pub const fn new(segment: u64, offset: u64) -> Self {
        Position { segment, offset }
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// One message inside a batched entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchedMessage {
    pub partition_key: Option<String>,
    pub payload: Vec<u8>,
}

/// The unit a producer publishes and the log stores, one per entry.
///
/// A non-batched message carries its own partition key and payload. A batched
/// entry carries its messages in `batch`; the top-level key/payload are unused
/// in that case. An empty payload on a keyed, non-batched message is a
/// tombstone: it logically deletes the key during compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    // Identifies the producer's name; sequence ids are scoped to it
    pub producer_name: String,
    pub sequence_id: u64,
    // Timestamp for when the message was published (millis since epoch)
    pub publish_time: u64,
    /// Cluster the message was replicated from, `None` for local publishes.
    /// Replicators use this to avoid echoing an entry back to its origin.
    pub origin_cluster: Option<String>,
    pub partition_key: Option<String>,
    pub payload: Vec<u8>,
    pub batch: Option<Vec<BatchedMessage>>,
}

impl StreamMessage {
    pub fn size(&self) -> usize {
        match &self.batch {
            Some(batch) => batch.iter().map(|m| m.payload.len()).sum(),
            None => self.payload.len(),
        }
    }

    pub fn is_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// A keyed, non-batched message with an empty payload deletes its key.
    pub fn is_tombstone(&self) -> bool {
        self.batch.is_none() && self.partition_key.is_some() && self.payload.is_empty()
    }

    /// Serialize into the binary form the ordered log stores.
    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        bincode::serialize(self).map_err(|e| LogError::Codec(e.to_string()))
    }

    /// Deserialize an entry read back from the ordered log.
    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        bincode::deserialize(bytes).map_err(|e| LogError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(key: Option<&str>, payload: &[u8]) -> StreamMessage {
        StreamMessage {
            producer_name: "p1".to_string(),
            sequence_id: 1,
            publish_time: 0,
            origin_cluster: None,
            partition_key: key.map(|k| k.to_string()),
            payload: payload.to_vec(),
            batch: None,
        }
    }

    #[test]
    fn position_ordering_is_segment_then_offset() {
        assert!(Position::new(0, 5) < Position::new(1, 0));
        assert!(Position::new(1, 0) < Position::new(1, 1));
    }

    #[test]
    fn tombstone_requires_key_and_empty_payload() {
        assert!(msg(Some("k"), b"").is_tombstone());
        assert!(!msg(Some("k"), b"v").is_tombstone());
        assert!(!msg(None, b"").is_tombstone());
    }

    #[test]
    fn encode_decode_round_trip() {
        let original = StreamMessage {
            batch: Some(vec![BatchedMessage {
                partition_key: Some("k0".to_string()),
                payload: b"a".to_vec(),
            }]),
            ..msg(None, b"")
        };
        let decoded = StreamMessage::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(original, decoded);
    }
}

//! Persistent topic engine: one named pub/sub topic over an append-only
//! ordered log, with dedup-gated publishing, cursor-backed subscriptions,
//! cross-cluster replicators, key-based compaction, and policy-driven
//! lifecycle management.

pub mod compaction;
pub mod consumer;
pub mod cursor_kind;
pub mod dedup;
pub mod engine_metrics;
pub mod errors;
pub mod policies;
pub mod producer;
pub mod registry;
pub mod replicator;
pub mod subscription;
pub mod topic;

pub use errors::{Result, TopicError};
pub use registry::TopicRegistry;
pub use topic::{PersistentTopic, PublishOutcome, SubscriptionOptions, TopicState};

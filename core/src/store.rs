//! External collaborator contracts the core consumes but does not
//! implement: the conversation store (spec §2 C3), the document store, and
//! the short/long-term memory stores (spec §6). Only the behavioral
//! contract lives here; the real backends (mongo, vector search) are out
//! of scope per spec §1.

use async_trait::async_trait;

use crate::model::BufferMessage;

/// Append/list ordered messages for a conversation (spec §2 C3).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append one message. Must not reorder relative to prior appends for
    /// the same conversation (spec §4.2.3, §5).
    async fn append(&self, conversation_id: i64, message: BufferMessage) -> anyhow::Result<()>;

    /// List the most recent `limit` messages in forward time order.
    async fn list_recent(&self, conversation_id: i64, limit: usize) -> anyhow::Result<Vec<BufferMessage>>;
}

/// A single item recalled from or stored into long-term memory.
#[derive(Debug, Clone)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    pub created_at: i64,
}

/// Long-term memory: semantic/keyword recall across a conversation's
/// history, backed by the vector search backend (external, spec §1).
#[async_trait]
pub trait LongTermMemoryStore: Send + Sync {
    async fn search(&self, conversation_id: i64, keywords: &[String]) -> anyhow::Result<Vec<MemoryItem>>;
    async fn add(&self, conversation_id: i64, item: MemoryItem) -> anyhow::Result<()>;
}

/// Short-term memory: a small, unindexed scratch list per conversation.
#[async_trait]
pub trait ShortTermMemoryStore: Send + Sync {
    async fn add(&self, conversation_id: i64, item: MemoryItem) -> anyhow::Result<()>;
}

/// The generic document store consumed by the scheduler and registry
/// (spec §6). Collection names are the stable set enumerated there.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert_entity(&self, collection: &str, id: &str, doc: serde_json::Value) -> anyhow::Result<()>;
    async fn delete_entity(&self, collection: &str, id: &str) -> anyhow::Result<()>;
    async fn list_collection(
        &self,
        collection: &str,
        filter: serde_json::Value,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<serde_json::Value>>;
    async fn create_index(&self, collection: &str, spec: serde_json::Value) -> anyhow::Result<()>;

    /// Dump every document in each of `names`, in order, as a point-in-time
    /// snapshot (spec §4.4, §6). The registry is responsible for always
    /// passing `COLLECTION_NAMES` so the invariant — a fixed, ordered
    /// collection set — holds regardless of caller.
    async fn snapshot_all(&self, names: &[&str]) -> anyhow::Result<Vec<CollectionSnapshot>>;

    /// Replace the contents of every named collection with `snapshot`'s
    /// documents. Collections absent from `snapshot` are left untouched.
    async fn restore_all(&self, snapshot: Vec<CollectionSnapshot>) -> anyhow::Result<()>;
}

/// One collection's documents as captured by `DocumentStore::snapshot_all`.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    pub name: String,
    pub documents: Vec<serde_json::Value>,
}

/// Stable, ordered collection names (spec §6 "Persisted state layout").
/// A snapshot is a point-in-time dump of exactly this set.
pub const COLLECTION_NAMES: &[&str] = &[
    "roles",
    "actors",
    "users",
    "user_actor_relations",
    "conversations",
    "conversation_messages",
    "short_term_memories",
    "long_term_memories",
    "agenda",
    "util",
];

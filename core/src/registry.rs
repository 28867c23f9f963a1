//! Server Registry (spec §2 C7, §4.4): a process-wide, single-flight
//! cache of Actor Workers keyed by `(user, actor, conversation)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::info;

use crate::actor::{ActorDeps, ActorWorker};
use crate::model::ActorKey;
use crate::store::{CollectionSnapshot, DocumentStore, COLLECTION_NAMES};

/// Builds the dependencies a newly-created `ActorWorker` needs. Kept as a
/// trait rather than a bare closure so callers can hold onto shared state
/// (LLM client, tool set, config) without threading it through every call.
#[async_trait]
pub trait ActorDepsFactory: Send + Sync {
    async fn build(&self, key: ActorKey, user_name: &str) -> anyhow::Result<ActorDeps>;
}

/// Owns and deduplicates Actor Workers (spec §4.4).
pub struct ServerRegistry {
    document_store: Arc<dyn DocumentStore>,
    factory: Arc<dyn ActorDepsFactory>,
    actors: Mutex<HashMap<ActorKey, Arc<OnceCell<Arc<ActorWorker>>>>>,
}

impl ServerRegistry {
    pub fn new(document_store: Arc<dyn DocumentStore>, factory: Arc<dyn ActorDepsFactory>) -> Self {
        Self { document_store, factory, actors: Mutex::new(HashMap::new()) }
    }

    /// `getActor` (spec §4.4): return the existing worker, await an
    /// in-flight construction, or build one from scratch. Single-flight per
    /// key; a failed construction clears the slot so the next call retries.
    pub async fn get_actor(&self, key: ActorKey) -> anyhow::Result<Arc<ActorWorker>> {
        let cell = {
            let mut actors = self.actors.lock();
            actors.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                let user_name = self.load_user_name(key.user_id).await.unwrap_or_else(|| "User".to_string());
                self.upsert_conversation_record(key, &user_name).await?;
                let deps = self.factory.build(key, &user_name).await?;
                info!(actor = %key, user_name, "constructing actor worker");
                Ok::<Arc<ActorWorker>, anyhow::Error>(ActorWorker::new(key, deps))
            })
            .await;

        match result {
            Ok(worker) => Ok(worker.clone()),
            Err(e) => {
                // Construction failed: drop the slot so a later call starts
                // fresh rather than being stuck awaiting a dead OnceCell.
                self.actors.lock().remove(&key);
                Err(e)
            }
        }
    }

    /// Returns the existing worker for `key` without triggering creation.
    pub fn peek_actor(&self, key: ActorKey) -> Option<Arc<ActorWorker>> {
        self.actors.lock().get(&key).and_then(|cell| cell.get().cloned())
    }

    pub fn actor_count(&self) -> usize {
        self.actors.lock().len()
    }

    async fn load_user_name(&self, user_id: i64) -> Option<String> {
        let docs = self
            .document_store
            .list_collection("users", serde_json::json!({ "id": user_id }), Some(1))
            .await
            .ok()?;
        docs.first()?.get("name")?.as_str().map(str::to_string)
    }

    async fn upsert_conversation_record(&self, key: ActorKey, user_name: &str) -> anyhow::Result<()> {
        self.document_store
            .upsert_entity(
                "conversations",
                &key.conversation_id.to_string(),
                serde_json::json!({
                    "id": key.conversation_id,
                    "userId": key.user_id,
                    "actorId": key.actor_id,
                    "userName": user_name,
                }),
            )
            .await
    }

    /// A point-in-time dump of the fixed, ordered collection set (spec
    /// §4.4). The ordering and membership of `COLLECTION_NAMES` is the
    /// invariant this method exists to enforce; the actual copying is
    /// delegated entirely to the document store.
    pub async fn snapshot(&self) -> anyhow::Result<Vec<CollectionSnapshot>> {
        self.document_store.snapshot_all(COLLECTION_NAMES).await
    }

    pub async fn restore(&self, snapshot: Vec<CollectionSnapshot>) -> anyhow::Result<()> {
        self.document_store.restore_all(snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;
    use crate::tool::Tool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDocStore {
        users: Vec<serde_json::Value>,
        upserts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DocumentStore for FakeDocStore {
        async fn upsert_entity(&self, collection: &str, id: &str, _doc: serde_json::Value) -> anyhow::Result<()> {
            self.upserts.lock().push((collection.to_string(), id.to_string()));
            Ok(())
        }
        async fn delete_entity(&self, _collection: &str, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list_collection(
            &self,
            collection: &str,
            _filter: serde_json::Value,
            _limit: Option<usize>,
        ) -> anyhow::Result<Vec<serde_json::Value>> {
            if collection == "users" {
                Ok(self.users.clone())
            } else {
                Ok(vec![])
            }
        }
        async fn create_index(&self, _collection: &str, _spec: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
        async fn snapshot_all(&self, names: &[&str]) -> anyhow::Result<Vec<CollectionSnapshot>> {
            Ok(names.iter().map(|n| CollectionSnapshot { name: n.to_string(), documents: vec![] }).collect())
        }
        async fn restore_all(&self, _snapshot: Vec<CollectionSnapshot>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct CountingFactory {
        builds: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ActorDepsFactory for CountingFactory {
        async fn build(&self, _key: ActorKey, _user_name: &str) -> anyhow::Result<ActorDeps> {
            let n = self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("simulated construction failure");
            }

            struct DummyLlm;
            #[async_trait]
            impl LlmClient for DummyLlm {
                async fn generate(
                    &self,
                    _messages: &[crate::model::Message],
                    _tools: &[Arc<dyn Tool>],
                    _system_prompt: &str,
                    _cancel: &tokio_util::sync::CancellationToken,
                ) -> Result<crate::llm::LlmResponse, crate::llm::LlmError> {
                    Ok(crate::llm::LlmResponse {
                        message: crate::llm::ModelTurn { text: String::new(), tool_calls: vec![] },
                        finish_reason: "stop".to_string(),
                        total_tokens: None,
                    })
                }
            }

            struct FakeConv;
            #[async_trait]
            impl crate::store::ConversationStore for FakeConv {
                async fn append(&self, _c: i64, _m: crate::model::BufferMessage) -> anyhow::Result<()> { Ok(()) }
                async fn list_recent(&self, _c: i64, _l: usize) -> anyhow::Result<Vec<crate::model::BufferMessage>> { Ok(vec![]) }
            }
            struct FakeLongTerm;
            #[async_trait]
            impl crate::store::LongTermMemoryStore for FakeLongTerm {
                async fn search(&self, _c: i64, _k: &[String]) -> anyhow::Result<Vec<crate::store::MemoryItem>> { Ok(vec![]) }
                async fn add(&self, _c: i64, _i: crate::store::MemoryItem) -> anyhow::Result<()> { Ok(()) }
            }
            struct FakeShortTerm;
            #[async_trait]
            impl crate::store::ShortTermMemoryStore for FakeShortTerm {
                async fn add(&self, _c: i64, _i: crate::store::MemoryItem) -> anyhow::Result<()> { Ok(()) }
            }

            Ok(ActorDeps {
                conversation_store: Arc::new(FakeConv),
                long_term_memory: Arc::new(FakeLongTerm),
                short_term_memory: Arc::new(FakeShortTerm),
                llm: Arc::new(DummyLlm),
                tools: vec![],
                tool_context: None,
                system_prompt_template: "sys".to_string(),
                max_steps: 5,
                recent_window: 10,
            })
        }
    }

    #[tokio::test]
    async fn get_actor_returns_same_instance_for_same_key() {
        let docs = Arc::new(FakeDocStore { users: vec![serde_json::json!({"id": 1, "name": "Ada"})], upserts: Mutex::new(vec![]) });
        let factory = Arc::new(CountingFactory { builds: AtomicUsize::new(0), fail_first: false });
        let registry = ServerRegistry::new(docs, factory.clone());

        let key = ActorKey::new(1, 1, 1);
        let a = registry.get_actor(key).await.unwrap();
        let b = registry.get_actor(key).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_actor_falls_back_to_generic_user_name() {
        let docs = Arc::new(FakeDocStore { users: vec![], upserts: Mutex::new(vec![]) });
        let factory = Arc::new(CountingFactory { builds: AtomicUsize::new(0), fail_first: false });
        let registry = ServerRegistry::new(docs.clone(), factory);

        registry.get_actor(ActorKey::new(9, 1, 1)).await.unwrap();
        assert_eq!(docs.upserts.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_construction_clears_slot_for_retry() {
        let docs = Arc::new(FakeDocStore { users: vec![], upserts: Mutex::new(vec![]) });
        let factory = Arc::new(CountingFactory { builds: AtomicUsize::new(0), fail_first: true });
        let registry = ServerRegistry::new(docs, factory.clone());

        let key = ActorKey::new(1, 1, 1);
        assert!(registry.get_actor(key).await.is_err());
        assert_eq!(registry.actor_count(), 0);

        let worker = registry.get_actor(key).await.unwrap();
        assert_eq!(worker.key(), key);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_workers() {
        let docs = Arc::new(FakeDocStore { users: vec![], upserts: Mutex::new(vec![]) });
        let factory = Arc::new(CountingFactory { builds: AtomicUsize::new(0), fail_first: false });
        let registry = ServerRegistry::new(docs, factory);

        let a = registry.get_actor(ActorKey::new(1, 1, 1)).await.unwrap();
        let b = registry.get_actor(ActorKey::new(1, 1, 2)).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.actor_count(), 2);
    }

}

//! Scheduler persistence (spec §4.5: "backed by a shared document store").
//!
//! Grounded on the teacher's file-backed `scheduler::store::JobStore`,
//! generalized to the core's `DocumentStore` collection abstraction instead
//! of a private JSON file, per spec §1 (the document store is an external
//! collaborator, not a core-owned file format).

use std::sync::Arc;

use crate::scheduler::model::JobRecord;
use crate::store::DocumentStore;

/// The fixed collection jobs live in; part of `COLLECTION_NAMES`.
pub const JOBS_COLLECTION: &str = "agenda";

pub struct SchedulerStore {
    docs: Arc<dyn DocumentStore>,
}

impl SchedulerStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub async fn save(&self, record: &JobRecord) -> anyhow::Result<()> {
        let doc = serde_json::to_value(record)?;
        self.docs.upsert_entity(JOBS_COLLECTION, &record.id, doc).await
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.docs.delete_entity(JOBS_COLLECTION, id).await
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<JobRecord>> {
        let docs = self
            .docs
            .list_collection(JOBS_COLLECTION, serde_json::json!({ "id": id }), Some(1))
            .await?;
        docs.into_iter().next().map(|d| serde_json::from_value(d).map_err(Into::into)).transpose()
    }

    pub async fn list(&self, filter: serde_json::Value) -> anyhow::Result<Vec<JobRecord>> {
        let docs = self.docs.list_collection(JOBS_COLLECTION, filter, None).await?;
        docs.into_iter().map(|d| serde_json::from_value(d).map_err(Into::into)).collect()
    }

    pub async fn find_by_unique(&self, unique: &serde_json::Value) -> anyhow::Result<Option<JobRecord>> {
        let all = self.list(serde_json::json!({})).await?;
        Ok(all.into_iter().find(|r| r.unique.as_ref() == Some(unique)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeDocs {
        data: Mutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl DocumentStore for FakeDocs {
        async fn upsert_entity(&self, _collection: &str, id: &str, doc: serde_json::Value) -> anyhow::Result<()> {
            self.data.lock().insert(id.to_string(), doc);
            Ok(())
        }
        async fn delete_entity(&self, _collection: &str, id: &str) -> anyhow::Result<()> {
            self.data.lock().remove(id);
            Ok(())
        }
        async fn list_collection(
            &self,
            _collection: &str,
            filter: serde_json::Value,
            limit: Option<usize>,
        ) -> anyhow::Result<Vec<serde_json::Value>> {
            let mut docs: Vec<serde_json::Value> = self.data.lock().values().cloned().collect();
            if let Some(id) = filter.get("id").and_then(|v| v.as_str()) {
                docs.retain(|d| d.get("id").and_then(|v| v.as_str()) == Some(id));
            }
            if let Some(limit) = limit {
                docs.truncate(limit);
            }
            Ok(docs)
        }
        async fn create_index(&self, _collection: &str, _spec: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
        async fn snapshot_all(&self, names: &[&str]) -> anyhow::Result<Vec<crate::store::CollectionSnapshot>> {
            Ok(names
                .iter()
                .map(|n| crate::store::CollectionSnapshot { name: n.to_string(), documents: vec![] })
                .collect())
        }
        async fn restore_all(&self, _snapshot: Vec<crate::store::CollectionSnapshot>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = SchedulerStore::new(Arc::new(FakeDocs { data: Mutex::new(HashMap::new()) }));
        let record = JobRecord::one_shot("j1".to_string(), "ping".to_string(), 1000, serde_json::json!({}), 1);
        store.save(&record).await.unwrap();

        let loaded = store.get("j1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "j1");
        assert_eq!(loaded.name, "ping");
    }

    #[tokio::test]
    async fn find_by_unique_collapses() {
        let store = SchedulerStore::new(Arc::new(FakeDocs { data: Mutex::new(HashMap::new()) }));
        let unique = serde_json::json!({"tag": "daily-digest"});
        let record = JobRecord::recurring(
            "j1".to_string(),
            "digest".to_string(),
            2000,
            crate::model::IntervalSpec::duration("1d"),
            serde_json::json!({}),
            Some(unique.clone()),
            1,
        );
        store.save(&record).await.unwrap();

        let found = store.find_by_unique(&unique).await.unwrap();
        assert_eq!(found.unwrap().id, "j1");
        assert!(store.find_by_unique(&serde_json::json!({"tag": "other"})).await.unwrap().is_none());
    }
}

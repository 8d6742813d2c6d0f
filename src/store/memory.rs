//! 进程内文档存储
//!
//! 每个集合一个 BTreeMap（按 id 有序），版本号在每次写入时递增。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{evaluate, Collection, Document, DocumentStore, ScoredDocument, StoreQuery};
use crate::core::error::{MemoryError, MemoryResult};

#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<Collection, BTreeMap<String, Document>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 集合内文档数（测试与统计用）
    pub async fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    pub async fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection).await == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn upsert(&self, collection: Collection, mut doc: Document) -> MemoryResult<String> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection).or_default();
        doc.version = docs.get(&doc.id).map_or(1, |d| d.version + 1);
        let id = doc.id.clone();
        docs.insert(id.clone(), doc);
        Ok(id)
    }

    async fn get(&self, collection: Collection, id: &str) -> MemoryResult<Option<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn query(
        &self,
        collection: Collection,
        query: &StoreQuery,
        top_k: usize,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(&collection) else {
            return Ok(Vec::new());
        };
        Ok(evaluate(query, docs.values().cloned(), top_k))
    }

    async fn compare_and_swap(
        &self,
        collection: Collection,
        mut doc: Document,
        expected: Option<u64>,
    ) -> MemoryResult<u64> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection).or_default();
        let found = docs.get(&doc.id).map(|d| d.version);
        if found != expected {
            return Err(MemoryError::VersionConflict {
                id: doc.id,
                expected,
                found,
            });
        }
        doc.version = found.map_or(1, |v| v + 1);
        let version = doc.version;
        docs.insert(doc.id.clone(), doc);
        Ok(version)
    }
}

//! 注入的后端客户端
//!
//! 文档存储、补全、嵌入三个进程级客户端由调用方构造后显式传入，池与各会话共享同一份；
//! 所有调用都经过 `RetryPolicy`。

use std::sync::Arc;

use crate::core::error::MemoryResult;
use crate::core::retry::{retry, RetryPolicy};
use crate::llm::{CompletionService, EmbeddingService, HashEmbedder, MockCompletion};
use crate::memory::Message;
use crate::store::{
    Collection, Document, DocumentStore, InMemoryStore, ScoredDocument, StoreQuery,
    StoredDocument,
};

#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DocumentStore>,
    pub completion: Arc<dyn CompletionService>,
    pub embedding: Arc<dyn EmbeddingService>,
    pub retry: RetryPolicy,
}

impl Backends {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        completion: Arc<dyn CompletionService>,
        embedding: Arc<dyn EmbeddingService>,
    ) -> Self {
        Self {
            store,
            completion,
            embedding,
            retry: RetryPolicy::default(),
        }
    }

    /// 进程内存储 + Mock 补全 + 哈希嵌入
    pub fn mock() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockCompletion::new()),
            Arc::new(HashEmbedder::default()),
        )
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub async fn complete(&self, op: &str, messages: &[Message]) -> MemoryResult<String> {
        let completion = &self.completion;
        retry(&self.retry, op, move || completion.complete(messages)).await
    }

    pub async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let embedding = &self.embedding;
        retry(&self.retry, "embed", move || embedding.embed(text)).await
    }

    pub async fn upsert(&self, collection: Collection, doc: Document) -> MemoryResult<String> {
        let store = &self.store;
        retry(&self.retry, "store.upsert", move || {
            store.upsert(collection, doc.clone())
        })
        .await
    }

    pub async fn get(&self, collection: Collection, id: &str) -> MemoryResult<Option<Document>> {
        let store = &self.store;
        retry(&self.retry, "store.get", move || store.get(collection, id)).await
    }

    pub async fn query(
        &self,
        collection: Collection,
        query: &StoreQuery,
        top_k: usize,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        let store = &self.store;
        retry(&self.retry, "store.query", move || {
            store.query(collection, query, top_k)
        })
        .await
    }

    pub async fn compare_and_swap(
        &self,
        collection: Collection,
        doc: Document,
        expected: Option<u64>,
    ) -> MemoryResult<u64> {
        let store = &self.store;
        retry(&self.retry, "store.compare_and_swap", move || {
            store.compare_and_swap(collection, doc.clone(), expected)
        })
        .await
    }

    /// 写入强类型文档
    pub async fn put<T: StoredDocument>(&self, value: &T) -> MemoryResult<String> {
        self.upsert(T::COLLECTION, value.to_document()?).await
    }

    /// 读取强类型文档及其版本号
    pub async fn fetch<T: StoredDocument>(&self, id: &str) -> MemoryResult<Option<(T, u64)>> {
        match self.get(T::COLLECTION, id).await? {
            Some(doc) => Ok(Some((T::from_document(&doc)?, doc.version))),
            None => Ok(None),
        }
    }

    pub async fn query_typed<T: StoredDocument>(
        &self,
        query: &StoreQuery,
        top_k: usize,
    ) -> MemoryResult<Vec<T>> {
        self.query(T::COLLECTION, query, top_k)
            .await?
            .iter()
            .map(|hit| T::from_document(&hit.document))
            .collect()
    }
}

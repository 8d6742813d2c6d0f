//! 测试替身：可注入失败的补全服务与存储

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::error::{BackendKind, MemoryError, MemoryResult};
use crate::core::{Backends, RetryPolicy};
use crate::llm::{CompletionService, HashEmbedder, MockCompletion};
use crate::memory::prompts::PromptKind;
use crate::memory::{Message, Role};
use crate::store::{
    Collection, Document, DocumentStore, InMemoryStore, ScoredDocument, StoreQuery,
};

enum Scripted {
    Transient(u32),
    Rejected,
    Raw(String),
}

/// 在 MockCompletion 之上按任务类型注入失败或固定输出，并统计调用次数
#[derive(Default)]
pub struct ScriptedCompletion {
    inner: MockCompletion,
    scripts: Mutex<HashMap<PromptKind, Scripted>>,
    calls: Mutex<HashMap<PromptKind, u32>>,
    delays: Mutex<HashMap<PromptKind, Duration>>,
    inputs: Mutex<HashMap<PromptKind, String>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来 n 次该类调用返回 TransientBackend
    pub fn fail_transient(&self, kind: PromptKind, n: u32) {
        self.scripts.lock().unwrap().insert(kind, Scripted::Transient(n));
    }

    pub fn reject(&self, kind: PromptKind) {
        self.scripts.lock().unwrap().insert(kind, Scripted::Rejected);
    }

    /// 该类调用固定返回 raw
    pub fn respond_with(&self, kind: PromptKind, raw: impl Into<String>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(kind, Scripted::Raw(raw.into()));
    }

    pub fn clear(&self, kind: PromptKind) {
        self.scripts.lock().unwrap().remove(&kind);
    }

    pub fn calls(&self, kind: PromptKind) -> u32 {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    /// 该类调用在返回前先等待 delay
    pub fn delay(&self, kind: PromptKind, delay: Duration) {
        self.delays.lock().unwrap().insert(kind, delay);
    }

    pub fn clear_delay(&self, kind: PromptKind) {
        self.delays.lock().unwrap().remove(&kind);
    }

    /// 该类最近一次调用的 user 消息
    pub fn last_input(&self, kind: PromptKind) -> Option<String> {
        self.inputs.lock().unwrap().get(&kind).cloned()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, messages: &[Message]) -> MemoryResult<String> {
        if let Some(kind) = PromptKind::detect(messages) {
            *self.calls.lock().unwrap().entry(kind).or_default() += 1;
            if let Some(input) = messages.iter().rev().find(|m| m.role == Role::User) {
                self.inputs.lock().unwrap().insert(kind, input.content.clone());
            }
            let delay = self.delays.lock().unwrap().get(&kind).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&kind) {
                Some(Scripted::Transient(n)) if *n > 0 => {
                    *n -= 1;
                    return Err(MemoryError::transient(BackendKind::Completion, "scripted outage"));
                }
                Some(Scripted::Rejected) => {
                    return Err(MemoryError::rejected(BackendKind::Completion, "scripted rejection"));
                }
                Some(Scripted::Raw(raw)) => return Ok(raw.clone()),
                _ => {}
            }
        }
        self.inner.complete(messages).await
    }
}

/// InMemoryStore 包装：可让某些集合的写入或全部读取失败
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    failing_writes: Mutex<HashSet<Collection>>,
    fail_reads: AtomicBool,
    upserts: Mutex<HashMap<Collection, u32>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, collection: Collection, failing: bool) {
        let mut set = self.failing_writes.lock().unwrap();
        if failing {
            set.insert(collection);
        } else {
            set.remove(&collection);
        }
    }

    pub fn fail_reads(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    pub fn upserts(&self, collection: Collection) -> u32 {
        self.upserts
            .lock()
            .unwrap()
            .get(&collection)
            .copied()
            .unwrap_or(0)
    }

    fn check_write(&self, collection: Collection) -> MemoryResult<()> {
        if self.failing_writes.lock().unwrap().contains(&collection) {
            return Err(MemoryError::transient(BackendKind::Store, "scripted write outage"));
        }
        Ok(())
    }

    fn check_read(&self) -> MemoryResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(MemoryError::transient(BackendKind::Store, "scripted read outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn upsert(&self, collection: Collection, doc: Document) -> MemoryResult<String> {
        self.check_write(collection)?;
        *self.upserts.lock().unwrap().entry(collection).or_default() += 1;
        self.inner.upsert(collection, doc).await
    }

    async fn get(&self, collection: Collection, id: &str) -> MemoryResult<Option<Document>> {
        self.check_read()?;
        self.inner.get(collection, id).await
    }

    async fn query(
        &self,
        collection: Collection,
        query: &StoreQuery,
        top_k: usize,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        self.check_read()?;
        self.inner.query(collection, query, top_k).await
    }

    async fn compare_and_swap(
        &self,
        collection: Collection,
        doc: Document,
        expected: Option<u64>,
    ) -> MemoryResult<u64> {
        self.check_write(collection)?;
        self.inner.compare_and_swap(collection, doc, expected).await
    }
}

/// 测试用后端组合（不重试，失败立即可见）
pub fn backends_with(completion: Arc<ScriptedCompletion>, store: Arc<FlakyStore>) -> Backends {
    Backends::new(store, completion, Arc::new(HashEmbedder::new(64))).with_retry(RetryPolicy::none())
}

pub fn test_backends() -> (Backends, Arc<ScriptedCompletion>, Arc<FlakyStore>) {
    let completion = Arc::new(ScriptedCompletion::new());
    let store = Arc::new(FlakyStore::new());
    (
        backends_with(completion.clone(), store.clone()),
        completion,
        store,
    )
}

//! 记忆服务门面：调用方只通过 MemoryService 访问会话池、反思与检索
//!
//! 所有后端客户端经 Backends 注入，服务本身不持有任何全局状态。

use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::MemoryResult;
use crate::core::Backends;
use crate::memory::keeper::{AppendOutcome, KeeperSettings, SessionReport};
use crate::memory::model::{LongTermInsight, SessionInsight, SessionSummary};
use crate::memory::Role;
use crate::pool::{PoolSettings, PoolStats, RestoreMode, SessionKey, SessionPool};
use crate::reflection::{LongTermOutcome, ReflectionPipeline, ReflectionSettings};
use crate::retrieval::{FactRetrieval, RetrievalAnswer, RetrievalSettings};
use crate::store::StoreQuery;

/// 检索触发方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrievalMode {
    /// 只在调用方显式 search_memory 时检索
    #[default]
    OnDemand,
    /// get_context_with_recall 自动附带召回事实
    Auto,
}

#[derive(Clone, Debug, Default)]
pub struct ServiceSettings {
    pub keeper: KeeperSettings,
    pub pool: PoolSettings,
    pub reflection: ReflectionSettings,
    pub retrieval: RetrievalSettings,
    pub retrieval_mode: RetrievalMode,
    /// end_session 时是否执行会话反思
    pub reflect_on_end: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSession {
    pub session_id: String,
    pub context: String,
}

pub struct MemoryService {
    backends: Backends,
    pool: Arc<SessionPool>,
    reflection: ReflectionPipeline,
    retrieval: FactRetrieval,
    retrieval_mode: RetrievalMode,
    reflect_on_end: bool,
}

impl MemoryService {
    /// KeeperSettings 不合法时返回 MemoryError::Config
    pub fn new(backends: Backends, settings: ServiceSettings) -> MemoryResult<Self> {
        settings.keeper.validate()?;
        let pool = Arc::new(SessionPool::new(
            backends.clone(),
            settings.keeper,
            settings.pool,
        ));
        Ok(Self {
            reflection: ReflectionPipeline::new(backends.clone(), settings.reflection),
            retrieval: FactRetrieval::new(backends.clone(), settings.retrieval),
            backends,
            pool,
            retrieval_mode: settings.retrieval_mode,
            reflect_on_end: settings.reflect_on_end,
        })
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn retrieval_mode(&self) -> RetrievalMode {
        self.retrieval_mode
    }

    /// 解析（新建或恢复）会话并返回上下文块；未给 session_id 时生成一个
    pub async fn resolve_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        mode: RestoreMode,
    ) -> MemoryResult<ResolvedSession> {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let guard = self
            .pool
            .acquire(SessionKey::new(user_id, &session_id), mode)
            .await?;
        Ok(ResolvedSession {
            context: guard.get_context(),
            session_id,
        })
    }

    pub async fn append_turn(
        &self,
        user_id: &str,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> MemoryResult<AppendOutcome> {
        let mut guard = self
            .pool
            .acquire(SessionKey::new(user_id, session_id), RestoreMode::Auto)
            .await?;
        guard.append_turn(role, content).await
    }

    pub async fn get_context(&self, user_id: &str, session_id: &str) -> MemoryResult<String> {
        let guard = self
            .pool
            .acquire(SessionKey::new(user_id, session_id), RestoreMode::Auto)
            .await?;
        Ok(guard.get_context())
    }

    /// 上下文块；auto 模式下追加 `### Recalled Facts`
    pub async fn get_context_with_recall(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
    ) -> MemoryResult<String> {
        let context = self.get_context(user_id, session_id).await?;
        if self.retrieval_mode != RetrievalMode::Auto || query.trim().is_empty() {
            return Ok(context);
        }
        let recalled = self
            .retrieval
            .answer(user_id, query, self.retrieval.settings().top_k)
            .await?;
        if recalled.facts.is_empty() {
            return Ok(context);
        }
        let section = format!("### Recalled Facts\n{}", recalled.answer);
        Ok(if context.is_empty() {
            section
        } else {
            format!("{context}\n\n{section}")
        })
    }

    pub async fn search_memory(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
        top_k: usize,
    ) -> MemoryResult<RetrievalAnswer> {
        tracing::debug!(user_id, session_id, query, top_k, "memory search");
        self.retrieval.answer(user_id, query, top_k).await
    }

    /// 结束会话；会话必须已存在（在池中或已持久化）
    pub async fn end_session(&self, user_id: &str, session_id: &str) -> MemoryResult<SessionReport> {
        let handle = self
            .pool
            .resolve(SessionKey::new(user_id, session_id), RestoreMode::Only)
            .await?;
        let report = {
            let mut guard = self.pool.lock(&handle).await?;
            let reflection = self.reflect_on_end.then_some(&self.reflection);
            guard.end_session(reflection).await?
        };
        self.pool.release(handle).await;
        Ok(report)
    }

    pub async fn run_longterm_reflection(&self, user_id: &str) -> MemoryResult<LongTermOutcome> {
        self.reflection.run_longterm(user_id).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn list_insights(
        &self,
        user_id: &str,
        category: Option<&str>,
        limit: usize,
    ) -> MemoryResult<Vec<SessionInsight>> {
        self.reflection.list_insights(user_id, category, limit).await
    }

    /// 最近结束的会话摘要，最新在前
    pub async fn recent_summaries(&self, user_id: &str, limit: usize) -> MemoryResult<Vec<SessionSummary>> {
        self.backends
            .query_typed(
                &StoreQuery::new()
                    .filter("user_id", user_id)
                    .filter("status", "ended")
                    .order_by_desc("end_time"),
                limit,
            )
            .await
    }

    pub async fn longterm_profile(&self, user_id: &str) -> MemoryResult<Option<LongTermInsight>> {
        self.reflection.longterm_profile(user_id).await
    }

    pub fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        self.pool.spawn_sweeper(token)
    }

    /// 持久化池内所有 dirty 会话
    pub async fn shutdown(&self) -> MemoryResult<usize> {
        self.pool.shutdown().await
    }
}

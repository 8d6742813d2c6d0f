//! 记忆服务错误类型
//!
//! 只有 TransientBackend 可重试（见 core::retry）；其余错误直接上抛给调用方。

use std::fmt;

use thiserror::Error;

/// 外部协作方：文档存储、补全服务、嵌入服务
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Store,
    Completion,
    Embedding,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Store => "document store",
            BackendKind::Completion => "completion service",
            BackendKind::Embedding => "embedding service",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MemoryError {
    /// 后端不可达或限流；调用方组件按退避策略重试后仍失败才会看到
    #[error("{backend} unavailable: {message}")]
    TransientBackend { backend: BackendKind, message: String },

    /// 后端明确拒绝（鉴权失败、请求非法等），重试无意义
    #[error("{backend} rejected request: {message}")]
    BackendRejected { backend: BackendKind, message: String },

    /// 池已满且 LRU 受害者无法持久化
    #[error("session pool at capacity ({capacity}): {reason}")]
    CapacityExceeded { capacity: usize, reason: String },

    #[error("session not found: {user_id}/{session_id}")]
    SessionNotFound { user_id: String, session_id: String },

    #[error("session already ended: {user_id}/{session_id}")]
    SessionEnded { user_id: String, session_id: String },

    /// 同一 generation 的 chunk 已写入。覆盖相同缓冲时由 MemoryKeeper 复用，否则返回给调用方
    #[error("compaction conflict for session {session_id} at generation {generation}")]
    CompactionConflict { session_id: String, generation: u64 },

    /// 长期画像 compare-and-swap 失败
    #[error("version conflict on {id}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// 补全服务返回的结构化输出不合法
    #[error("malformed model output: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),
}

impl MemoryError {
    pub fn transient(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::TransientBackend {
            backend,
            message: message.into(),
        }
    }

    pub fn rejected(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::BackendRejected {
            backend,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, MemoryError::TransientBackend { .. })
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Store(format!("document encoding: {e}"))
    }
}

impl From<config::ConfigError> for MemoryError {
    fn from(e: config::ConfigError) -> Self {
        MemoryError::Config(e.to_string())
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

//! Honeycomb - Rust 分层记忆服务
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **core**: 错误分类、重试退避、注入的后端客户端、优雅关闭
//! - **llm**: 补全 / 嵌入服务抽象与实现（OpenAI 兼容 / Mock）
//! - **store**: 文档存储抽象（内存 / SQLite）
//! - **memory**: 数据模型、提示词、压缩状态机 MemoryKeeper
//! - **reflection**: 会话反思与长期画像整合
//! - **retrieval**: 跨语料混合检索与事实融合
//! - **pool**: 会话池（LRU + TTL 清扫）
//! - **orchestrator**: 对外门面 MemoryService

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod reflection;
pub mod retrieval;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::core::{Backends, MemoryError, MemoryResult};
pub use orchestrator::{MemoryService, RetrievalMode, ServiceSettings};
pub use pool::RestoreMode;

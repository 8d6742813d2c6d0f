//! 补全与嵌入服务抽象
//!
//! 核心组件只依赖这两个 trait；具体后端（OpenAI 兼容 / Mock）通过 `Backends` 注入。
//! 失败需按 `MemoryError` 分类：不可达或限流为 TransientBackend，请求被拒为 BackendRejected。

use async_trait::async_trait;

use crate::core::error::MemoryResult;
use crate::memory::Message;

/// 补全服务：按角色消息列表生成文本
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> MemoryResult<String>;

    /// 后端名（日志用）
    fn name(&self) -> &str {
        "completion"
    }
}

/// 嵌入服务：文本到定长向量
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>>;

    fn dimensions(&self) -> usize;
}

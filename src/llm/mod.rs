//! 后端服务层：补全 / 嵌入抽象与实现（OpenAI 兼容 / Mock）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::OpenAiEmbedder;
pub use mock::{HashEmbedder, MockCompletion};
pub use openai::{resolve_api_key, OpenAiCompletion, TokenUsage};
pub use traits::{CompletionService, EmbeddingService};

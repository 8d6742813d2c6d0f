//! 嵌入客户端：调用 OpenAI 兼容的 /embeddings 端点

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::error::{BackendKind, MemoryError, MemoryResult};
use crate::llm::openai::{classify_error, openai_config};
use crate::llm::EmbeddingService;

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, dimensions: usize) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| classify_error(BackendKind::Embedding, e))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| classify_error(BackendKind::Embedding, e))?;

        let vector = response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| MemoryError::rejected(BackendKind::Embedding, "empty embedding response"))?;
        if vector.len() != self.dimensions {
            return Err(MemoryError::rejected(
                BackendKind::Embedding,
                format!(
                    "expected {} dimensions, got {}",
                    self.dimensions,
                    vector.len()
                ),
            ));
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

//! OpenAI 兼容补全客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；累计 token 用量。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::error::{BackendKind, MemoryError, MemoryResult};
use crate::llm::CompletionService;
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.prompt_tokens.load(Ordering::Relaxed);
        let completion = self.completion_tokens.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// 解析 API key：显式配置优先，其次 OPENAI_API_KEY；都没有时返回 None
pub fn resolve_api_key(api_key: Option<&str>) -> Option<String> {
    api_key
        .filter(|k| !k.trim().is_empty())
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty())
}

pub(crate) fn openai_config(base_url: Option<&str>, api_key: &str) -> OpenAIConfig {
    let config = OpenAIConfig::new().with_api_key(api_key);
    match base_url {
        Some(url) if !url.is_empty() => config.with_api_base(url),
        _ => config,
    }
}

/// 将 async-openai 错误映射到记忆服务错误分类
pub(crate) fn classify_error(backend: BackendKind, e: OpenAIError) -> MemoryError {
    match e {
        OpenAIError::InvalidArgument(msg) => MemoryError::rejected(backend, msg),
        OpenAIError::ApiError(api) => {
            let text = api.to_string();
            let lower = text.to_lowercase();
            if ["rate", "overloaded", "timeout", "unavailable", "server_error"]
                .iter()
                .any(|needle| lower.contains(needle))
            {
                MemoryError::transient(backend, text)
            } else {
                MemoryError::rejected(backend, text)
            }
        }
        other => MemoryError::transient(backend, other.to_string()),
    }
}

pub struct OpenAiCompletion {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    pub usage: TokenUsage,
}

impl OpenAiCompletion {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, temperature: f32) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            temperature,
            usage: TokenUsage::default(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, messages: &[Message]) -> MemoryResult<String> {
        let messages = self
            .to_openai_messages(messages)
            .map_err(|e| classify_error(BackendKind::Completion, e))?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(messages)
            .build()
            .map_err(|e| classify_error(BackendKind::Completion, e))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_error(BackendKind::Completion, e))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        tracing::debug!(model = %self.model, chars = content.len(), "completion received");
        Ok(content)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_is_not_retriable() {
        let err = classify_error(
            BackendKind::Completion,
            OpenAIError::InvalidArgument("model required".into()),
        );
        assert!(matches!(err, MemoryError::BackendRejected { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_explicit_api_key_wins() {
        assert_eq!(resolve_api_key(Some("sk-test")).as_deref(), Some("sk-test"));
    }
}

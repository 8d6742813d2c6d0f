//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HONEYCOMB__*` 覆盖（双下划线表示嵌套，如 `HONEYCOMB__POOL__MAX_SESSIONS=200`）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::{MemoryError, MemoryResult};
use crate::core::{Backends, RetryPolicy};
use crate::llm::{
    resolve_api_key, CompletionService, EmbeddingService, HashEmbedder, MockCompletion,
    OpenAiCompletion, OpenAiEmbedder,
};
use crate::memory::keeper::KeeperSettings;
use crate::orchestrator::{RetrievalMode, ServiceSettings};
use crate::pool::PoolSettings;
use crate::reflection::ReflectionSettings;
use crate::retrieval::RetrievalSettings;
use crate::store::{DocumentStore, InMemoryStore};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub memory: MemorySection,
    pub pool: PoolSection,
    pub retrieval: RetrievalSection,
    pub reflection: ReflectionSection,
    pub retry: RetryPolicy,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub store: StoreSection,
}

/// [memory] 段：缓冲阈值 k、保留轮数 n、会话初始化与洞察过滤
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub buffer_size: usize,
    pub retained_turns: usize,
    pub recent_sessions_for_init: usize,
    /// 无快照时冷恢复读取的最近 chunk 数
    pub restore_chunks: usize,
    pub min_confidence: f32,
    pub insight_categories: Vec<String>,
}

impl Default for MemorySection {
    fn default() -> Self {
        let keeper = KeeperSettings::default();
        let reflection = ReflectionSettings::default();
        Self {
            buffer_size: keeper.buffer_size,
            retained_turns: keeper.retained_turns,
            recent_sessions_for_init: keeper.recent_sessions_for_init,
            restore_chunks: keeper.restore_chunks,
            min_confidence: reflection.min_confidence,
            insight_categories: reflection.insight_categories,
        }
    }
}

/// [pool] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_sessions: usize,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_ttl_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

/// [retrieval] 段：融合权重与触发方式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub top_k: usize,
    pub min_similarity: f32,
    pub vector_weight: f32,
    pub text_weight: f32,
    pub rrf_k: f32,
    pub mode: RetrievalMode,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        let d = RetrievalSettings::default();
        Self {
            top_k: d.top_k,
            min_similarity: d.min_similarity,
            vector_weight: d.vector_weight,
            text_weight: d.text_weight,
            rrf_k: d.rrf_k,
            mode: RetrievalMode::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReflectionSection {
    /// end_session 时立即做会话反思
    pub trigger_on_end: bool,
    pub min_new_insights: usize,
}

impl Default for ReflectionSection {
    fn default() -> Self {
        Self {
            trigger_on_end: true,
            min_new_insights: 1,
        }
    }
}

/// [llm] 段：补全后端（openai / mock）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.2,
        }
    }
}

/// [embedding] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            base_url: None,
            api_key: None,
        }
    }
}

/// [store] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: String,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: PathBuf::from("honeycomb.db"),
        }
    }
}

impl From<&AppConfig> for KeeperSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            buffer_size: cfg.memory.buffer_size,
            retained_turns: cfg.memory.retained_turns,
            recent_sessions_for_init: cfg.memory.recent_sessions_for_init,
            restore_chunks: cfg.memory.restore_chunks,
        }
    }
}

impl From<&AppConfig> for PoolSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_sessions: cfg.pool.max_sessions,
            session_ttl: Duration::from_secs(cfg.pool.session_ttl_secs),
            sweep_interval: Duration::from_secs(cfg.pool.sweep_interval_secs.max(1)),
        }
    }
}

impl From<&AppConfig> for ReflectionSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            min_confidence: cfg.memory.min_confidence,
            insight_categories: cfg
                .memory
                .insight_categories
                .iter()
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
            min_new_insights: cfg.reflection.min_new_insights,
        }
    }
}

impl From<&AppConfig> for RetrievalSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            top_k: cfg.retrieval.top_k,
            min_similarity: cfg.retrieval.min_similarity,
            vector_weight: cfg.retrieval.vector_weight,
            text_weight: cfg.retrieval.text_weight,
            rrf_k: cfg.retrieval.rrf_k,
        }
    }
}

impl From<&AppConfig> for ServiceSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            keeper: cfg.into(),
            pool: cfg.into(),
            reflection: cfg.into(),
            retrieval: cfg.into(),
            retrieval_mode: cfg.retrieval.mode,
            reflect_on_end: cfg.reflection.trigger_on_end,
        }
    }
}

fn invalid(message: impl Into<String>) -> MemoryError {
    MemoryError::Config(message.into())
}

impl AppConfig {
    /// 启动时校验；配置错误直接失败，不降级运行
    pub fn validate(&self) -> MemoryResult<()> {
        KeeperSettings::from(self)
            .validate()
            .map_err(|e| match e {
                MemoryError::Config(msg) => invalid(format!("memory.{msg}")),
                other => other,
            })?;
        let m = &self.memory;
        if !(0.0..=1.0).contains(&m.min_confidence) {
            return Err(invalid("memory.min_confidence must be within 0..=1"));
        }
        if self.pool.max_sessions == 0 {
            return Err(invalid("pool.max_sessions must be at least 1"));
        }
        if self.pool.session_ttl_secs == 0 {
            return Err(invalid("pool.session_ttl_secs must be at least 1"));
        }
        let r = &self.retrieval;
        if r.vector_weight < 0.0 || r.text_weight < 0.0 {
            return Err(invalid("retrieval weights must not be negative"));
        }
        if r.vector_weight == 0.0 && r.text_weight == 0.0 {
            return Err(invalid("at least one retrieval weight must be positive"));
        }
        if r.top_k == 0 {
            return Err(invalid("retrieval.top_k must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }

        match self.llm.provider.to_lowercase().as_str() {
            "mock" => {}
            "openai" => {
                if resolve_api_key(self.llm.api_key.as_deref()).is_none() {
                    return Err(invalid(
                        "llm.provider = openai requires llm.api_key or OPENAI_API_KEY",
                    ));
                }
            }
            other => return Err(invalid(format!("unknown llm.provider: {other}"))),
        }
        match self.embedding.provider.to_lowercase().as_str() {
            "mock" => {}
            "openai" => {
                if resolve_api_key(self.embedding.api_key.as_deref()).is_none() {
                    return Err(invalid(
                        "embedding.provider = openai requires embedding.api_key or OPENAI_API_KEY",
                    ));
                }
            }
            other => return Err(invalid(format!("unknown embedding.provider: {other}"))),
        }
        if self.embedding.dimensions == 0 {
            return Err(invalid("embedding.dimensions must be at least 1"));
        }
        match self.store.backend.to_lowercase().as_str() {
            "memory" => {}
            "sqlite" if cfg!(feature = "sqlite") => {}
            "sqlite" => {
                return Err(invalid(
                    "store.backend = sqlite requires building with the `sqlite` feature",
                ))
            }
            other => return Err(invalid(format!("unknown store.backend: {other}"))),
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HONEYCOMB__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HONEYCOMB__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HONEYCOMB")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("memory.insight_categories")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

fn completion_from_config(cfg: &LlmSection) -> MemoryResult<Arc<dyn CompletionService>> {
    match cfg.provider.to_lowercase().as_str() {
        "openai" => {
            let key = resolve_api_key(cfg.api_key.as_deref())
                .ok_or_else(|| invalid("missing completion API key"))?;
            tracing::info!(model = %cfg.model, "Using OpenAI-compatible completion service");
            Ok(Arc::new(OpenAiCompletion::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                &key,
                cfg.temperature,
            )))
        }
        _ => {
            tracing::warn!("Using mock completion service");
            Ok(Arc::new(MockCompletion::new()))
        }
    }
}

fn embedding_from_config(cfg: &EmbeddingSection) -> MemoryResult<Arc<dyn EmbeddingService>> {
    match cfg.provider.to_lowercase().as_str() {
        "openai" => {
            let key = resolve_api_key(cfg.api_key.as_deref())
                .ok_or_else(|| invalid("missing embedding API key"))?;
            tracing::info!(model = %cfg.model, dimensions = cfg.dimensions, "Using OpenAI-compatible embedding service");
            Ok(Arc::new(OpenAiEmbedder::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                &key,
                cfg.dimensions,
            )))
        }
        _ => {
            tracing::warn!(dimensions = cfg.dimensions, "Using hash embedding service");
            Ok(Arc::new(HashEmbedder::new(cfg.dimensions)))
        }
    }
}

async fn store_from_config(cfg: &StoreSection) -> MemoryResult<Arc<dyn DocumentStore>> {
    match cfg.backend.to_lowercase().as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            tracing::info!(path = %cfg.path.display(), "Using SQLite document store");
            Ok(Arc::new(crate::store::SqliteStore::new(&cfg.path).await?))
        }
        "memory" => {
            tracing::info!("Using in-memory document store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        other => Err(invalid(format!("unsupported store.backend: {other}"))),
    }
}

/// 按配置构造注入给各组件的后端客户端（调用前应先 validate）
pub async fn build_backends(cfg: &AppConfig) -> MemoryResult<Backends> {
    let store = store_from_config(&cfg.store).await?;
    let completion = completion_from_config(&cfg.llm)?;
    let embedding = embedding_from_config(&cfg.embedding)?;
    Ok(Backends::new(store, completion, embedding).with_retry(cfg.retry.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.memory.buffer_size, 10);
        assert_eq!(cfg.memory.retained_turns, 5);
        assert_eq!(cfg.retrieval.mode, RetrievalMode::OnDemand);
    }

    #[test]
    fn test_retained_must_be_below_buffer() {
        let mut cfg = AppConfig::default();
        cfg.memory.retained_turns = 10;
        assert!(matches!(cfg.validate(), Err(MemoryError::Config(_))));
        cfg.memory.retained_turns = 0;
        assert!(matches!(cfg.validate(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn test_pool_and_weights_checked() {
        let mut cfg = AppConfig::default();
        cfg.pool.max_sessions = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.pool.session_ttl_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.retrieval.text_weight = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_openai_with_key_in_config_is_valid() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "openai".into();
        cfg.llm.api_key = Some("sk-test".into());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_unknown_provider_fails_fast() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "carrier-pigeon".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("honeycomb.toml");
        std::fs::write(
            &path,
            r#"
[memory]
buffer_size = 8
retained_turns = 3

[pool]
max_sessions = 50

[retrieval]
mode = "auto"
vector_weight = 1.5
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.memory.buffer_size, 8);
        assert_eq!(cfg.pool.max_sessions, 50);
        assert_eq!(cfg.retrieval.mode, RetrievalMode::Auto);

        let settings = ServiceSettings::from(&cfg);
        assert_eq!(settings.keeper.retained_turns, 3);
        assert_eq!(settings.retrieval.vector_weight, 1.5);
        assert!(settings.reflect_on_end);
    }

    #[tokio::test]
    async fn test_build_mock_backends() {
        let cfg = AppConfig::default();
        let backends = build_backends(&cfg).await.unwrap();
        assert_eq!(backends.embedding.dimensions(), 1536);
    }
}

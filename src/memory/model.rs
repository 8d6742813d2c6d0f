//! 持久化数据模型
//!
//! - InteractionChunk：一次压缩产生的不可变块（按 generation 生成确定性 id，重试幂等）
//! - SessionSummary：会话结束时的摘要，带 reflection_status
//! - SessionInsight / LongTermInsight：会话级洞察（只写一次）与每用户唯一的长期画像
//! - SessionSnapshot：池驱逐/关闭时写入的会话状态，用于冷恢复

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::conversation::Turn;
use crate::store::{Collection, StoredDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReflectionStatus {
    Pending,
    Processed,
    NoInsight,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub mentioned_topics: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractionChunk {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub generation: u64,
    /// 块内第一轮与最后一轮的序号
    pub first_seq: u64,
    pub last_seq: u64,
    /// 本块首次收录的第一轮；之前的轮次是上一块保留下来的上下文
    pub owned_from_seq: u64,
    /// 第一轮发言的时间
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub content: String,
    /// 本块拥有的轮次（owned_from_seq 起）的扁平文本，供会话反思拼接完整记录
    #[serde(default)]
    pub owned_content: String,
    pub content_vector: Vec<f32>,
    pub summary: String,
    pub summary_vector: Vec<f32>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl InteractionChunk {
    pub fn id_for(user_id: &str, session_id: &str, generation: u64) -> String {
        format!("{user_id}:{session_id}:chunk:{generation:06}")
    }

    pub fn owns(&self, seq: u64) -> bool {
        (self.owned_from_seq..=self.last_seq).contains(&seq)
    }
}

impl StoredDocument for InteractionChunk {
    const COLLECTION: Collection = Collection::Interactions;

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// 与 session_id 相同
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub summary: String,
    pub summary_vector: Vec<f32>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub extracted_insights: Vec<String>,
    pub status: SessionStatus,
    pub reflection_status: ReflectionStatus,
}

impl SessionSummary {
    pub fn id_for(user_id: &str, session_id: &str) -> String {
        format!("{user_id}:{session_id}")
    }
}

impl StoredDocument for SessionSummary {
    const COLLECTION: Collection = Collection::Summaries;

    fn doc_id(&self) -> String {
        SessionSummary::id_for(&self.user_id, &self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl std::str::FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Importance::High),
            "medium" => Ok(Importance::Medium),
            "low" => Ok(Importance::Low),
            other => Err(format!("unknown importance: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Session,
    LongTerm,
}

impl InsightType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Session => "session",
            InsightType::LongTerm => "long_term",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInsight {
    pub id: String,
    pub user_id: String,
    pub insight_type: InsightType,
    pub session_ids: Vec<String>,
    pub category: String,
    pub insight_text: String,
    pub confidence: f32,
    pub importance: Importance,
    pub insight_vector: Vec<f32>,
    /// 由长期整合置为 true，且只翻转一次
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionInsight {
    pub fn id_for(user_id: &str, session_id: &str, index: usize) -> String {
        format!("{user_id}:{session_id}:insight:{index:02}")
    }
}

impl StoredDocument for SessionInsight {
    const COLLECTION: Collection = Collection::Insights;

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}

/// 每用户一份；source_insight_ids 记录已并入画像的会话洞察，重跑时据此跳过
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LongTermInsight {
    pub id: String,
    pub user_id: String,
    pub insight_type: InsightType,
    pub insight_text: String,
    pub insight_vector: Vec<f32>,
    #[serde(default)]
    pub source_insight_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LongTermInsight {
    pub fn id_for(user_id: &str) -> String {
        format!("longterm-{user_id}")
    }
}

impl StoredDocument for LongTermInsight {
    const COLLECTION: Collection = Collection::Insights;

    fn doc_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecentSummary {
    pub session_id: String,
    pub end_time: DateTime<Utc>,
    pub summary: String,
}

/// 会话初始化块：会话开始时计算一次，会话期间不再变化
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInitBlock {
    pub profile: Option<String>,
    #[serde(default)]
    pub recent_summaries: Vec<RecentSummary>,
}

impl SessionInitBlock {
    pub fn is_empty(&self) -> bool {
        self.profile.is_none() && self.recent_summaries.is_empty()
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut parts = vec!["<session_initialization>".to_string()];
        if let Some(profile) = &self.profile {
            parts.push("### Key Insights".to_string());
            parts.push(profile.clone());
            parts.push(String::new());
        }
        if !self.recent_summaries.is_empty() {
            parts.push("### Recent Session Summaries".to_string());
            for s in &self.recent_summaries {
                parts.push(format!("- {}: {}", s.end_time.format("%Y-%m-%d"), s.summary));
            }
            parts.push(String::new());
        }
        parts.push("</session_initialization>".to_string());
        parts.join("\n")
    }
}

/// 会话快照：缓冲区、累计摘要与压缩计数器
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub reflection_status: ReflectionStatus,
    pub buffer: Vec<Turn>,
    pub cumulative_summary: String,
    /// 下一轮发言的序号
    pub next_seq: u64,
    /// 下一次压缩使用的 generation（即已提交的压缩次数）
    pub generation: u64,
    /// 已并入累计摘要的压缩次数
    pub folded_generation: u64,
    /// 已被某个块拥有的最大序号（0 表示尚无）
    #[serde(default)]
    pub compacted_through_seq: u64,
    pub init_block: SessionInitBlock,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn id_for(user_id: &str, session_id: &str) -> String {
        format!("{user_id}:{session_id}")
    }
}

impl StoredDocument for SessionSnapshot {
    const COLLECTION: Collection = Collection::Sessions;

    fn doc_id(&self) -> String {
        SessionSnapshot::id_for(&self.user_id, &self.session_id)
    }
}

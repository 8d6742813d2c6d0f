//! 补全服务结构化输出的解析与校验
//!
//! 模型输出先剥离 ```json 代码块（或截取首个 `{` 到末个 `}`），再反序列化为强类型；
//! 形状不合法的输出统一返回 `MemoryError::Serialization`，由调用方决定降级策略。

use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::core::error::{MemoryError, MemoryResult};
use crate::memory::model::Importance;

pub const MAX_TOPICS: usize = 5;
pub const FALLBACK_SESSION_SUMMARY: &str = "Session completed with discussion.";

static FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn json_payload(raw: &str) -> &str {
    let trimmed = raw.trim();
    let re = FENCE_RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());
    if let Some(body) = re.captures(trimmed).and_then(|c| c.get(1)) {
        return body.as_str().trim();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> MemoryResult<T> {
    let payload = json_payload(raw);
    serde_json::from_str(payload).map_err(|e| MemoryError::Serialization(format!("{e}: {payload}")))
}

fn clean_list(items: Vec<String>, max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out.truncate(max);
    out
}

/// 压缩时对单个块的分析结果
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ChunkAnalysis {
    /// 一到两句话的块摘要
    pub summary: String,
    /// 最多 5 个话题
    #[serde(default)]
    pub mentioned_topics: Vec<String>,
    /// 提到的人名、地名、产品等
    #[serde(default)]
    pub entities: Vec<String>,
}

pub fn parse_chunk_analysis(raw: &str) -> MemoryResult<ChunkAnalysis> {
    let mut analysis: ChunkAnalysis = parse_structured(raw)?;
    analysis.summary = analysis.summary.trim().to_string();
    if analysis.summary.is_empty() {
        return Err(MemoryError::Serialization("chunk summary is empty".into()));
    }
    analysis.mentioned_topics = clean_list(analysis.mentioned_topics, MAX_TOPICS);
    analysis.entities = clean_list(analysis.entities, usize::MAX);
    Ok(analysis)
}

/// 会话结束时的整体分析
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SessionAnalysis {
    pub summary: String,
    /// 1 到 5 个关键话题
    #[serde(default)]
    pub key_topics: Vec<String>,
}

/// 结构非法时报错；摘要为空时使用固定的兜底摘要
pub fn parse_session_analysis(raw: &str) -> MemoryResult<SessionAnalysis> {
    let mut analysis: SessionAnalysis = parse_structured(raw)?;
    analysis.summary = analysis.summary.trim().to_string();
    if analysis.summary.is_empty() {
        analysis.summary = FALLBACK_SESSION_SUMMARY.to_string();
    }
    analysis.key_topics = clean_list(analysis.key_topics, MAX_TOPICS);
    Ok(analysis)
}

/// 模型原始输出的洞察条目（未校验）
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RawInsight {
    /// 自由分类，如 preference / goal / fact
    pub category: String,
    pub insight_text: String,
    /// 0.0 到 1.0
    pub confidence: f32,
    /// high / medium / low
    pub importance: String,
}

/// 洞察提取的原始输出：`{"verdict": "no_insight"}` 或 `{"verdict": "insights", "insights": [...]}`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RawExtraction {
    NoInsight,
    Insights { insights: Vec<RawInsight> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategorizedInsight {
    pub category: String,
    pub insight_text: String,
    pub confidence: f32,
    pub importance: Importance,
}

/// 校验后的提取结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    NoInsight,
    Insights(Vec<CategorizedInsight>),
}

impl TryFrom<RawInsight> for CategorizedInsight {
    type Error = MemoryError;

    fn try_from(raw: RawInsight) -> Result<Self, Self::Error> {
        let category = raw.category.trim().to_lowercase();
        let insight_text = raw.insight_text.trim().to_string();
        if category.is_empty() || insight_text.is_empty() {
            return Err(MemoryError::Serialization(
                "insight with empty category or text".into(),
            ));
        }
        if !(0.0..=1.0).contains(&raw.confidence) {
            return Err(MemoryError::Serialization(format!(
                "confidence out of range: {}",
                raw.confidence
            )));
        }
        let importance = raw
            .importance
            .parse::<Importance>()
            .map_err(MemoryError::Serialization)?;
        Ok(Self {
            category,
            insight_text,
            confidence: raw.confidence,
            importance,
        })
    }
}

/// 任何一条非法都拒绝整个输出；空列表视为 NoInsight
pub fn parse_extraction(raw: &str) -> MemoryResult<ExtractionOutcome> {
    match parse_structured::<RawExtraction>(raw)? {
        RawExtraction::NoInsight => Ok(ExtractionOutcome::NoInsight),
        RawExtraction::Insights { insights } if insights.is_empty() => {
            Ok(ExtractionOutcome::NoInsight)
        }
        RawExtraction::Insights { insights } => insights
            .into_iter()
            .map(CategorizedInsight::try_from)
            .collect::<MemoryResult<Vec<_>>>()
            .map(ExtractionOutcome::Insights),
    }
}

/// 长期整合输出
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ConsolidatedProfile {
    /// 修订后的完整用户画像
    pub profile: String,
}

pub fn parse_consolidation(raw: &str) -> MemoryResult<String> {
    let parsed: ConsolidatedProfile = parse_structured(raw)?;
    let profile = parsed.profile.trim().to_string();
    if profile.is_empty() {
        return Err(MemoryError::Serialization("consolidated profile is empty".into()));
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_json_is_extracted() {
        let raw = "Here you go:\n```json\n{\"summary\": \"Talked about Rust\", \"mentioned_topics\": [\"rust\", \"rust\", \" \"]}\n```";
        let analysis = parse_chunk_analysis(raw).unwrap();
        assert_eq!(analysis.summary, "Talked about Rust");
        assert_eq!(analysis.mentioned_topics, vec!["rust"]);
        assert!(analysis.entities.is_empty());
    }

    #[test]
    fn test_bare_json_with_prose() {
        let raw = "Sure! {\"summary\": \"x\", \"key_topics\": [\"a\",\"b\",\"c\",\"d\",\"e\",\"f\"]} done";
        let analysis = parse_session_analysis(raw).unwrap();
        assert_eq!(analysis.key_topics.len(), MAX_TOPICS);
    }

    #[test]
    fn test_empty_session_summary_falls_back() {
        let analysis = parse_session_analysis(r#"{"summary": "  "}"#).unwrap();
        assert_eq!(analysis.summary, FALLBACK_SESSION_SUMMARY);
    }

    #[test]
    fn test_extraction_variants() {
        assert_eq!(
            parse_extraction(r#"{"verdict": "no_insight"}"#).unwrap(),
            ExtractionOutcome::NoInsight
        );
        assert_eq!(
            parse_extraction(r#"{"verdict": "insights", "insights": []}"#).unwrap(),
            ExtractionOutcome::NoInsight
        );
        let outcome = parse_extraction(
            r#"{"verdict": "insights", "insights": [
                {"category": "Preference", "insight_text": "Prefers index funds", "confidence": 0.9, "importance": "High"}
            ]}"#,
        )
        .unwrap();
        let ExtractionOutcome::Insights(items) = outcome else {
            panic!("expected insights");
        };
        assert_eq!(items[0].category, "preference");
        assert_eq!(items[0].importance, Importance::High);
    }

    #[test]
    fn test_malformed_extraction_is_serialization_error() {
        for raw in [
            "no json at all",
            r#"{"verdict": "maybe"}"#,
            r#"{"verdict": "insights", "insights": [{"category": "x", "insight_text": "y", "confidence": 1.5, "importance": "low"}]}"#,
            r#"{"verdict": "insights", "insights": [{"category": "x", "insight_text": "y", "confidence": 0.5, "importance": "urgent"}]}"#,
        ] {
            assert!(
                matches!(parse_extraction(raw), Err(MemoryError::Serialization(_))),
                "accepted: {raw}"
            );
        }
    }

    #[test]
    fn test_consolidation_requires_profile() {
        assert_eq!(
            parse_consolidation(r#"{"profile": "Likes hiking"}"#).unwrap(),
            "Likes hiking"
        );
        assert!(parse_consolidation(r#"{"profile": ""}"#).is_err());
    }
}

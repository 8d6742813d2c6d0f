//! 两阶段反思
//!
//! - 会话反思：会话结束时对完整记录做一次洞察提取，写入 processed=false 的会话洞察，
//!   会话摘要的 reflection_status 从 Pending 变为 Processed 或 NoInsight。
//! - 长期反思：按用户手动触发，把未处理的会话洞察并入唯一的长期画像。
//!   画像文档用 compare-and-swap 更新；source_insight_ids 记录已并入的洞察，
//!   重跑时跳过这些 id，只补翻 processed 标志。标志翻转是最后一步。

use chrono::Utc;

use crate::core::error::{MemoryError, MemoryResult};
use crate::core::Backends;
use crate::memory::extraction::{self, ExtractionOutcome};
use crate::memory::keeper::session_chunks;
use crate::memory::model::{
    InsightType, LongTermInsight, ReflectionStatus, SessionInsight, SessionSummary,
};
use crate::memory::prompts;
use crate::store::{Collection, StoreQuery, StoredDocument};

/// 记录短于该字符数时不调用提取
const MIN_TRANSCRIPT_CHARS: usize = 10;
const INSIGHT_SCAN_LIMIT: usize = 10_000;

#[derive(Clone, Debug, PartialEq)]
pub struct ReflectionSettings {
    pub min_confidence: f32,
    pub insight_categories: Vec<String>,
    /// 长期整合至少需要的新洞察数
    pub min_new_insights: usize,
}

impl Default for ReflectionSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            insight_categories: vec![
                "preference".into(),
                "goal".into(),
                "fact".into(),
                "concern".into(),
            ],
            min_new_insights: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionReflection {
    pub summary: SessionSummary,
    pub insights: Vec<SessionInsight>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LongTermOutcome {
    pub updated: bool,
    /// 本次新并入画像的洞察数
    pub consumed: usize,
    /// 补翻了 processed 标志的洞察数（上次提交后中断遗留）
    pub repaired: usize,
    pub version: Option<u64>,
}

pub struct ReflectionPipeline {
    backends: Backends,
    settings: ReflectionSettings,
}

impl ReflectionPipeline {
    pub fn new(backends: Backends, settings: ReflectionSettings) -> Self {
        Self { backends, settings }
    }

    pub fn settings(&self) -> &ReflectionSettings {
        &self.settings
    }

    /// 会话反思；摘要已不是 Pending 时直接返回已存结果
    pub async fn reflect_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> MemoryResult<SessionReflection> {
        let summary_id = SessionSummary::id_for(user_id, session_id);
        let Some((mut summary, _)) = self.backends.fetch::<SessionSummary>(&summary_id).await?
        else {
            return Err(MemoryError::SessionNotFound {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        };
        if summary.reflection_status != ReflectionStatus::Pending {
            let insights = self.insights_for(&summary).await?;
            return Ok(SessionReflection { summary, insights });
        }

        let transcript = session_chunks(&self.backends, user_id, session_id)
            .await?
            .iter()
            .map(|c| c.owned_content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let outcome = if transcript.chars().count() < MIN_TRANSCRIPT_CHARS {
            tracing::debug!(user_id, session_id, "session too brief for insight extraction");
            ExtractionOutcome::NoInsight
        } else {
            let raw = self
                .backends
                .complete(
                    "insight_extraction",
                    &prompts::insight_extraction(&transcript, &self.settings.insight_categories),
                )
                .await?;
            match extraction::parse_extraction(&raw) {
                Ok(outcome) => outcome,
                Err(MemoryError::Serialization(msg)) => {
                    tracing::warn!(user_id, session_id, error = %msg, "malformed extraction output, marking no-insight");
                    ExtractionOutcome::NoInsight
                }
                Err(e) => return Err(e),
            }
        };

        let items = match outcome {
            ExtractionOutcome::NoInsight => Vec::new(),
            ExtractionOutcome::Insights(items) => items
                .into_iter()
                .filter(|i| i.confidence >= self.settings.min_confidence)
                .collect(),
        };

        let mut insights = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let id = SessionInsight::id_for(user_id, session_id, index);
            // 会话洞察只写一次；重跑时保留已存版本（含 processed 标志）
            if let Some((existing, _)) = self.backends.fetch::<SessionInsight>(&id).await? {
                insights.push(existing);
                continue;
            }
            let insight = SessionInsight {
                id,
                user_id: user_id.to_string(),
                insight_type: InsightType::Session,
                session_ids: vec![session_id.to_string()],
                category: item.category,
                insight_vector: self.backends.embed(&item.insight_text).await?,
                insight_text: item.insight_text,
                confidence: item.confidence,
                importance: item.importance,
                processed: false,
                created_at: Utc::now(),
            };
            self.backends.put(&insight).await?;
            insights.push(insight);
        }

        summary.reflection_status = if insights.is_empty() {
            ReflectionStatus::NoInsight
        } else {
            ReflectionStatus::Processed
        };
        summary.extracted_insights = insights.iter().map(|i| i.id.clone()).collect();
        self.backends.put(&summary).await?;

        tracing::info!(
            user_id,
            session_id,
            insights = insights.len(),
            status = ?summary.reflection_status,
            "session reflection finished"
        );
        Ok(SessionReflection { summary, insights })
    }

    /// 摘要记录的洞察
    pub async fn insights_for(&self, summary: &SessionSummary) -> MemoryResult<Vec<SessionInsight>> {
        let mut insights = Vec::with_capacity(summary.extracted_insights.len());
        for id in &summary.extracted_insights {
            if let Some((insight, _)) = self.backends.fetch::<SessionInsight>(id).await? {
                insights.push(insight);
            }
        }
        Ok(insights)
    }

    /// 用户的会话洞察（最新在前），可按分类过滤
    pub async fn list_insights(
        &self,
        user_id: &str,
        category: Option<&str>,
        limit: usize,
    ) -> MemoryResult<Vec<SessionInsight>> {
        let mut query = StoreQuery::new()
            .filter("user_id", user_id)
            .filter("insight_type", InsightType::Session.as_str())
            .order_by_desc("created_at");
        if let Some(category) = category {
            query = query.filter("category", category.trim().to_lowercase());
        }
        self.backends.query_typed(&query, limit).await
    }

    pub async fn longterm_profile(&self, user_id: &str) -> MemoryResult<Option<LongTermInsight>> {
        Ok(self
            .backends
            .fetch::<LongTermInsight>(&LongTermInsight::id_for(user_id))
            .await?
            .map(|(doc, _)| doc))
    }

    /// 长期反思
    pub async fn run_longterm(&self, user_id: &str) -> MemoryResult<LongTermOutcome> {
        let mut pending: Vec<SessionInsight> = self
            .backends
            .query_typed(
                &StoreQuery::new()
                    .filter("user_id", user_id)
                    .filter("insight_type", InsightType::Session.as_str())
                    .filter("processed", false),
                INSIGHT_SCAN_LIMIT,
            )
            .await?;
        // 按读取顺序（创建时间）陈述
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let longterm_id = LongTermInsight::id_for(user_id);
        let existing = self.backends.fetch::<LongTermInsight>(&longterm_id).await?;
        let expected_version = existing.as_ref().map(|(_, v)| *v);
        let existing = existing.map(|(doc, _)| doc);

        let (already, fresh): (Vec<_>, Vec<_>) = pending.into_iter().partition(|i| {
            existing
                .as_ref()
                .is_some_and(|doc| doc.source_insight_ids.contains(&i.id))
        });

        let repaired = already.len();
        if repaired > 0 {
            tracing::warn!(user_id, repaired, "insights already folded but not flagged, repairing");
            self.mark_processed(already).await?;
        }

        if fresh.len() < self.settings.min_new_insights.max(1) {
            tracing::info!(user_id, pending = fresh.len(), "no new insights for long-term reflection");
            return Ok(LongTermOutcome {
                updated: false,
                consumed: 0,
                repaired,
                version: expected_version,
            });
        }

        let items: Vec<String> = fresh
            .iter()
            .map(|i| format!("[{}] {}", i.category, i.insight_text))
            .collect();
        let baseline = existing.as_ref().map(|doc| doc.insight_text.as_str());
        let raw = self
            .backends
            .complete("consolidation", &prompts::consolidation(baseline, &items))
            .await?;
        let profile = match extraction::parse_consolidation(&raw) {
            Ok(profile) => profile,
            Err(MemoryError::Serialization(msg)) => {
                tracing::warn!(user_id, error = %msg, "malformed consolidation output, skipping");
                return Ok(LongTermOutcome {
                    updated: false,
                    consumed: 0,
                    repaired,
                    version: expected_version,
                });
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let mut source_insight_ids = existing
            .as_ref()
            .map(|doc| doc.source_insight_ids.clone())
            .unwrap_or_default();
        source_insight_ids.extend(fresh.iter().map(|i| i.id.clone()));
        let doc = LongTermInsight {
            id: longterm_id,
            user_id: user_id.to_string(),
            insight_type: InsightType::LongTerm,
            insight_vector: self.backends.embed(&profile).await?,
            insight_text: profile,
            source_insight_ids,
            created_at: existing.as_ref().map_or(now, |doc| doc.created_at),
            updated_at: now,
        };
        let version = self
            .backends
            .compare_and_swap(Collection::Insights, doc.to_document()?, expected_version)
            .await?;

        let consumed = fresh.len();
        self.mark_processed(fresh).await?;
        tracing::info!(user_id, consumed, version, "long-term profile updated");
        Ok(LongTermOutcome {
            updated: true,
            consumed,
            repaired,
            version: Some(version),
        })
    }

    async fn mark_processed(&self, insights: Vec<SessionInsight>) -> MemoryResult<()> {
        for mut insight in insights {
            insight.processed = true;
            self.backends.put(&insight).await?;
        }
        Ok(())
    }
}

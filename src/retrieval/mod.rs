//! 事实检索：三个语料（交互块、会话摘要、洞察）的混合检索与融合
//!
//! 每个语料并发执行纯文本与纯向量两路查询，加权 RRF 融合；跨语料按（集合 + 内容）哈希去重，
//! 按与查询向量的余弦相似度降序、同分按时间新近排序，最后合成带出处编号的简短回答。

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures_util::future::{try_join, try_join_all};
use sha2::{Digest, Sha256};

use crate::core::error::MemoryResult;
use crate::core::Backends;
use crate::memory::tokenizer;
use crate::store::{cosine_similarity, Collection, Document, StoreQuery};

/// 短查询（不超过该词数）且含画像类线索时跳过交互块语料
const SHORT_QUERY_WORDS: usize = 4;
const PROFILE_CUES: &[&str] = &[
    "prefer", "prefers", "preference", "like", "likes", "favorite", "favourite", "who am",
    "my", "goal", "goals", "hobby", "hobbies", "interest", "interests", "about me", "喜欢",
    "偏好", "目标",
];

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub min_similarity: f32,
    pub vector_weight: f32,
    pub text_weight: f32,
    pub rrf_k: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.0,
            vector_weight: 2.0,
            text_weight: 1.0,
            rrf_k: 60.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Corpus {
    Chunks,
    Summaries,
    Insights,
}

impl Corpus {
    pub const ALL: [Corpus; 3] = [Corpus::Chunks, Corpus::Summaries, Corpus::Insights];

    pub fn collection(&self) -> Collection {
        match self {
            Corpus::Chunks => Collection::Interactions,
            Corpus::Summaries => Collection::Summaries,
            Corpus::Insights => Collection::Insights,
        }
    }

    fn text_fields(&self) -> &'static [&'static str] {
        match self {
            Corpus::Chunks => &["content", "summary", "metadata.mentioned_topics", "metadata.entities"],
            Corpus::Summaries => &["summary", "key_topics"],
            Corpus::Insights => &["insight_text", "category"],
        }
    }

    fn vector_field(&self) -> &'static str {
        match self {
            Corpus::Chunks | Corpus::Summaries => "summary_vector",
            Corpus::Insights => "insight_vector",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Corpus::Chunks => "conversation",
            Corpus::Summaries => "session summary",
            Corpus::Insights => "insight",
        }
    }

    fn snippet(&self, doc: &Document) -> String {
        match self {
            Corpus::Chunks => {
                let summary = doc.field_text("summary");
                if summary.is_empty() {
                    doc.field_text("content")
                } else {
                    summary
                }
            }
            Corpus::Summaries => doc.field_text("summary"),
            Corpus::Insights => doc.field_text("insight_text"),
        }
    }

    fn session_id(&self, doc: &Document) -> Option<String> {
        let id = match self {
            Corpus::Chunks => doc.field_text("session_id"),
            Corpus::Summaries => doc.field_text("id"),
            Corpus::Insights => doc.field_text("session_ids"),
        };
        (!id.is_empty()).then_some(id)
    }

    fn timestamp(&self, doc: &Document) -> Option<DateTime<Utc>> {
        let field = match self {
            Corpus::Chunks => "timestamp",
            Corpus::Summaries => "end_time",
            Corpus::Insights if doc.field("updated_at").is_some() => "updated_at",
            Corpus::Insights => "created_at",
        };
        doc.field_text(field).parse().ok()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FactSource {
    pub corpus: Corpus,
    pub document_id: String,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievedFact {
    pub snippet: String,
    pub source: FactSource,
    /// 与查询向量的余弦相似度
    pub score: f32,
    /// 语料内 RRF 融合分
    pub fusion_score: f32,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalAnswer {
    pub facts: Vec<RetrievedFact>,
    pub answer: String,
}

pub struct FactRetrieval {
    backends: Backends,
    settings: RetrievalSettings,
}

impl FactRetrieval {
    pub fn new(backends: Backends, settings: RetrievalSettings) -> Self {
        Self { backends, settings }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// 语料选择：短的画像类查询不查交互块
    pub fn select_corpora(query: &str) -> Vec<Corpus> {
        let tokens = tokenizer::tokenize_to_set(query);
        let lower = query.to_lowercase();
        let profile_like = PROFILE_CUES.iter().any(|cue| {
            if cue.contains(' ') || tokenizer::contains_cjk(cue) {
                lower.contains(cue)
            } else {
                tokens.contains(*cue)
            }
        });
        if profile_like && tokenizer::word_count(query) <= SHORT_QUERY_WORDS {
            vec![Corpus::Summaries, Corpus::Insights]
        } else {
            Corpus::ALL.to_vec()
        }
    }

    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> MemoryResult<Vec<RetrievedFact>> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let corpora = Self::select_corpora(query);
        let query_vector = self.backends.embed(query).await?;

        let per_corpus = try_join_all(
            corpora
                .iter()
                .map(|corpus| self.search_corpus(*corpus, user_id, query, &query_vector, top_k)),
        )
        .await?;

        let mut seen = HashSet::new();
        let mut facts: Vec<RetrievedFact> = per_corpus
            .into_iter()
            .flatten()
            .filter(|fact| fact.score >= self.settings.min_similarity)
            .filter(|fact| seen.insert(content_hash(fact.source.corpus, &fact.snippet)))
            .collect();
        facts.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        facts.truncate(top_k);
        tracing::debug!(user_id, query, corpora = ?corpora, hits = facts.len(), "fact retrieval");
        Ok(facts)
    }

    async fn search_corpus(
        &self,
        corpus: Corpus,
        user_id: &str,
        query: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> MemoryResult<Vec<RetrievedFact>> {
        let collection = corpus.collection();
        let candidates = top_k.saturating_mul(3).max(top_k);
        let text_query = StoreQuery::new()
            .filter("user_id", user_id)
            .text(query, corpus.text_fields());
        let vector_query = StoreQuery::new()
            .filter("user_id", user_id)
            .vector(query_vector.to_vec(), corpus.vector_field());

        let (text_hits, vector_hits) = try_join(
            self.backends.query(collection, &text_query, candidates),
            self.backends.query(collection, &vector_query, candidates),
        )
        .await?;

        // 加权 RRF：score = Σ weight / (rrf_k + rank)
        let mut fused: HashMap<String, (f32, Document)> = HashMap::new();
        for (weight, hits) in [
            (self.settings.text_weight, text_hits),
            (self.settings.vector_weight, vector_hits),
        ] {
            for (rank, hit) in hits.into_iter().enumerate() {
                let contribution = weight / (self.settings.rrf_k + rank as f32 + 1.0);
                fused
                    .entry(hit.document.id.clone())
                    .or_insert_with(|| (0.0, hit.document))
                    .0 += contribution;
            }
        }

        let mut ranked: Vec<(f32, Document)> = fused.into_values().collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        ranked.truncate(top_k);

        Ok(ranked
            .into_iter()
            .filter_map(|(fusion_score, doc)| {
                let snippet = corpus.snippet(&doc);
                if snippet.trim().is_empty() {
                    return None;
                }
                let score = doc
                    .field_vector(corpus.vector_field())
                    .map_or(0.0, |v| cosine_similarity(query_vector, &v));
                Some(RetrievedFact {
                    snippet,
                    source: FactSource {
                        corpus,
                        session_id: corpus.session_id(&doc),
                        document_id: doc.id.clone(),
                    },
                    score,
                    fusion_score,
                    timestamp: corpus.timestamp(&doc),
                })
            })
            .collect())
    }

    /// 检索并合成回答
    pub async fn answer(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> MemoryResult<RetrievalAnswer> {
        let facts = self.search(user_id, query, top_k).await?;
        let answer = synthesize(query, &facts);
        Ok(RetrievalAnswer { facts, answer })
    }
}

fn content_hash(corpus: Corpus, snippet: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(corpus.collection().name().as_bytes());
    hasher.update([0u8]);
    hasher.update(snippet.trim().as_bytes());
    hasher.finalize().into()
}

/// 按排序输出编号事实，每条带来源、日期与相似度
pub fn synthesize(query: &str, facts: &[RetrievedFact]) -> String {
    if facts.is_empty() {
        return format!("No relevant memories found for \"{}\".", query.trim());
    }
    let mut lines = vec![format!("Relevant memories for \"{}\":", query.trim())];
    for (i, fact) in facts.iter().enumerate() {
        let mut source = fact.source.corpus.label().to_string();
        if let Some(session) = &fact.source.session_id {
            source.push(' ');
            source.push_str(session);
        }
        if let Some(ts) = fact.timestamp {
            source.push_str(&format!(", {}", ts.format("%Y-%m-%d")));
        }
        lines.push(format!(
            "{}. [{}; similarity {:.2}] {}",
            i + 1,
            source,
            fact.score,
            fact.snippet.trim()
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::model::{ReflectionStatus, SessionStatus, SessionSummary};
    use crate::testing::test_backends;

    async fn put_summary(backends: &Backends, user: &str, session: &str, text: &str, day: u32) {
        let end_time: DateTime<Utc> = format!("2024-05-{day:02}T10:00:00Z").parse().unwrap();
        let summary = SessionSummary {
            id: session.to_string(),
            user_id: user.to_string(),
            start_time: end_time,
            end_time,
            summary: text.to_string(),
            summary_vector: backends.embed(text).await.unwrap(),
            key_topics: Vec::new(),
            extracted_insights: Vec::new(),
            status: SessionStatus::Ended,
            reflection_status: ReflectionStatus::NoInsight,
        };
        backends.put(&summary).await.unwrap();
    }

    fn retrieval(backends: &Backends) -> FactRetrieval {
        FactRetrieval::new(backends.clone(), RetrievalSettings::default())
    }

    #[test]
    fn test_short_profile_queries_skip_chunks() {
        assert_eq!(
            FactRetrieval::select_corpora("what do I like"),
            vec![Corpus::Summaries, Corpus::Insights]
        );
        assert_eq!(
            FactRetrieval::select_corpora("what did we say about the mortgage rate last week"),
            Corpus::ALL.to_vec()
        );
        assert_eq!(FactRetrieval::select_corpora("mortgage"), Corpus::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity_and_isolates_users() {
        let (backends, _, _) = test_backends();
        put_summary(&backends, "u1", "s1", "Discussed retirement savings and index funds", 1).await;
        put_summary(&backends, "u1", "s2", "Planned a hiking trip to the mountains", 2).await;
        put_summary(&backends, "u2", "s9", "Index funds for retirement savings", 3).await;

        let facts = retrieval(&backends)
            .search("u1", "retirement index funds", 5)
            .await
            .unwrap();
        assert!(!facts.is_empty());
        assert_eq!(facts[0].source.session_id.as_deref(), Some("s1"));
        assert!(facts.iter().all(|f| f.source.session_id.as_deref() != Some("s9")));
        assert!(facts.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let (backends, _, _) = test_backends();
        put_summary(&backends, "u1", "s1", "Talked about the family budget", 1).await;
        put_summary(&backends, "u1", "s2", "Talked about the family budget", 2).await;
        let facts = retrieval(&backends)
            .search("u1", "family budget spreadsheet", 5)
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[tokio::test]
    async fn test_min_similarity_filters_weak_hits() {
        let (backends, _, _) = test_backends();
        put_summary(&backends, "u1", "s1", "Chocolate cake recipe", 1).await;
        let strict = FactRetrieval::new(
            backends.clone(),
            RetrievalSettings {
                min_similarity: 0.5,
                ..RetrievalSettings::default()
            },
        );
        let facts = strict.search("u1", "quarterly tax filing", 5).await.unwrap();
        assert!(facts.is_empty());
    }

    #[test]
    fn test_synthesize_preserves_provenance() {
        let facts = vec![RetrievedFact {
            snippet: "Prefers index funds".into(),
            source: FactSource {
                corpus: Corpus::Insights,
                document_id: "u1:s1:insight:00".into(),
                session_id: Some("s1".into()),
            },
            score: 0.8123,
            fusion_score: 0.03,
            timestamp: Some("2024-05-01T10:00:00Z".parse().unwrap()),
        }];
        let text = synthesize("investing", &facts);
        assert!(text.contains("1. [insight s1, 2024-05-01; similarity 0.81] Prefers index funds"));
        assert!(synthesize("x", &[]).starts_with("No relevant memories"));
    }
}

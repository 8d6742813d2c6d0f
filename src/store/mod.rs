//! 文档存储抽象
//!
//! 核心只依赖 `DocumentStore` trait：按集合存取 JSON 文档、按过滤/文本/向量查询、
//! 以及长期画像所需的 compare-and-swap。具体实现：
//! - `InMemoryStore`：进程内实现，供测试与演示
//! - `SqliteStore`：SQLite 持久化（feature `sqlite`）

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::error::{MemoryError, MemoryResult};
use crate::memory::tokenizer;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// 四个集合：交互块、会话摘要、洞察（会话级与长期）、会话快照
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Interactions,
    Summaries,
    Insights,
    Sessions,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Interactions,
        Collection::Summaries,
        Collection::Insights,
        Collection::Sessions,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Interactions => "interactions",
            Collection::Summaries => "session_summaries",
            Collection::Insights => "insights",
            Collection::Sessions => "sessions",
        }
    }
}

/// 存储中的一份文档；version 由存储在每次写入时递增（未写入过为 0）
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
    pub version: u64,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
            version: 0,
        }
    }

    /// 按点分路径取字段（如 `metadata.entities`）
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.body, |value, key| value.get(key))
    }

    /// 将字段展开为可检索的纯文本：字符串原样，数组拼接其中的字符串
    pub fn field_text(&self, path: &str) -> String {
        match self.field(path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }

    pub fn field_vector(&self, path: &str) -> Option<Vec<f32>> {
        let items = self.field(path)?.as_array()?;
        items
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    }
}

/// 可存入某个集合的强类型文档
pub trait StoredDocument: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn doc_id(&self) -> String;

    fn to_document(&self) -> MemoryResult<Document> {
        Ok(Document::new(self.doc_id(), serde_json::to_value(self)?))
    }

    fn from_document(doc: &Document) -> MemoryResult<Self> {
        serde_json::from_value(doc.body.clone()).map_err(|e| {
            MemoryError::Store(format!(
                "decode {} document {}: {e}",
                Self::COLLECTION.name(),
                doc.id
            ))
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextMatch {
    pub text: String,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorMatch {
    pub vector: Vec<f32>,
    pub field: String,
}

/// 查询条件：字段相等过滤 + 可选文本匹配 + 可选向量相似度 + 可选排序字段
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreQuery {
    pub filters: Vec<(String, Value)>,
    pub text: Option<TextMatch>,
    pub vector: Option<VectorMatch>,
    /// 无打分时按该字段降序排列（字符串/数字比较）
    pub order_by_desc: Option<String>,
}

impl StoreQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn text(mut self, text: impl Into<String>, fields: &[&str]) -> Self {
        self.text = Some(TextMatch {
            text: text.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn vector(mut self, vector: Vec<f32>, field: impl Into<String>) -> Self {
        self.vector = Some(VectorMatch {
            vector,
            field: field.into(),
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by_desc = Some(field.into());
        self
    }

    fn matches_filters(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| doc.field(field) == Some(expected))
    }
}

/// 查询结果；score 仅在有文本或向量条件时存在
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: Option<f32>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 插入或覆盖，返回文档 id
    async fn upsert(&self, collection: Collection, doc: Document) -> MemoryResult<String>;

    async fn get(&self, collection: Collection, id: &str) -> MemoryResult<Option<Document>>;

    async fn query(
        &self,
        collection: Collection,
        query: &StoreQuery,
        top_k: usize,
    ) -> MemoryResult<Vec<ScoredDocument>>;

    /// 仅当当前版本等于 expected（None 表示必须不存在）时写入，返回新版本号；
    /// 版本不符返回 `MemoryError::VersionConflict`
    async fn compare_and_swap(
        &self,
        collection: Collection,
        doc: Document,
        expected: Option<u64>,
    ) -> MemoryResult<u64>;
}

/// 对一批候选文档执行查询（各实现共用）
pub(crate) fn evaluate(
    query: &StoreQuery,
    docs: impl IntoIterator<Item = Document>,
    top_k: usize,
) -> Vec<ScoredDocument> {
    let query_tokens = query
        .text
        .as_ref()
        .map(|t| tokenizer::tokenize_to_set(&t.text));

    let mut scored: Vec<ScoredDocument> = docs
        .into_iter()
        .filter(|doc| query.matches_filters(doc))
        .filter_map(|doc| {
            if query.text.is_none() && query.vector.is_none() {
                return Some(ScoredDocument {
                    document: doc,
                    score: None,
                });
            }
            let mut score = 0.0;
            if let (Some(text), Some(tokens)) = (&query.text, &query_tokens) {
                let haystack = text
                    .fields
                    .iter()
                    .map(|f| doc.field_text(f))
                    .collect::<Vec<_>>()
                    .join(" ");
                let lexical = tokenizer::lexical_score(tokens, &haystack);
                if lexical <= 0.0 {
                    return None;
                }
                score += lexical;
            }
            if let Some(vector) = &query.vector {
                let doc_vector = doc.field_vector(&vector.field)?;
                score += cosine_similarity(&vector.vector, &doc_vector);
            }
            Some(ScoredDocument {
                document: doc,
                score: Some(score),
            })
        })
        .collect();

    if query.text.is_some() || query.vector.is_some() {
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
        });
    } else if let Some(field) = &query.order_by_desc {
        scored.sort_by(|a, b| {
            compare_values(b.document.field(field), a.document.field(field))
        });
    }
    scored.truncate(top_k);
    scored
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// 余弦相似度；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str, body: Value) -> Document {
        Document::new(id, body)
    }

    #[test]
    fn test_field_paths_and_text() {
        let d = doc(
            "a",
            json!({"summary": "retirement plan", "metadata": {"entities": ["401k", "IRA"]}}),
        );
        assert_eq!(d.field_text("summary"), "retirement plan");
        assert_eq!(d.field_text("metadata.entities"), "401k IRA");
        assert_eq!(d.field_text("missing"), "");
    }

    #[test]
    fn test_evaluate_filters_and_orders() {
        let docs = vec![
            doc("1", json!({"user_id": "u1", "end_time": "2024-01-01"})),
            doc("2", json!({"user_id": "u2", "end_time": "2024-03-01"})),
            doc("3", json!({"user_id": "u1", "end_time": "2024-02-01"})),
        ];
        let q = StoreQuery::new().filter("user_id", "u1").order_by_desc("end_time");
        let ids: Vec<_> = evaluate(&q, docs, 10)
            .into_iter()
            .map(|d| d.document.id)
            .collect();
        assert_eq!(ids, vec!["3", "1"]);
    }

    #[test]
    fn test_evaluate_text_drops_non_matching() {
        let docs = vec![
            doc("1", json!({"summary": "talked about hiking boots"})),
            doc("2", json!({"summary": "budget for groceries"})),
        ];
        let q = StoreQuery::new().text("hiking trip", &["summary"]);
        let hits = evaluate(&q, docs, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "1");
        assert!(hits[0].score.unwrap() > 0.0);
    }

    #[test]
    fn test_evaluate_vector_ranks_by_cosine() {
        let docs = vec![
            doc("far", json!({"v": [0.0, 1.0]})),
            doc("near", json!({"v": [1.0, 0.1]})),
            doc("novec", json!({})),
        ];
        let q = StoreQuery::new().vector(vec![1.0, 0.0], "v");
        let hits = evaluate(&q, docs, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.id, "near");
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}

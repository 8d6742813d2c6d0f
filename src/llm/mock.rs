//! 确定性 Mock 后端（无需 API，用于演示与测试）
//!
//! - `MockCompletion`：按 system 消息首行的任务类型生成合法的结构化输出
//! - `HashEmbedder`：词袋哈希向量，相同词汇的文本余弦相似度高

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::core::error::MemoryResult;
use crate::llm::{CompletionService, EmbeddingService};
use crate::memory::prompts::{self, PromptKind};
use crate::memory::{tokenizer, Message, Role};

const STOPWORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "have", "what", "about", "would", "could", "should",
    "your", "from", "just", "like", "they", "them", "there", "their", "been", "were", "will",
    "when", "which", "into", "some", "more", "also", "very", "really", "user", "assistant",
    "system", "i'm", "it's", "don't", "want", "prefer", "love",
];

const INSIGHT_CUES: &[(&str, &str)] = &[
    ("i prefer", "preference"),
    ("i like", "preference"),
    ("i love", "preference"),
    ("my favorite", "preference"),
    ("my goal", "goal"),
    ("i want to", "goal"),
    ("i'm saving", "goal"),
    ("i am saving", "goal"),
    ("i work", "fact"),
    ("i live", "fact"),
];

#[derive(Debug, Default, Clone)]
pub struct MockCompletion;

impl MockCompletion {
    pub fn new() -> Self {
        Self
    }
}

fn user_lines(conversation: &str) -> Vec<&str> {
    conversation
        .lines()
        .filter_map(|line| line.strip_prefix("user: "))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

fn top_topics(text: &str, max: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, token) in tokenizer::tokenize(text).into_iter().enumerate() {
        if token.chars().count() < 4 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        counts.entry(token).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<_> = counts.into_iter().collect();
    // 频次降序，首次出现位置升序
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(max).map(|(t, _)| t).collect()
}

fn entities(lines: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in lines {
        for word in line.split_whitespace().skip(1) {
            let word = word.trim_matches(|c: char| !c.is_alphanumeric());
            let capitalized = word.chars().next().is_some_and(char::is_uppercase);
            if capitalized && word.len() > 1 && !out.iter().any(|e| e == word) {
                out.push(word.to_string());
            }
        }
    }
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

fn respond(kind: PromptKind, input: &str) -> String {
    match kind {
        PromptKind::ChunkMetadata => {
            let conversation = prompts::section(input, "conversation").unwrap_or(input);
            let lines = user_lines(conversation);
            let summary = if lines.is_empty() {
                "Brief exchange with no user statements.".to_string()
            } else {
                format!("User said: {}", truncate(&lines.join("; "), 240))
            };
            json!({
                "summary": summary,
                "mentioned_topics": top_topics(conversation, 5),
                "entities": entities(&lines),
            })
            .to_string()
        }
        PromptKind::FoldSummary => {
            let previous = prompts::section(input, "previous_summary").unwrap_or("");
            let chunk = prompts::section(input, "new_chunk_summary").unwrap_or("");
            match (previous.is_empty(), chunk.is_empty()) {
                (true, _) => chunk.to_string(),
                (false, true) => previous.to_string(),
                (false, false) => format!("{previous}\n{chunk}"),
            }
        }
        PromptKind::SessionAnalysis => {
            let summary = prompts::section(input, "conversation_summary").unwrap_or("");
            let final_turns = prompts::section(input, "final_turns").unwrap_or("");
            json!({
                "summary": truncate(summary, 400),
                "key_topics": top_topics(&format!("{summary}\n{final_turns}"), 5),
            })
            .to_string()
        }
        PromptKind::InsightExtraction => {
            let session = prompts::section(input, "session").unwrap_or(input);
            let insights: Vec<_> = user_lines(session)
                .into_iter()
                .filter_map(|line| {
                    let lower = line.to_lowercase();
                    INSIGHT_CUES
                        .iter()
                        .find(|(cue, _)| lower.contains(cue))
                        .map(|(_, category)| {
                            json!({
                                "category": category,
                                "insight_text": format!("User said: {line}"),
                                "confidence": 0.9,
                                "importance": "medium",
                            })
                        })
                })
                .collect();
            if insights.is_empty() {
                json!({"verdict": "no_insight"}).to_string()
            } else {
                json!({"verdict": "insights", "insights": insights}).to_string()
            }
        }
        PromptKind::Consolidation => {
            let current = prompts::section(input, "current_profile").unwrap_or("");
            let new_items = prompts::section(input, "new_insights").unwrap_or("");
            let mut lines: Vec<String> = current
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            for item in new_items.lines().map(|l| l.trim().trim_start_matches("- ")) {
                let item = format!("- {item}");
                if item.len() > 2 && !lines.contains(&item) {
                    lines.push(item);
                }
            }
            json!({"profile": lines.join("\n")}).to_string()
        }
    }
}

#[async_trait]
impl CompletionService for MockCompletion {
    async fn complete(&self, messages: &[Message]) -> MemoryResult<String> {
        let input = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        match PromptKind::detect(messages) {
            Some(kind) => Ok(respond(kind, input)),
            None => Ok(format!("Echo from Mock: {input}")),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 词袋哈希嵌入：每个词经 SHA-256 映射到一个维度与符号，结果做 L2 归一化
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenizer::tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

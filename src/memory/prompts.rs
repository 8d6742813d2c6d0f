//! 各阶段的提示词构造
//!
//! 每个 system 消息首行是 `task: <kind>`，输入材料用 `<tag>...</tag>` 包裹；
//! 需要结构化输出的任务附带 schemars 生成的 JSON Schema。

use schemars::{schema_for, JsonSchema};

use crate::memory::extraction::{ChunkAnalysis, ConsolidatedProfile, RawExtraction, SessionAnalysis};
use crate::memory::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PromptKind {
    ChunkMetadata,
    FoldSummary,
    SessionAnalysis,
    InsightExtraction,
    Consolidation,
}

impl PromptKind {
    pub const ALL: [PromptKind; 5] = [
        PromptKind::ChunkMetadata,
        PromptKind::FoldSummary,
        PromptKind::SessionAnalysis,
        PromptKind::InsightExtraction,
        PromptKind::Consolidation,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            PromptKind::ChunkMetadata => "chunk-metadata",
            PromptKind::FoldSummary => "fold-summary",
            PromptKind::SessionAnalysis => "session-analysis",
            PromptKind::InsightExtraction => "insight-extraction",
            PromptKind::Consolidation => "consolidation",
        }
    }

    /// 从 system 消息首行识别任务类型
    pub fn detect(messages: &[Message]) -> Option<Self> {
        let first_line = messages.first()?.content.lines().next()?.trim();
        let tag = first_line.strip_prefix("task:")?.trim();
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

fn schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

fn system(kind: PromptKind, instructions: &str, schema: Option<String>) -> Message {
    let mut content = format!("task: {}\n{}", kind.tag(), instructions);
    if let Some(schema) = schema {
        content.push_str("\n\nRespond with a single JSON object matching this schema:\n");
        content.push_str(&schema);
    }
    Message::system(content)
}

fn wrap(tag: &str, body: &str) -> String {
    format!("<{tag}>\n{}\n</{tag}>", body.trim())
}

/// 取出 `<tag>...</tag>` 之间的内容
pub fn section<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim())
}

pub fn chunk_metadata(content: &str) -> Vec<Message> {
    vec![
        system(
            PromptKind::ChunkMetadata,
            "Summarize this slice of a conversation in one or two sentences. \
             List at most 5 topics and any named entities (people, places, products, accounts).",
            Some(schema_json::<ChunkAnalysis>()),
        ),
        Message::user(wrap("conversation", content)),
    ]
}

pub fn fold_summary(previous: &str, chunk_summary: &str) -> Vec<Message> {
    vec![
        system(
            PromptKind::FoldSummary,
            "Merge the new chunk summary into the running conversation summary. \
             Keep every fact from the running summary, add what is new, stay concise. \
             Reply with the merged summary text only.",
            None,
        ),
        Message::user(format!(
            "{}\n\n{}",
            wrap("previous_summary", previous),
            wrap("new_chunk_summary", chunk_summary)
        )),
    ]
}

pub fn session_analysis(cumulative_summary: &str, final_content: &str) -> Vec<Message> {
    vec![
        system(
            PromptKind::SessionAnalysis,
            "Write a short summary of the whole session and list 1 to 5 key topics.",
            Some(schema_json::<SessionAnalysis>()),
        ),
        Message::user(format!(
            "{}\n\n{}",
            wrap("conversation_summary", cumulative_summary),
            wrap("final_turns", final_content)
        )),
    ]
}

pub fn insight_extraction(transcript: &str, categories: &[String]) -> Vec<Message> {
    let categories = if categories.is_empty() {
        "any".to_string()
    } else {
        categories.join(", ")
    };
    vec![
        system(
            PromptKind::InsightExtraction,
            &format!(
                "Extract durable facts about the user: preferences, goals, circumstances. \
                 Suggested categories: {categories}. Give each a confidence between 0 and 1 \
                 and an importance of high, medium or low. If the session is small talk, \
                 answer with verdict no_insight."
            ),
            Some(schema_json::<RawExtraction>()),
        ),
        Message::user(wrap("session", transcript)),
    ]
}

pub fn consolidation(baseline: Option<&str>, items: &[String]) -> Vec<Message> {
    let items = items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    vec![
        system(
            PromptKind::Consolidation,
            "Revise the user profile with the new insights. Keep still-valid facts from the \
             current profile, resolve contradictions in favour of newer insights.",
            Some(schema_json::<ConsolidatedProfile>()),
        ),
        Message::user(format!(
            "{}\n\n{}",
            wrap("current_profile", baseline.unwrap_or("")),
            wrap("new_insights", &items)
        )),
    ]
}

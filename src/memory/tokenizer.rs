//! 分词与词法打分
//!
//! 中英文混合：含 CJK 字符时用 jieba 搜索引擎模式切词，否则按非字母数字字符切分。
//! 文档存储的文本检索与事实检索的语料选择都基于这里的结果。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 切词并转小写；丢弃单个拉丁字符与纯标点
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| keep_token(s))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '\'')
            .map(|s| s.trim_matches('\'').to_lowercase())
            .filter(|s| keep_token(s))
            .collect()
    }
}

fn keep_token(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        None => false,
        Some(first) if chars.next().is_none() => is_cjk(first) || first.is_ascii_digit(),
        Some(_) => s.chars().any(char::is_alphanumeric),
    }
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 查询词在文本中的覆盖率（0..=1）；查询为空时为 0
pub fn lexical_score(query_tokens: &HashSet<String>, haystack: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens = tokenize_to_set(haystack);
    if doc_tokens.is_empty() {
        return 0.0;
    }
    let hits = query_tokens.intersection(&doc_tokens).count() as f32;
    hits / query_tokens.len() as f32
}

/// 词数（CJK 按切词结果计）
pub fn word_count(text: &str) -> usize {
    tokenize(text).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("What's my 401k plan? I like Rust!");
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.contains(&"401k".to_string()));
        assert!(tokens.contains(&"what's".to_string()));
        assert!(!tokens.iter().any(|t| t == "i"));
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("智能")));
    }

    #[test]
    fn test_lexical_score_is_query_coverage() {
        let q = tokenize_to_set("hiking boots");
        assert!((lexical_score(&q, "new hiking boots for the trip") - 1.0).abs() < 1e-6);
        assert!((lexical_score(&q, "went hiking") - 0.5).abs() < 1e-6);
        assert_eq!(lexical_score(&q, "groceries"), 0.0);
        assert_eq!(lexical_score(&HashSet::new(), "anything"), 0.0);
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("what do I like"), 3);
        assert_eq!(word_count("   "), 0);
    }
}

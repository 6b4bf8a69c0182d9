//! Comment content handling: prompt rendering, the German AI-disclosure
//! prefix, and generated-comment validation.
//!
//! Prompt templates carry `{name}` placeholders drawn from a fixed
//! recognized set; rendering substitutes values from an article snapshot.
//! Every comment that leaves the system must start with the configured
//! disclosure prefix, applied idempotently.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Placeholders a template may reference.
pub const RECOGNIZED_PLACEHOLDERS: &[&str] = &[
    "article_title",
    "article_content",
    "article_author",
    "article_category",
    "article_published_at",
    "article_url",
    "platform_username",
];

/// Article content is clipped to this many characters before substitution
/// to keep prompts bounded.
const MAX_CONTENT_CHARS: usize = 2000;

/// Values substituted into a prompt template.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub article_title: String,
    pub article_content: String,
    pub article_author: String,
    pub article_category: Option<i64>,
    pub article_published_at: Option<DateTime<Utc>>,
    pub article_url: String,
    pub platform_username: String,
}

impl PromptContext {
    fn values(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        map.insert("article_title", self.article_title.clone());
        map.insert(
            "article_content",
            clip_chars(&self.article_content, MAX_CONTENT_CHARS),
        );
        map.insert("article_author", self.article_author.clone());
        map.insert(
            "article_category",
            self.article_category.map(|c| c.to_string()).unwrap_or_default(),
        );
        map.insert(
            "article_published_at",
            self.article_published_at
                .map(|ts| ts.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        );
        map.insert("article_url", self.article_url.clone());
        map.insert("platform_username", self.platform_username.clone());
        map
    }
}

/// Extract the distinct placeholder names used in a template.
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Placeholder names used in a template that are not recognized.
pub fn unknown_placeholders(template: &str) -> Vec<String> {
    extract_placeholders(template)
        .into_iter()
        .filter(|name| !RECOGNIZED_PLACEHOLDERS.contains(&name.as_str()))
        .collect()
}

/// Render a user prompt template against an article snapshot.
pub fn render_prompt(template: &str, context: &PromptContext) -> String {
    let mut rendered = template.to_string();
    for (name, value) in context.values() {
        rendered = rendered.replace(&format!("{{{name}}}"), &value);
    }
    rendered
}

/// Ensure a comment starts with the AI-disclosure prefix.
///
/// Idempotent: a comment already carrying the prefix is returned unchanged,
/// so applying the prefixer twice equals applying it once.
pub fn ensure_ai_prefix(prefix: &str, comment: &str) -> String {
    if comment.starts_with(prefix) {
        return comment.to_string();
    }
    if comment.starts_with(' ') {
        format!("{prefix}{comment}")
    } else {
        format!("{prefix} {comment}")
    }
}

/// Result of validating a generated comment.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub has_ai_prefix: bool,
    pub content_length: usize,
    pub errors: Vec<String>,
}

/// Validate a generated comment against the quality rules.
///
/// Length bounds apply to the text without the prefix. Repetitive output
/// and output with unresolved placeholder markers are rejected.
pub fn validate_comment(
    comment: &str,
    prefix: &str,
    min_length: usize,
    max_length: usize,
) -> ValidationReport {
    let mut errors = Vec::new();

    let has_ai_prefix = comment.starts_with(prefix);
    if !has_ai_prefix {
        errors.push("missing required AI disclosure prefix".to_string());
    }

    let without_prefix = comment.replace(prefix, "");
    let without_prefix = without_prefix.trim();
    let content_length = without_prefix.chars().count();

    if without_prefix.is_empty() {
        errors.push("comment is empty after the prefix".to_string());
    } else {
        if content_length < min_length {
            errors.push(format!(
                "comment too short ({content_length} < {min_length} chars)"
            ));
        }
        if content_length > max_length {
            errors.push(format!(
                "comment too long ({content_length} > {max_length} chars)"
            ));
        }
    }

    let words: Vec<&str> = without_prefix.split_whitespace().collect();
    if words.len() > 5 {
        let unique: std::collections::HashSet<&&str> = words.iter().collect();
        if unique.len() * 2 < words.len() {
            errors.push("comment appears to be repetitive".to_string());
        }
    }

    for pattern in [placeholder_re(), tag_re(), bracket_re()] {
        if pattern.is_match(without_prefix) {
            errors.push("comment contains unresolved placeholders".to_string());
            break;
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        has_ai_prefix,
        content_length,
        errors,
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^}]+)\}").expect("placeholder regex must compile"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag regex must compile"))
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]").expect("bracket regex must compile"))
}

/// Clip a string to at most `max` characters on a char boundary.
fn clip_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "[Dieser Kommentar stammt von einem KI-ChatBot.]";

    #[test]
    fn placeholders_extracted_and_deduped() {
        let template = "Titel: {article_title}\n{article_content}\nNochmal: {article_title}";
        assert_eq!(
            extract_placeholders(template),
            vec!["article_content", "article_title"]
        );
    }

    #[test]
    fn unknown_placeholders_detected() {
        let template = "{article_title} {secret_field}";
        assert_eq!(unknown_placeholders(template), vec!["secret_field"]);
    }

    #[test]
    fn render_substitutes_all_recognized_values() {
        let context = PromptContext {
            article_title: "Mein Haustier".to_string(),
            article_content: "Mein Hund heisst Bello.".to_string(),
            article_author: "Lena".to_string(),
            article_category: Some(4),
            article_published_at: "2024-03-01T10:00:00Z".parse().ok(),
            article_url: "https://platform.example/article/101/".to_string(),
            platform_username: "klasse3a".to_string(),
        };
        let rendered = render_prompt(
            "Titel: {article_title}; Autor: {article_author}; Kategorie: {article_category}; \
             Datum: {article_published_at}; Konto: {platform_username}",
            &context,
        );
        assert_eq!(
            rendered,
            "Titel: Mein Haustier; Autor: Lena; Kategorie: 4; Datum: 2024-03-01; Konto: klasse3a"
        );
    }

    #[test]
    fn render_clips_long_content() {
        let context = PromptContext {
            article_content: "x".repeat(5000),
            ..PromptContext::default()
        };
        let rendered = render_prompt("{article_content}", &context);
        assert_eq!(rendered.chars().count(), 2000);
    }

    #[test]
    fn missing_optional_values_render_empty() {
        let context = PromptContext::default();
        assert_eq!(render_prompt("[{article_published_at}]", &context), "[]");
    }

    #[test]
    fn prefix_added_with_separator() {
        assert_eq!(
            ensure_ai_prefix(PREFIX, "Ein schöner Artikel."),
            format!("{PREFIX} Ein schöner Artikel.")
        );
    }

    #[test]
    fn prefix_application_is_idempotent() {
        let once = ensure_ai_prefix(PREFIX, "Ein schöner Artikel.");
        let twice = ensure_ai_prefix(PREFIX, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn prefix_respects_existing_leading_space() {
        assert_eq!(
            ensure_ai_prefix(PREFIX, " schon mit Abstand"),
            format!("{PREFIX} schon mit Abstand")
        );
    }

    #[test]
    fn validation_happy_path() {
        let comment = ensure_ai_prefix(
            PREFIX,
            "Das ist ein wirklich gelungener Text mit vielen schönen Details und einer klaren Struktur.",
        );
        let report = validate_comment(&comment, PREFIX, 50, 500);
        assert!(report.is_valid, "errors: {:?}", report.errors);
        assert!(report.has_ai_prefix);
    }

    #[test]
    fn validation_rejects_missing_prefix() {
        let report = validate_comment("Ohne Präfix, aber lang genug für die Mindestlänge hier.", PREFIX, 10, 500);
        assert!(!report.is_valid);
        assert!(!report.has_ai_prefix);
    }

    #[test]
    fn validation_rejects_too_short_and_too_long() {
        let short = ensure_ai_prefix(PREFIX, "Zu kurz.");
        let report = validate_comment(&short, PREFIX, 50, 500);
        assert!(report.errors.iter().any(|e| e.contains("too short")));

        let long = ensure_ai_prefix(PREFIX, &"lang ".repeat(200));
        let report = validate_comment(&long, PREFIX, 50, 500);
        assert!(report.errors.iter().any(|e| e.contains("too long")));
    }

    #[test]
    fn validation_rejects_repetitive_text() {
        let repetitive = ensure_ai_prefix(PREFIX, &"toll toll toll toll toll toll toll toll".repeat(3));
        let report = validate_comment(&repetitive, PREFIX, 10, 5000);
        assert!(report.errors.iter().any(|e| e.contains("repetitive")));
    }

    #[test]
    fn validation_rejects_leftover_placeholders() {
        for bad in [
            "Ein Kommentar über {article_title} mit offenem Platzhalter und genug Länge dahinter.",
            "Ein Kommentar mit <tag> darin und ansonsten ausreichend vielen Wörtern und Zeichen.",
            "Ein Kommentar mit [Klammern] darin und ansonsten ausreichend vielen Wörtern hier.",
        ] {
            let comment = ensure_ai_prefix(PREFIX, bad);
            let report = validate_comment(&comment, PREFIX, 10, 500);
            assert!(
                report.errors.iter().any(|e| e.contains("unresolved")),
                "expected placeholder rejection for: {bad}"
            );
        }
    }

    #[test]
    fn validation_counts_length_without_prefix() {
        let body = "a".repeat(60);
        let comment = ensure_ai_prefix(PREFIX, &body);
        let report = validate_comment(&comment, PREFIX, 50, 500);
        assert_eq!(report.content_length, 60);
        assert!(report.is_valid);
    }
}

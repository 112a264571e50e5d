use regex::Regex;

/// Substituted when a reply is missing or nothing is left after filtering.
pub const FALLBACK_REPLY: &str = "Could not get a response.";

/// Post-processing applied to a backend reply before it is stored.
pub trait ReplyFilter: Send + Sync {
    fn apply(&self, text: &str) -> String;
}

/// Removes `<think>...</think>` reasoning traces, including the whitespace
/// that follows each block.
pub struct ThinkTagFilter {
    pattern: Regex,
}

impl ThinkTagFilter {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_tags("<think>", "</think>")
    }

    pub fn with_tags(open: &str, close: &str) -> anyhow::Result<Self> {
        let pattern = Regex::new(&format!(
            r"(?s){}.*?{}\s*",
            regex::escape(open),
            regex::escape(close)
        ))?;
        Ok(Self { pattern })
    }
}

impl ReplyFilter for ThinkTagFilter {
    fn apply(&self, text: &str) -> String {
        self.pattern.replace_all(text, "").into_owned()
    }
}

pub struct NoopFilter;

impl ReplyFilter for NoopFilter {
    fn apply(&self, text: &str) -> String {
        text.to_string()
    }
}

pub fn clean_reply(filter: &dyn ReplyFilter, prediction: Option<&str>) -> String {
    let raw = match prediction {
        Some(text) if !text.is_empty() => text,
        _ => return FALLBACK_REPLY.to_string(),
    };

    let cleaned = filter.apply(raw);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_REPLY.to_string()
    } else {
        cleaned.to_string()
    }
}

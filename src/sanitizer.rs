//! Output sanitizer for provider replies
//!
//! Some free-tier backends leak chat-template markup, reasoning blocks or prompt fragments into
//! the text they return. The router cleans every reply before deciding whether it counts as a
//! real answer, so a reply that is nothing but artifacts is treated as an empty response.
use regex::Regex;
use std::sync::LazyLock;

static THINK_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think(?:ing)?>.*?</think(?:ing)?>").unwrap());

static MARKUP_LADDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</message>\s*</start>\s*assistant\s*</channel>\s*final\s*</message>").unwrap()
});

static CHANNEL_FINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</channel>\s*final\s*</message>").unwrap());

static STRAY_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?start>\s*assistant\b[^>]*>|<\s*/?(?:channel|message)\b[^>]*>").unwrap()
});

static HORIZONTAL_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\S\n]+").unwrap());

static PROMPT_LEAK_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:[\[(]\s*channel\s*[\])]\s*:?|channel\s*:|commentary\s*:)\s*").unwrap()
});

const QUOTE_PAIRS: [(&str, &str); 5] = [
    ("\"", "\""),
    ("\u{201c}", "\u{201d}"),
    ("\u{201e}", "\u{201d}"),
    ("\u{ab}", "\u{bb}"),
    ("'", "'"),
];

/// Cleans a raw provider reply. Returns an empty string when nothing but artifacts remain.
pub fn sanitize_reply(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n").replace('\r', "\n");
    let text = THINK_BLOCKS.replace_all(&text, "");
    let text = MARKUP_LADDER.replace_all(&text, " ");
    let text = CHANNEL_FINAL.replace_all(&text, " ");
    let text = STRAY_TAGS.replace_all(&text, " ");
    let text = HORIZONTAL_WS.replace_all(&text, " ");

    let text = strip_wrapping_quotes(text.trim());
    let mut text = text;
    while let Some(m) = PROMPT_LEAK_PREFIX.find(text) {
        if m.end() == 0 {
            break;
        }
        text = text[m.end()..].trim_start();
    }
    strip_wrapping_quotes(text).to_string()
}

fn strip_wrapping_quotes(text: &str) -> &str {
    let trimmed = text.trim();
    for (start, end) in QUOTE_PAIRS {
        if trimmed.len() >= start.len() + end.len()
            && trimmed.starts_with(start)
            && trimmed.ends_with(end)
        {
            return trimmed[start.len()..trimmed.len() - end.len()].trim();
        }
    }
    trimmed
}

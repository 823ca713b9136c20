//! Pull payloads out of raw backend responses.
//!
//! Backends sometimes wrap generated code in prose and markdown fences and
//! sometimes return bare source. Everything here is pure.

use regex::Regex;
use std::sync::OnceLock;

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*(?:[A-Za-z0-9_+.#-]+)?[ \t]*\r?\n(?P<code>.*?)```")
            .expect("valid fenced block regex")
    })
}

fn inline_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Only well-known tags are stripped; "```x = 1```" has no tag.
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:(?:python3?|py|json)[ \t]+)?(?P<code>.*?)```")
            .expect("valid inline fence regex")
    })
}

/// Return the interior of the first fenced code block, trimmed, or the whole
/// input trimmed when no fence is present.
pub fn extract_code(raw: &str) -> String {
    if let Some(code) = fenced_block(raw) {
        return code.trim().to_string();
    }
    raw.trim().to_string()
}

/// Interior of the first fenced block, if any.
pub fn fenced_block(raw: &str) -> Option<&str> {
    fenced_block_re()
        .captures(raw)
        .or_else(|| inline_fence_re().captures(raw))
        .and_then(|caps| caps.name("code"))
        .map(|m| m.as_str())
}

/// Best-effort JSON object extraction: fenced block first, then the outermost
/// `{ ... }` span.
pub fn extract_json_object(raw: &str) -> Option<String> {
    let candidate = extract_code(raw);
    if candidate.starts_with('{') && candidate.ends_with('}') {
        return Some(candidate);
    }
    let first = candidate.find('{')?;
    let last = candidate.rfind('}')?;
    if first < last {
        Some(candidate[first..=last].to_string())
    } else {
        None
    }
}

/// Cheap syntactic repair for almost-JSON: drops trailing commas before a
/// closer and appends any missing `}` / `]`.
pub fn sanitize_json(candidate: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    let re = TRAILING_COMMA
        .get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid trailing comma regex"));
    let text = re.replace_all(candidate.trim(), "$1").into_owned();

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() {
        return text;
    }
    let mut repaired = text;
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    // Closing may expose a new trailing comma.
    re.replace_all(&repaired, "$1").into_owned()
}

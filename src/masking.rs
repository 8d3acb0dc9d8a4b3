use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static RE_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?").unwrap()
});

static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b").unwrap()
});

static RE_IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b").unwrap()
});

static RE_HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:0x)?[0-9a-fA-F]{12,}\b").unwrap());

static RE_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\b\d+(?:\.\d+)?\b").unwrap());

/// Words that introduce a status code; the code right after one is kept.
static RE_STATUS_CUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:status|code|http|error|err|returned|response)(?:\s+code)?[\s:=(#]*$").unwrap()
});

static RE_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+").unwrap());

static RE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Replace volatile tokens (timestamps, ids, addresses, numbers) with
/// placeholders so two mentions of the same event compare equal. Status
/// codes (`code 504`, `HTTP 503`, `status=404`) stay, since they tell
/// failures apart.
pub fn mask_text(input: &str) -> String {
    let s = RE_TIMESTAMP.replace_all(input, "<TS>");
    let s = RE_UUID.replace_all(&s, "<UUID>");
    let s = RE_IPV4.replace_all(&s, "<IP>");
    let s = RE_HEX.replace_all(&s, "<HEX>");
    let masked = RE_NUM.replace_all(&s, |caps: &Captures| {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let number = &caps[0];
        if is_status_code(number) && RE_STATUS_CUE.is_match(tail(&s[..start], 32)) {
            number.to_string()
        } else {
            "<NUM>".to_string()
        }
    });
    masked.into_owned()
}

fn is_status_code(n: &str) -> bool {
    n.len() == 3 && n.bytes().all(|b| b.is_ascii_digit()) && (b'1'..=b'5').contains(&n.as_bytes()[0])
}

/// Last `chars` characters of `s`.
fn tail(s: &str, chars: usize) -> &str {
    let from = s.char_indices().rev().nth(chars.saturating_sub(1)).map(|(i, _)| i).unwrap_or(0);
    &s[from..]
}

/// Case-folded text with bullets, surrounding punctuation and repeated
/// whitespace removed. Used to dedupe causes and suggestions.
pub fn normalize_text(input: &str) -> String {
    let s = RE_BULLET.replace(input, "");
    let s = RE_SPACE.replace_all(s.trim(), " ");
    s.trim_matches(|c: char| c.is_ascii_punctuation() && c != '<' && c != '>')
        .trim()
        .to_lowercase()
}

/// Signature of an anomaly message: normalized, then masked.
pub fn message_signature(message: &str) -> String {
    normalize_text(&mask_text(message))
}

//! The seam to the external reasoning service, plus everything needed to turn
//! its free-form answers into one deduplicated report.

use crate::masking::{message_signature, normalize_text};
use crate::timestamp::{detect_timestamp_in_text, nearest_bucket, timestamp_from_value};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Every variant is retried the same way.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("empty response")]
    Empty,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// What a map call knows about its chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContext {
    pub schema_id: String,
    pub index: usize,
    pub total: usize,
    /// Record range of the chunk within the extraction result.
    pub start: usize,
    pub end: usize,
}

/// Input of the reduce call. A single-pass run carries the whole rendered
/// result in `full_text` and no partials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub schema_id: String,
    pub total_chunks: usize,
    pub partials: Vec<PartialSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
}

impl SynthesisRequest {
    /// Partials joined the way a prompt would carry them; failed chunks are
    /// named so the synthesis can say what it did not see.
    pub fn stitched(&self) -> String {
        if let Some(text) = &self.full_text {
            return text.clone();
        }
        self.partials
            .iter()
            .map(|p| match p.status {
                ChunkStatus::Succeeded => format!("[chunk {}/{}]\n{}", p.chunk + 1, self.total_chunks, p.raw.trim()),
                ChunkStatus::Failed => format!(
                    "[chunk {}/{} unavailable: {}]",
                    p.chunk + 1,
                    self.total_chunks,
                    p.error.as_deref().unwrap_or("failed")
                ),
            })
            .join("\n\n---\n")
    }
}

/// The external reasoning service. Implementations own prompts, model
/// choice and transport; calls may block.
pub trait InsightService: Send + Sync {
    fn summarize(&self, text: &str, ctx: &ChunkContext) -> Result<String, ServiceError>;
    fn synthesize(&self, request: &SynthesisRequest) -> Result<String, ServiceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    pub text: String,
    /// Chunk that reported it; `None` for the synthesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    /// Chunks that reported it.
    #[serde(default)]
    pub chunks: Vec<usize>,
    pub occurrences: usize,
}

/// Structured reading of one service response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub summary: String,
    pub timeline: Vec<TimelineEntry>,
    pub anomalies: Vec<Anomaly>,
    pub causes: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSummary {
    pub chunk: usize,
    pub start: usize,
    pub end: usize,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub raw: String,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartialSummary {
    pub fn succeeded(ctx: &ChunkContext, attempts: u32, raw: String, digest: Digest) -> Self {
        Self { chunk: ctx.index, start: ctx.start, end: ctx.end, status: ChunkStatus::Succeeded, attempts, raw, digest, error: None }
    }

    /// Placeholder for a chunk whose retries ran out.
    pub fn failed(ctx: &ChunkContext, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            chunk: ctx.index,
            start: ctx.start,
            end: ctx.end,
            status: ChunkStatus::Failed,
            attempts,
            raw: String::new(),
            digest: Digest::default(),
            error: Some(reason.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ChunkStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk: usize,
    pub start: usize,
    pub end: usize,
    pub status: ChunkStatus,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightReport {
    pub schema_id: String,
    pub summary: String,
    pub chunk_summaries: Vec<ChunkSummary>,
    pub timeline: Vec<TimelineEntry>,
    pub anomalies: Vec<Anomaly>,
    pub root_causes: Vec<String>,
    pub suggestions: Vec<String>,
    pub complete: bool,
    pub failed_chunks: Vec<usize>,
}

impl InsightReport {
    /// Report for an extraction with no records.
    pub fn empty(schema_id: &str) -> Self {
        Self {
            schema_id: schema_id.to_string(),
            summary: String::new(),
            chunk_summaries: Vec::new(),
            timeline: Vec::new(),
            anomalies: Vec::new(),
            root_causes: Vec::new(),
            suggestions: Vec::new(),
            complete: true,
            failed_chunks: Vec::new(),
        }
    }

    /// Merge the synthesis with every partial. Anomalies collapse on
    /// (masked message, nearest `bucket_secs` bucket); the timeline is sorted
    /// by time with undated entries last.
    pub fn assemble(schema_id: &str, synthesis: &Digest, partials: &[PartialSummary], bucket_secs: i64) -> Self {
        let chunk_summaries = partials
            .iter()
            .map(|p| ChunkSummary {
                chunk: p.chunk,
                start: p.start,
                end: p.end,
                status: p.status,
                summary: match p.status {
                    ChunkStatus::Succeeded => p.digest.summary.clone(),
                    ChunkStatus::Failed => String::new(),
                },
            })
            .collect();

        let sources = || {
            std::iter::once((None, synthesis))
                .chain(partials.iter().filter(|p| !p.is_failed()).map(|p| (Some(p.chunk), &p.digest)))
        };

        let mut timeline: Vec<TimelineEntry> = sources()
            .flat_map(|(chunk, d)| d.timeline.iter().map(move |e| TimelineEntry { chunk, ..e.clone() }))
            .unique_by(|e| (e.at, normalize_text(&e.text)))
            .collect();
        timeline.sort_by_key(|e| (e.at.is_none(), e.at));

        let mut anomalies: Vec<Anomaly> = Vec::new();
        let mut seen: AHashMap<(String, Option<i64>), usize> = AHashMap::new();
        for (chunk, d) in sources() {
            for a in &d.anomalies {
                let key = (message_signature(&a.message), a.at.map(|t| nearest_bucket(&t, bucket_secs)));
                match seen.get(&key) {
                    Some(&idx) => {
                        let merged = &mut anomalies[idx];
                        merged.occurrences += a.occurrences.max(1);
                        merged.chunks.extend(chunk);
                        merged.at = merged.at.or(a.at);
                    }
                    None => {
                        seen.insert(key, anomalies.len());
                        anomalies.push(Anomaly {
                            message: a.message.clone(),
                            at: a.at,
                            chunks: chunk.into_iter().collect(),
                            occurrences: a.occurrences.max(1),
                        });
                    }
                }
            }
        }
        for a in &mut anomalies {
            a.chunks.sort_unstable();
            a.chunks.dedup();
        }

        let root_causes = dedup_text(sources().flat_map(|(_, d)| d.causes.iter()));
        let suggestions = dedup_text(sources().flat_map(|(_, d)| d.suggestions.iter()));
        let failed_chunks: Vec<usize> = partials.iter().filter(|p| p.is_failed()).map(|p| p.chunk).collect();

        Self {
            schema_id: schema_id.to_string(),
            summary: synthesis.summary.clone(),
            chunk_summaries,
            timeline,
            anomalies,
            root_causes,
            suggestions,
            complete: failed_chunks.is_empty(),
            failed_chunks,
        }
    }
}

fn dedup_text<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    items.filter(|s| !s.trim().is_empty()).unique_by(|s| normalize_text(s)).cloned().collect()
}

// ---------------------------------------------------------------------------
// Response parsing

static RE_FENCED_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());
static RE_ORDERED_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]\s+").unwrap());

/// Read a service answer as JSON (bare, fenced or embedded in prose) or as
/// the markdown heading layout. Empty and unstructured answers are errors.
pub fn parse_response(text: &str) -> Result<Digest, ServiceError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::Empty);
    }
    if let Some(digest) = parse_json_digest(trimmed) {
        return Ok(digest);
    }
    parse_markdown_digest(trimmed)
}

fn parse_json_digest(text: &str) -> Option<Digest> {
    let mut candidates: Vec<&str> = RE_FENCED_JSON.captures_iter(text).filter_map(|c| c.get(1)).map(|m| m.as_str()).collect();
    if let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) {
        if open < close {
            candidates.push(&text[open..=close]);
        }
    }
    candidates.into_iter().find_map(|c| match serde_json::from_str::<Value>(c) {
        Ok(Value::Object(obj)) => digest_from_object(&obj),
        _ => None,
    })
}

fn key_norm(k: &str) -> String {
    k.trim().to_lowercase().replace([' ', '-'], "_")
}

fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    obj.iter().find(|(k, _)| keys.contains(&key_norm(k).as_str())).map(|(_, v)| v)
}

fn text_list(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => s.lines().map(clean_item).filter(|s| !s.is_empty()).collect(),
        Value::Array(items) => items.iter().flat_map(text_list).collect(),
        Value::Object(obj) => {
            let text = pick(obj, &["text", "description", "message", "summary", "event", "cause", "suggestion"])
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string());
            vec![text]
        }
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

const TIME_KEYS: [&str; 5] = ["at", "time", "timestamp", "ts", "when"];

fn timed_items(v: &Value) -> Vec<(Option<DateTime<Utc>>, String)> {
    match v {
        Value::Array(items) => items.iter().flat_map(timed_items).collect(),
        Value::Object(obj) => {
            let at = pick(obj, &TIME_KEYS).and_then(timestamp_from_value);
            text_list(v).into_iter().map(|t| (at.or_else(|| detect_timestamp_in_text(&t)), t)).collect()
        }
        other => text_list(other).into_iter().map(|t| (detect_timestamp_in_text(&t), t)).collect(),
    }
}

fn digest_from_object(obj: &Map<String, Value>) -> Option<Digest> {
    let summary = pick(obj, &["summary", "technical_summary", "overview"]);
    let timeline = pick(obj, &["timeline", "key_events", "events"]);
    let anomalies = pick(obj, &["anomalies", "notable_anomalies"]);
    let causes = pick(obj, &["root_cause", "root_causes", "causes", "possible_causes"]);
    let suggestions = pick(obj, &["suggestions", "recommendations", "actions"]);
    if [summary, timeline, anomalies, causes, suggestions].iter().all(Option::is_none) {
        return None;
    }
    Some(Digest {
        summary: summary.map(|v| text_list(v).join("\n")).unwrap_or_default(),
        timeline: timeline
            .map(timed_items)
            .unwrap_or_default()
            .into_iter()
            .map(|(at, text)| TimelineEntry { at, text, chunk: None })
            .collect(),
        anomalies: anomalies
            .map(timed_items)
            .unwrap_or_default()
            .into_iter()
            .map(|(at, message)| Anomaly { message, at, chunks: Vec::new(), occurrences: 1 })
            .collect(),
        causes: causes.map(text_list).unwrap_or_default(),
        suggestions: suggestions.map(text_list).unwrap_or_default(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Summary,
    Timeline,
    Anomalies,
    Causes,
    Suggestions,
    Other,
}

fn section_of(label: &str) -> Option<Section> {
    let l = label.trim().trim_matches(|c: char| c == '#' || c == '*' || c == ':' || c.is_whitespace()).to_lowercase();
    if l.is_empty() || l.len() > 48 {
        return None;
    }
    let s = if l.contains("suggest") || l.contains("recommend") {
        Section::Suggestions
    } else if l.contains("anomal") {
        Section::Anomalies
    } else if l.contains("cause") {
        Section::Causes
    } else if l.contains("timeline") || l.contains("key events") {
        Section::Timeline
    } else if l.contains("summary") || l.contains("overview") {
        Section::Summary
    } else if l.contains("carry forward") || l.contains("metrics") {
        Section::Other
    } else {
        return None;
    };
    Some(s)
}

fn clean_item(line: &str) -> String {
    let t = line.trim();
    let t = t.strip_prefix("- ").or_else(|| t.strip_prefix("* ")).or_else(|| t.strip_prefix("• ")).unwrap_or(t);
    RE_ORDERED_BULLET.replace(t, "").trim().to_string()
}

fn parse_markdown_digest(text: &str) -> Result<Digest, ServiceError> {
    let mut digest = Digest::default();
    let mut summary_lines: Vec<String> = Vec::new();
    let mut current: Option<Section> = None;
    let mut recognized = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed == "---" {
            continue;
        }
        if trimmed.starts_with('#') {
            current = section_of(trimmed);
            recognized |= current.is_some();
            continue;
        }
        let item = clean_item(trimmed);
        // `- Key events:` / `Root Cause: ...` / `**Timeline**`
        if let Some((label, rest)) = item.split_once(':') {
            if let Some(s) = section_of(label) {
                current = Some(s);
                recognized = true;
                let rest = rest.trim();
                if rest.is_empty() {
                    continue;
                }
                push_item(&mut digest, &mut summary_lines, s, rest);
                continue;
            }
        }
        if item.starts_with("**") && item.ends_with("**") {
            if let Some(s) = section_of(&item) {
                current = Some(s);
                recognized = true;
                continue;
            }
        }
        if let Some(s) = current {
            push_item(&mut digest, &mut summary_lines, s, &item);
        }
    }

    if !recognized {
        return Err(ServiceError::Malformed("no recognizable sections".to_string()));
    }
    digest.summary = summary_lines.join("\n");
    Ok(digest)
}

fn push_item(digest: &mut Digest, summary: &mut Vec<String>, section: Section, item: &str) {
    if item.is_empty() {
        return;
    }
    let at = detect_timestamp_in_text(item);
    match section {
        Section::Summary => summary.push(item.to_string()),
        Section::Timeline => digest.timeline.push(TimelineEntry { at, text: item.to_string(), chunk: None }),
        Section::Anomalies => {
            digest.anomalies.push(Anomaly { message: item.to_string(), at, chunks: Vec::new(), occurrences: 1 })
        }
        Section::Causes => digest.causes.push(item.to_string()),
        Section::Suggestions => digest.suggestions.push(item.to_string()),
        Section::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_markdown_layout() {
        let text = "# Technical Summary\n- Checkout latency spiked\n\n## Timeline\n- 2024-01-15T14:20:00Z gateway timeout\n- retries exhausted\n\n## Anomalies\n- 504 from payments\n\n## Root Cause (if any)\n- pool exhaustion\n\n## Suggestions\n1. raise pool size\n";
        let d = parse_response(text).unwrap();
        assert_eq!(d.summary, "Checkout latency spiked");
        assert_eq!(d.timeline.len(), 2);
        assert!(d.timeline[0].at.is_some());
        assert!(d.timeline[1].at.is_none());
        assert_eq!(d.anomalies[0].message, "504 from payments");
        assert_eq!(d.causes, vec!["pool exhaustion"]);
        assert_eq!(d.suggestions, vec!["raise pool size"]);
    }

    #[test]
    fn parses_chunk_digest_labels() {
        let text = "- Key events:\n  - login burst\n- Notable anomalies: slow db\n- Possible causes:\n  - lock contention\n- Metrics/IDs/fields to carry forward:\n  - req-42\n";
        let d = parse_response(text).unwrap();
        assert_eq!(d.timeline[0].text, "login burst");
        assert_eq!(d.anomalies[0].message, "slow db");
        assert_eq!(d.causes, vec!["lock contention"]);
        assert!(d.suggestions.is_empty());
    }

    #[test]
    fn parses_json_fenced_or_embedded() {
        let fenced = "Here you go:\n```json\n{\"summary\": \"ok\", \"anomalies\": [{\"message\": \"disk full\", \"timestamp\": \"2024-01-15T14:20:00Z\"}]}\n```";
        let d = parse_response(fenced).unwrap();
        assert_eq!(d.summary, "ok");
        assert!(d.anomalies[0].at.is_some());

        let embedded = "Result {\"Root Cause\": \"bad deploy\", \"suggestions\": [\"roll back\"]} end";
        let d = parse_response(embedded).unwrap();
        assert_eq!(d.causes, vec!["bad deploy"]);
        assert_eq!(d.suggestions, vec!["roll back"]);
    }

    #[test]
    fn rejects_empty_and_unstructured() {
        assert_eq!(parse_response("   \n"), Err(ServiceError::Empty));
        assert!(matches!(parse_response("I could not read the logs."), Err(ServiceError::Malformed(_))));
    }
}

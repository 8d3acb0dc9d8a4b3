//! Splits an extraction result into record-aligned chunks that each fit a
//! character budget, so every chunk can go to the insight service on its own.

use crate::error::ErrorKind;
use crate::events::{Event, EventSink};
use crate::extract::{ExtractedRecord, ExtractionResult, FieldValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Characters per token assumed when converting a context window.
pub const CHARS_PER_TOKEN: usize = 4;
/// Tokens held back for instructions and the response.
pub const RESERVED_TOKENS: usize = 1200;
const MIN_USABLE_TOKENS: usize = 512;
const MIN_CHUNK_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    max_chars: usize,
}

impl Budget {
    pub fn chars(n: usize) -> Self {
        Self { max_chars: n.max(1) }
    }

    /// Budget for a model with a `context_tokens` window: what is left after
    /// the reserve (never under 512 tokens), filled to 80%, at least 4000 chars.
    pub fn from_context_tokens(context_tokens: usize) -> Self {
        let usable = context_tokens.saturating_sub(RESERVED_TOKENS).max(MIN_USABLE_TOKENS) * CHARS_PER_TOKEN;
        let chunk = usable * 4 / 5;
        Self { max_chars: chunk.max(MIN_CHUNK_CHARS) }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }
}

/// Records `start..end` of the extraction result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    /// Rendered size, newlines included.
    pub chars: usize,
    /// A single record larger than the budget.
    pub oversized: bool,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The text sent to the insight service for this chunk.
    pub fn render(&self, result: &ExtractionResult) -> String {
        let mut out = String::with_capacity(self.chars);
        for rec in &result.records[self.start..self.end] {
            out.push_str(&render_record(rec, &result.columns));
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub budget_chars: usize,
    pub chunks: Vec<Chunk>,
}

impl ChunkPlan {
    pub fn oversized(&self) -> usize {
        self.chunks.iter().filter(|c| c.oversized).count()
    }

    /// Everything fits in one request within budget. A lone oversized
    /// chunk still goes through the map phase.
    pub fn is_single_pass(&self) -> bool {
        match self.chunks.as_slice() {
            [] => true,
            [only] => !only.oversized,
            _ => false,
        }
    }

    pub fn total_chars(&self) -> usize {
        self.chunks.iter().map(|c| c.chars).sum()
    }
}

/// One compact JSON line: present fields in column order, then `_source`.
pub fn render_record(rec: &ExtractedRecord, columns: &[String]) -> String {
    let mut obj = Map::new();
    for col in columns {
        if let Some(FieldValue::Present(v)) = rec.fields.get(col) {
            obj.insert(col.clone(), v.clone());
        }
    }
    let mut source = format!("{}:{}", rec.source.file.display(), rec.source.line);
    if let Some(el) = rec.source.element {
        source.push_str(&format!("#{el}"));
    }
    obj.insert("_source".to_string(), Value::String(source));
    Value::Object(obj).to_string()
}

#[derive(Clone, Default)]
pub struct ChunkPlanner {
    events: Option<Arc<dyn EventSink>>,
}

impl ChunkPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Greedy, in record order: a record that would overflow the open chunk
    /// closes it. The plan depends only on the result and the budget.
    pub fn plan(&self, result: &ExtractionResult, budget: Budget) -> ChunkPlan {
        let max = budget.max_chars();
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut start = 0usize;
        let mut chars = 0usize;

        let close = |chunks: &mut Vec<Chunk>, start: usize, end: usize, chars: usize, oversized: bool| {
            chunks.push(Chunk { index: chunks.len(), start, end, chars, oversized });
        };

        for (i, rec) in result.records.iter().enumerate() {
            let size = render_record(rec, &result.columns).chars().count() + 1;
            if size > max {
                if i > start {
                    close(&mut chunks, start, i, chars, false);
                }
                tracing::warn!(record = i, size, budget = max, kind = %ErrorKind::ChunkOversized, "record exceeds chunk budget on its own");
                close(&mut chunks, i, i + 1, size, true);
                start = i + 1;
                chars = 0;
                continue;
            }
            if i > start && chars + size > max {
                close(&mut chunks, start, i, chars, false);
                start = i;
                chars = 0;
            }
            chars += size;
        }
        if result.records.len() > start {
            close(&mut chunks, start, result.records.len(), chars, false);
        }

        let plan = ChunkPlan { budget_chars: max, chunks };
        tracing::info!(chunks = plan.chunks.len(), oversized = plan.oversized(), budget = max, "chunks planned");
        if let Some(sink) = &self.events {
            sink.emit(Event::ChunksPlanned { chunks: plan.chunks.len(), oversized: plan.oversized(), budget_chars: max });
        }
        plan
    }
}

use crate::error::ErrorKind;
use crate::extract::ExtractionStats;
use crate::pipeline::RunState;
use parking_lot::Mutex;
use serde::Serialize;

/// Discrete progress records handed to the presentation layer. A caller
/// renders these as they arrive instead of polling engine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SchemaRegistered { id: String, version: u32, fields: usize, updated: bool },
    ExtractionProgress { scanned: usize, included: usize },
    ExtractionFinished { stats: ExtractionStats },
    ChunksPlanned { chunks: usize, oversized: usize, budget_chars: usize },
    StateChanged { from: RunState, to: RunState },
    ChunkSucceeded { chunk: usize, attempts: u32 },
    ChunkFailed { chunk: usize, attempts: u32, reason: String },
    ReportReady { complete: bool, failed_chunks: Vec<usize> },
    RunFailed { kind: ErrorKind, detail: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn states(&self) -> Vec<RunState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Forwards events to `tracing` at info level (warn for failures).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::ChunkFailed { chunk, attempts, reason } => {
                tracing::warn!(chunk, attempts, %reason, "chunk failed")
            }
            Event::RunFailed { kind, detail } => tracing::warn!(%kind, %detail, "run failed"),
            other => match serde_json::to_string(other) {
                Ok(line) => tracing::info!(target: "logdistill::events", "{line}"),
                Err(_) => tracing::info!(target: "logdistill::events", "{other:?}"),
            },
        }
    }
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn emit(&self, event: Event) {
        (**self).emit(event)
    }
}

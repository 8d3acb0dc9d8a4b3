//! Map-reduce over an [`InsightService`]: summarize chunks on a bounded pool,
//! then synthesize one report from every partial.

use crate::chunk::{Budget, Chunk, ChunkPlan, ChunkPlanner};
use crate::config::PipelineConfig;
use crate::error::ErrorKind;
use crate::events::{Event, EventSink, NullSink};
use crate::extract::ExtractionResult;
use crate::insight::{
    parse_response, ChunkContext, ChunkStatus, ChunkSummary, Digest, InsightReport, InsightService, PartialSummary,
    ServiceError, SynthesisRequest,
};
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planning,
    Mapping,
    Reducing,
    Done,
    PartiallyFailed,
    /// Synthesis could not be obtained; no report.
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::PartiallyFailed | RunState::Failed | RunState::Cancelled)
    }

    pub fn can_transition(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (_, Cancelled) => !self.is_terminal(),
            (Planning, Mapping) | (Planning, Reducing) | (Planning, Done) => true,
            (Mapping, Reducing) | (Mapping, Failed) => true,
            (Reducing, Done) | (Reducing, PartiallyFailed) | (Reducing, Failed) => true,
            _ => false,
        }
    }
}

/// Cooperative cancellation shared between a caller and a running pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("synthesis unavailable after {attempts} attempt(s): {reason}")]
    SynthesisUnavailable { attempts: u32, reason: String, failed_chunks: Vec<usize> },
    #[error("run cancelled")]
    Cancelled,
    #[error("cannot start worker pool: {0}")]
    Pool(String),
}

impl PipelineError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::SynthesisUnavailable { .. } => Some(ErrorKind::SynthesisUnavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub state: RunState,
    pub report: InsightReport,
    pub plan: ChunkPlan,
    pub partials: Vec<PartialSummary>,
}

struct Run<'a> {
    state: RunState,
    events: &'a dyn EventSink,
}

impl Run<'_> {
    fn advance(&mut self, to: RunState) {
        debug_assert!(self.state.can_transition(to), "illegal transition {:?} -> {:?}", self.state, to);
        tracing::info!(from = ?self.state, to = ?to, "pipeline state");
        self.events.emit(Event::StateChanged { from: self.state, to });
        self.state = to;
    }

    fn cancel(&mut self) -> PipelineError {
        self.advance(RunState::Cancelled);
        PipelineError::Cancelled
    }
}

/// Counting semaphore bounding requests in flight against the service.
/// A permit is held by the call thread, so a call abandoned after its
/// timeout keeps its slot until the service actually returns.
#[derive(Debug)]
struct Permits {
    free: Mutex<usize>,
    released: Condvar,
}

impl Permits {
    fn new(n: usize) -> Arc<Self> {
        Arc::new(Self { free: Mutex::new(n.max(1)), released: Condvar::new() })
    }

    /// Wait for a free slot; `None` once the run is cancelled.
    fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Option<Permit> {
        let mut free = self.free.lock();
        while *free == 0 {
            if cancel.is_cancelled() {
                return None;
            }
            self.released.wait_for(&mut free, Duration::from_millis(25));
        }
        *free -= 1;
        Some(Permit(Arc::clone(self)))
    }
}

struct Permit(Arc<Permits>);

impl Drop for Permit {
    fn drop(&mut self) {
        *self.0.free.lock() += 1;
        self.0.released.notify_one();
    }
}

pub struct InsightPipeline {
    service: Arc<dyn InsightService>,
    config: PipelineConfig,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    permits: Arc<Permits>,
}

impl InsightPipeline {
    pub fn new(service: Arc<dyn InsightService>, config: PipelineConfig) -> Self {
        let permits = Permits::new(config.max_in_flight);
        Self { service, config, events: Arc::new(NullSink), cancel: CancellationToken::new(), permits }
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run(&self, result: &ExtractionResult, budget: Budget) -> Result<PipelineOutcome, PipelineError> {
        let mut run = Run { state: RunState::Planning, events: self.events.as_ref() };
        let started = Instant::now();
        if self.cancel.is_cancelled() {
            return Err(run.cancel());
        }

        let plan = ChunkPlanner::new().with_events(self.events.clone()).plan(result, budget);
        if plan.chunks.is_empty() {
            run.advance(RunState::Done);
            let report = InsightReport::empty(&result.schema_id);
            self.events.emit(Event::ReportReady { complete: true, failed_chunks: Vec::new() });
            return Ok(PipelineOutcome { state: run.state, report, plan, partials: Vec::new() });
        }

        if plan.is_single_pass() {
            run.advance(RunState::Reducing);
            let request = SynthesisRequest {
                schema_id: result.schema_id.clone(),
                total_chunks: 1,
                partials: Vec::new(),
                full_text: Some(plan.chunks[0].render(result)),
            };
            let digest = self.reduce(&mut run, request, Vec::new())?;
            let mut report = InsightReport::assemble(&result.schema_id, &digest, &[], self.config.anomaly_bucket_secs);
            let only = &plan.chunks[0];
            report.chunk_summaries.push(ChunkSummary {
                chunk: 0,
                start: only.start,
                end: only.end,
                status: ChunkStatus::Succeeded,
                summary: digest.summary.clone(),
            });
            return Ok(self.finish(run, report, plan, Vec::new(), started));
        }

        run.advance(RunState::Mapping);
        let partials = self.map(result, &plan)?;
        if self.cancel.is_cancelled() {
            return Err(run.cancel());
        }
        let failed_chunks: Vec<usize> = partials.iter().filter(|p| p.is_failed()).map(|p| p.chunk).collect();
        if failed_chunks.len() == partials.len() {
            run.advance(RunState::Failed);
            let reason = "every chunk failed; nothing to synthesize".to_string();
            self.events.emit(Event::RunFailed { kind: ErrorKind::SynthesisUnavailable, detail: reason.clone() });
            return Err(PipelineError::SynthesisUnavailable { attempts: 0, reason, failed_chunks });
        }

        run.advance(RunState::Reducing);
        let request = SynthesisRequest {
            schema_id: result.schema_id.clone(),
            total_chunks: plan.chunks.len(),
            partials: partials.clone(),
            full_text: None,
        };
        let digest = self.reduce(&mut run, request, failed_chunks)?;
        let report = InsightReport::assemble(&result.schema_id, &digest, &partials, self.config.anomaly_bucket_secs);
        Ok(self.finish(run, report, plan, partials, started))
    }

    fn finish(
        &self,
        mut run: Run<'_>,
        report: InsightReport,
        plan: ChunkPlan,
        partials: Vec<PartialSummary>,
        started: Instant,
    ) -> PipelineOutcome {
        let to = if report.complete { RunState::Done } else { RunState::PartiallyFailed };
        run.advance(to);
        tracing::info!(
            chunks = plan.chunks.len(),
            failed = report.failed_chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "insight report ready"
        );
        self.events.emit(Event::ReportReady { complete: report.complete, failed_chunks: report.failed_chunks.clone() });
        PipelineOutcome { state: run.state, report, plan, partials }
    }

    /// One summarize call per chunk, at most `max_in_flight` at a time.
    /// Results come back in chunk order.
    fn map(&self, result: &ExtractionResult, plan: &ChunkPlan) -> Result<Vec<PartialSummary>, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_in_flight.max(1))
            .thread_name(|i| format!("logdistill-map-{i}"))
            .build()
            .map_err(|e| PipelineError::Pool(e.to_string()))?;
        let total = plan.chunks.len();
        Ok(pool.install(|| plan.chunks.par_iter().map(|c| self.map_chunk(result, c, total)).collect()))
    }

    fn map_chunk(&self, result: &ExtractionResult, chunk: &Chunk, total: usize) -> PartialSummary {
        let ctx = ChunkContext {
            schema_id: result.schema_id.clone(),
            index: chunk.index,
            total,
            start: chunk.start,
            end: chunk.end,
        };
        if self.cancel.is_cancelled() {
            return PartialSummary::failed(&ctx, 0, "cancelled");
        }
        let text = Arc::new(chunk.render(result));
        let outcome = self.with_retries(&format!("chunk {}", chunk.index), || {
            let text = Arc::clone(&text);
            let call_ctx = ctx.clone();
            self.call(move |svc| svc.summarize(&text, &call_ctx))
        });
        match outcome {
            Ok(((raw, digest), attempts)) => {
                self.events.emit(Event::ChunkSucceeded { chunk: chunk.index, attempts });
                PartialSummary::succeeded(&ctx, attempts, raw, digest)
            }
            Err((err, attempts)) => {
                let reason = err.to_string();
                tracing::warn!(chunk = chunk.index, attempts, kind = %ErrorKind::MapCallFailed, %reason, "map call gave up");
                self.events.emit(Event::ChunkFailed { chunk: chunk.index, attempts, reason: reason.clone() });
                PartialSummary::failed(&ctx, attempts, reason)
            }
        }
    }

    fn reduce(
        &self,
        run: &mut Run<'_>,
        request: SynthesisRequest,
        failed_chunks: Vec<usize>,
    ) -> Result<Digest, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(run.cancel());
        }
        let request = Arc::new(request);
        let outcome = self.with_retries("synthesis", || {
            let request = Arc::clone(&request);
            self.call(move |svc| svc.synthesize(&request))
        });
        if self.cancel.is_cancelled() {
            return Err(run.cancel());
        }
        match outcome {
            Ok(((_, digest), _)) => Ok(digest),
            Err((err, attempts)) => {
                run.advance(RunState::Failed);
                let reason = err.to_string();
                self.events.emit(Event::RunFailed { kind: ErrorKind::SynthesisUnavailable, detail: reason.clone() });
                Err(PipelineError::SynthesisUnavailable { attempts, reason, failed_chunks })
            }
        }
    }

    /// Call and parse, retrying every failure with backoff. Stops early when
    /// the run is cancelled. Returns the attempt count either way.
    fn with_retries<F>(&self, what: &str, mut attempt: F) -> Result<((String, Digest), u32), (ServiceError, u32)>
    where
        F: FnMut() -> Result<String, ServiceError>,
    {
        let policy = &self.config.retry;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match attempt().and_then(|raw| parse_response(&raw).map(|d| (raw, d))) {
                Ok(done) => return Ok((done, attempts)),
                Err(err) => err,
            };
            if attempts >= policy.max_attempts() || self.cancel.is_cancelled() {
                return Err((err, attempts));
            }
            let delay = policy.backoff(attempts);
            tracing::debug!(what, attempts, error = %err, delay_ms = delay.as_millis() as u64, "retrying service call");
            self.pause(delay);
            if self.cancel.is_cancelled() {
                return Err((err, attempts));
            }
        }
    }

    /// Run one service call on its own thread and wait at most the call
    /// timeout. A call that overruns is abandoned, not interrupted, and
    /// keeps its permit until it returns.
    fn call<F>(&self, f: F) -> Result<String, ServiceError>
    where
        F: FnOnce(&dyn InsightService) -> Result<String, ServiceError> + Send + 'static,
    {
        let Some(permit) = self.permits.acquire(&self.cancel) else {
            return Err(ServiceError::Transport("run cancelled".to_string()));
        };
        let timeout = self.config.call_timeout();
        let service = Arc::clone(&self.service);
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("logdistill-call".to_string())
            .spawn(move || {
                let _permit = permit;
                let _ = tx.send(f(service.as_ref()));
            })
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        match rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(ServiceError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ServiceError::Transport("service call panicked".to_string())),
        }
    }

    fn pause(&self, total: Duration) {
        let step = Duration::from_millis(25);
        let until = Instant::now() + total;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            std::thread::sleep(step.min(until - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use RunState::*;
        assert!(Planning.can_transition(Mapping));
        assert!(Planning.can_transition(Reducing));
        assert!(Mapping.can_transition(Reducing));
        assert!(Reducing.can_transition(PartiallyFailed));
        assert!(Mapping.can_transition(Cancelled));
        assert!(!Done.can_transition(Cancelled));
        assert!(!Mapping.can_transition(Done));
        assert!(!Reducing.can_transition(Mapping));
    }

    #[test]
    fn token_is_shared() {
        let t = CancellationToken::new();
        let u = t.clone();
        u.cancel();
        assert!(t.is_cancelled());
    }
}

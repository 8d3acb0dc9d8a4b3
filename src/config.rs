use crate::chunk::Budget;
use crate::normalize::NormalizationRules;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Every tunable of the core. Missing keys fall back to defaults, so a config
/// file only needs the values it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reader: ReaderConfig,
    pub normalization: NormalizationRules,
    pub inference: InferenceConfig,
    pub extraction: ExtractionConfig,
    pub chunking: ChunkConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_json_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Extensions (without dot, case-insensitive) picked up when walking a
    /// directory. A root that is itself a file is always read.
    pub include_extensions: Vec<String>,
    pub follow_links: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            include_extensions: ["json", "jsonl", "log", "txt"].iter().map(|s| s.to_string()).collect(),
            follow_links: false,
        }
    }
}

impl ReaderConfig {
    pub fn accepts(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.include_extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub sample_limit: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self { sample_limit: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Emit a progress event every N scanned records (0 disables).
    pub progress_every: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self { progress_every: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Explicit per-chunk character budget; wins over `context_tokens`.
    pub budget_chars: Option<usize>,
    pub context_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { budget_chars: None, context_tokens: 4096 }
    }
}

impl ChunkConfig {
    pub fn budget(&self) -> Budget {
        match self.budget_chars {
            Some(n) => Budget::chars(n),
            None => Budget::from_context_tokens(self.context_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub call_timeout_ms: u64,
    /// Width of the timestamp bucket used when deduplicating anomalies.
    pub anomaly_bucket_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: num_cpus::get().clamp(1, 4),
            retry: RetryPolicy::default(),
            call_timeout_ms: 120_000,
            anomaly_bucket_secs: 60,
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }
}

/// Exponential backoff between attempts of one remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, initial_backoff_ms: 500, max_backoff_ms: 8_000, multiplier: 2.0 }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_retries: u32) -> Self {
        Self { max_retries, initial_backoff_ms: 0, max_backoff_ms: 0, multiplier: 1.0 }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg = Config::from_json_str(r#"{"pipeline":{"max_in_flight":2},"chunking":{"budget_chars":900}}"#).unwrap();
        assert_eq!(cfg.pipeline.max_in_flight, 2);
        assert_eq!(cfg.pipeline.retry, RetryPolicy::default());
        assert_eq!(cfg.chunking.budget().max_chars(), 900);
        assert_eq!(cfg.inference.sample_limit, 1000);
        assert!(cfg.normalization.fold_case);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy { max_retries: 5, initial_backoff_ms: 100, max_backoff_ms: 350, multiplier: 2.0 };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.max_attempts(), 6);
    }

    #[test]
    fn reader_filters_by_extension() {
        let r = ReaderConfig::default();
        assert!(r.accepts(Path::new("a/b/app.JSON")));
        assert!(r.accepts(Path::new("x.log")));
        assert!(!r.accepts(Path::new("x.csv")));
        assert!(!r.accepts(Path::new("README")));
    }
}

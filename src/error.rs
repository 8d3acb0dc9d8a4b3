use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Failure taxonomy shared by every stage. Only `SchemaRegression` and
/// `SynthesisUnavailable` stop an operation; the rest are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseSkipped,
    UnsupportedFile,
    SchemaRegression,
    CoercionDemoted,
    ChunkOversized,
    MapCallFailed,
    SynthesisUnavailable,
}

impl ErrorKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::SchemaRegression | ErrorKind::SynthesisUnavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ParseSkipped => "parse_skipped",
            ErrorKind::UnsupportedFile => "unsupported_file",
            ErrorKind::SchemaRegression => "schema_regression",
            ErrorKind::CoercionDemoted => "coercion_demoted",
            ErrorKind::ChunkOversized => "chunk_oversized",
            ErrorKind::MapCallFailed => "map_call_failed",
            ErrorKind::SynthesisUnavailable => "synthesis_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recoverable problem tied to a place in the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: ErrorKind,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub detail: String,
}

impl Issue {
    pub fn at(kind: ErrorKind, file: impl Into<PathBuf>, line: Option<usize>, detail: impl Into<String>) -> Self {
        Issue { kind, file: Some(file.into()), line, field: None, detail: detail.into() }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Max issues kept per report; counters keep counting past it.
pub const MAX_ISSUE_SAMPLES: usize = 200;

pub(crate) fn push_sample(issues: &mut Vec<Issue>, issue: Issue) {
    if issues.len() < MAX_ISSUE_SAMPLES {
        issues.push(issue);
    }
}

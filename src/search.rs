//! Line search over the files of a log source: keyword or regex patterns,
//! combined as one pattern, all of them, or any of them.

use crate::reader::RecordSource;
use rayon::prelude::*;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Matching lines kept per file.
pub const MAX_PREVIEWS_PER_FILE: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("invalid pattern `{pattern}`: {detail}")]
    Pattern { pattern: String, detail: String },
    #[error("unknown match mode `{0}` (expected single, all or any)")]
    Mode(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The whole input is one pattern.
    #[default]
    Single,
    /// Comma-separated patterns; a line must match every one.
    All,
    /// Comma-separated patterns; a line must match at least one.
    Any,
}

impl FromStr for MatchMode {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(MatchMode::Single),
            "all" | "and" => Ok(MatchMode::All),
            "any" | "or" => Ok(MatchMode::Any),
            other => Err(SearchError::Mode(other.to_string())),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchMode::Single => "single",
            MatchMode::All => "all",
            MatchMode::Any => "any",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    patterns: Vec<Regex>,
    mode: MatchMode,
}

impl SearchQuery {
    /// Compile `input`. Keywords are matched literally unless `use_regex`;
    /// matching ignores case unless `case_sensitive`. A blank input gives a
    /// query that matches nothing.
    pub fn new(input: &str, mode: MatchMode, use_regex: bool, case_sensitive: bool) -> Result<Self, SearchError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self { patterns: Vec::new(), mode });
        }
        let mut parts: Vec<&str> = match mode {
            MatchMode::Single => vec![input],
            MatchMode::All | MatchMode::Any => input.split(',').map(str::trim).filter(|p| !p.is_empty()).collect(),
        };
        if parts.is_empty() {
            parts.push(input);
        }
        let patterns = parts
            .into_iter()
            .map(|p| {
                let source = if use_regex { p.to_string() } else { regex::escape(p) };
                RegexBuilder::new(&source)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|e| SearchError::Pattern { pattern: p.to_string(), detail: e.to_string() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, mode })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn is_match(&self, line: &str) -> bool {
        match self.mode {
            _ if self.patterns.is_empty() => false,
            MatchMode::Single => self.patterns[0].is_match(line),
            MatchMode::All => self.patterns.iter().all(|p| p.is_match(line)),
            MatchMode::Any => self.patterns.iter().any(|p| p.is_match(line)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    /// 1-based.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatch {
    pub file: PathBuf,
    pub matches: Vec<LineMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub matched: Vec<FileMatch>,
    pub not_matched: Vec<PathBuf>,
}

impl SearchResult {
    pub fn total_matches(&self) -> usize {
        self.matched.iter().map(|f| f.matches.len()).sum()
    }
}

/// Scan every file of `source`, in its sorted order. Files that cannot be
/// read land in `not_matched`.
pub fn search(source: &RecordSource, query: &SearchQuery) -> SearchResult {
    let mut result = SearchResult::default();
    if query.is_empty() {
        return result;
    }
    let scanned: Vec<(&PathBuf, Vec<LineMatch>)> =
        source.files().par_iter().map(|path| (path, scan_file(path, query))).collect();
    for (path, matches) in scanned {
        if matches.is_empty() {
            result.not_matched.push(path.clone());
        } else {
            result.matched.push(FileMatch { file: path.clone(), matches });
        }
    }
    tracing::debug!(
        mode = %query.mode(),
        matched = result.matched.len(),
        not_matched = result.not_matched.len(),
        "search finished"
    );
    result
}

fn scan_file(path: &Path, query: &SearchQuery) -> Vec<LineMatch> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(err) => {
            tracing::warn!(file = %path.display(), error = %err, "cannot search file");
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&bytes)
        .lines()
        .enumerate()
        .filter(|(_, line)| query.is_match(line))
        .take(MAX_PREVIEWS_PER_FILE)
        .map(|(idx, line)| LineMatch { line: idx + 1, text: line.to_string() })
        .collect()
}

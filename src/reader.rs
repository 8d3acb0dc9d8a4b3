use crate::config::ReaderConfig;
use crate::error::{push_sample, ErrorKind, Issue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("log source not found: {0}")]
    RootNotFound(PathBuf),
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Position of the file in the source's sorted file list.
    pub file_id: usize,
    pub file: PathBuf,
    /// 1-based line where the entry starts.
    pub line: usize,
    /// Index inside a top-level array, when the file holds one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub element: Option<usize>,
}

/// One parsed log entry. Field order is the order in the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: Map<String, Value>,
    pub source: Provenance,
}

impl RawRecord {
    /// Build a record that did not come from a file (tests, embedding callers).
    pub fn from_value(value: Value, line: usize) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(RawRecord {
                fields,
                source: Provenance { file_id: 0, file: PathBuf::from("<memory>"), line, element: None },
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadReport {
    pub files_read: usize,
    pub records: usize,
    pub skipped: usize,
    pub unsupported_files: usize,
    pub issues: Vec<Issue>,
}

impl ReadReport {
    fn note(&mut self, issue: Issue) {
        match issue.kind {
            ErrorKind::ParseSkipped => self.skipped += 1,
            ErrorKind::UnsupportedFile => self.unsupported_files += 1,
            _ => {}
        }
        push_sample(&mut self.issues, issue);
    }
}

/// A file or directory of JSON logs. Files are listed once at open time in
/// lexicographic path order; `records()` can be called any number of times
/// and always starts over from the first file.
#[derive(Debug, Clone)]
pub struct RecordSource {
    root: PathBuf,
    files: Vec<PathBuf>,
    walk_issues: Vec<Issue>,
}

impl RecordSource {
    pub fn open(root: impl AsRef<Path>, config: &ReaderConfig) -> Result<Self, ReadError> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            return Err(ReadError::RootNotFound(root));
        }
        let mut files = Vec::new();
        let mut walk_issues = Vec::new();
        if root.is_file() {
            files.push(root.clone());
        } else {
            for entry in WalkDir::new(&root).follow_links(config.follow_links) {
                match entry {
                    Ok(e) if e.file_type().is_file() && config.accepts(e.path()) => files.push(e.into_path()),
                    Ok(_) => {}
                    Err(err) => {
                        let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                        walk_issues.push(Issue::at(ErrorKind::UnsupportedFile, path, None, err.to_string()));
                    }
                }
            }
            files.sort();
        }
        tracing::debug!(root = %root.display(), files = files.len(), "opened log source");
        Ok(Self { root, files, walk_issues })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn records(&self) -> Records<'_> {
        let mut report = ReadReport::default();
        for issue in &self.walk_issues {
            report.note(issue.clone());
        }
        Records { source: self, next_file: 0, pending: VecDeque::new(), report }
    }

    /// First `limit` records, for schema inference.
    pub fn sample(&self, limit: usize) -> Vec<RawRecord> {
        self.records().take(limit).collect()
    }
}

/// Lazy record iterator; one file is held in memory at a time.
pub struct Records<'a> {
    source: &'a RecordSource,
    next_file: usize,
    pending: VecDeque<RawRecord>,
    report: ReadReport,
}

impl Records<'_> {
    /// Counters and issues seen so far.
    pub fn report(&self) -> &ReadReport {
        &self.report
    }

    pub fn into_report(self) -> ReadReport {
        self.report
    }

    fn load_next_file(&mut self) {
        let file_id = self.next_file;
        self.next_file += 1;
        let path = &self.source.files[file_id];
        self.report.files_read += 1;
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "unreadable log file");
                self.report.note(Issue::at(ErrorKind::UnsupportedFile, path, None, err.to_string()));
                return;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let parsed = parse_document(text.trim_start_matches('\u{feff}'));
        if parsed.json_entries == 0 {
            let detail = if parsed.any_content { "no JSON content" } else { "empty file" };
            tracing::warn!(file = %path.display(), detail, "unsupported log file");
            self.report.note(Issue::at(ErrorKind::UnsupportedFile, path, None, detail));
            return;
        }
        for (line, detail) in parsed.skipped {
            self.report.note(Issue::at(ErrorKind::ParseSkipped, path, Some(line), detail));
        }
        for (line, element, fields) in parsed.records {
            let source = Provenance { file_id, file: path.clone(), line, element };
            self.pending.push_back(RawRecord { fields, source });
        }
    }
}

impl Iterator for Records<'_> {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        loop {
            if let Some(rec) = self.pending.pop_front() {
                self.report.records += 1;
                return Some(rec);
            }
            if self.next_file >= self.source.files.len() {
                return None;
            }
            self.load_next_file();
        }
    }
}

#[derive(Debug, Default)]
struct ParsedDocument {
    records: Vec<(usize, Option<usize>, Map<String, Value>)>,
    skipped: Vec<(usize, String)>,
    json_entries: usize,
    any_content: bool,
}

fn parse_document(text: &str) -> ParsedDocument {
    let mut doc = ParsedDocument::default();
    let mut agg = EntryAggregator::default();
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        agg.push(line, idx + 1, &mut entries);
    }
    if let Some(e) = agg.finish() {
        entries.push(e);
    }
    for entry in entries {
        doc.any_content = true;
        if !entry.json_like {
            doc.skipped.push((entry.start_line, "not a JSON entry".to_string()));
            continue;
        }
        doc.json_entries += 1;
        match serde_json::from_str::<Value>(&entry.text) {
            Ok(Value::Object(map)) => doc.records.push((entry.start_line, None, map)),
            Ok(Value::Array(items)) => {
                for (i, item) in items.into_iter().enumerate() {
                    match item {
                        Value::Object(map) => doc.records.push((entry.start_line, Some(i), map)),
                        _ => doc.skipped.push((entry.start_line, format!("array element {i} is not an object"))),
                    }
                }
            }
            Ok(_) => doc.skipped.push((entry.start_line, "top-level value is not an object".to_string())),
            Err(err) => doc.skipped.push((entry.start_line, err.to_string())),
        }
    }
    doc
}

#[derive(Debug)]
struct Entry {
    start_line: usize,
    text: String,
    json_like: bool,
}

/// Groups physical lines into JSON entries by bracket balance, so a
/// pretty-printed object spanning many lines is one entry and JSON-lines
/// files yield one entry per line. Brackets inside string literals are ignored.
#[derive(Default)]
struct EntryAggregator {
    buf: String,
    start_line: usize,
    /// Brackets still open, innermost last.
    open: Vec<char>,
    /// The open entry stops where a new object or array may follow: after
    /// `:`, after `[`, or after `,` inside an array.
    awaits_value: bool,
}

fn is_json_start(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('{') || t.starts_with('[')
}

impl EntryAggregator {
    fn push(&mut self, line: &str, line_no: usize, out: &mut Vec<Entry>) {
        if !self.buf.is_empty() {
            // A bracket in column 0 that cannot continue the open entry means
            // that entry never closed; release it as-is and start a new one.
            let restarts = (line.starts_with('{') || line.starts_with('[')) && !self.awaits_value;
            if restarts {
                out.push(self.take());
            } else {
                self.buf.push('\n');
                self.buf.push_str(line);
                self.scan(line);
                if self.open.is_empty() {
                    out.push(self.take());
                }
                return;
            }
        }
        if line.trim().is_empty() {
            return;
        }
        if !is_json_start(line) {
            out.push(Entry { start_line: line_no, text: line.to_string(), json_like: false });
            return;
        }
        self.buf.push_str(line);
        self.start_line = line_no;
        self.open.clear();
        self.scan(line);
        if self.open.is_empty() {
            out.push(self.take());
        }
    }

    // Strings never span lines in JSON, so string state is per line. A line
    // that ends inside a string was cut short.
    fn scan(&mut self, line: &str) {
        let mut in_string = false;
        let mut escaped = false;
        let mut last = None;
        for ch in line.chars() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    in_string = false;
                    last = Some(ch);
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' | '[' => self.open.push(ch),
                '}' | ']' => {
                    self.open.pop();
                }
                _ => {}
            }
            if !ch.is_whitespace() {
                last = Some(ch);
            }
        }
        if in_string {
            self.awaits_value = false;
        } else if last.is_some() {
            self.awaits_value = match last {
                Some(':') | Some('[') => true,
                Some(',') => self.open.last() == Some(&'['),
                _ => false,
            };
        }
    }

    fn take(&mut self) -> Entry {
        self.open.clear();
        self.awaits_value = false;
        Entry { start_line: self.start_line, text: std::mem::take(&mut self.buf), json_like: true }
    }

    fn finish(&mut self) -> Option<Entry> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }
}

//! Named, versioned schema store.
//!
//! Each id keeps its full version history. A new version must grow the
//! previous one monotonically (fields only added as optional, types only
//! widened, nothing removed); every write runs under the registry's write
//! lock so two refinements of one id cannot interleave.

use crate::error::ErrorKind;
use crate::events::{Event, EventSink};
use crate::infer::{Inference, InferenceEngine};
use crate::reader::RawRecord;
use crate::schema::{diff_schemas, regressions, SchemaChange, SchemaDefinition, SchemaError};
use itertools::Itertools;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("schema `{id}` update rejected: {}", describe(.changes))]
    Regression { id: String, changes: Vec<SchemaChange> },
    #[error("invalid schema: {0}")]
    Invalid(#[from] SchemaError),
    #[error("unknown schema `{0}`")]
    NotFound(String),
    #[error("schema `{id}` has no version {version}")]
    VersionNotFound { id: String, version: u32 },
    #[error("schemas `{first}` and `{second}` would share the file {path}")]
    FileClash { first: String, second: String, path: PathBuf },
    #[error("registry io at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("malformed schema document: {0}")]
    Format(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RegistryError::Regression { .. } => Some(ErrorKind::SchemaRegression),
            _ => None,
        }
    }
}

fn describe(changes: &[SchemaChange]) -> String {
    changes
        .iter()
        .map(|c| match c {
            SchemaChange::FieldAdded { field, .. } => format!("required field `{field}` added"),
            SchemaChange::FieldRemoved { field, .. } => format!("field `{field}` removed"),
            SchemaChange::TypeChanged { field, from_type, to_type } => {
                format!("`{field}` narrowed from {} to {}", from_type.as_str(), to_type.as_str())
            }
            SchemaChange::BecameOptional { field } => format!("`{field}` became optional"),
            SchemaChange::BecameRequired { field } => format!("`{field}` became required"),
            SchemaChange::AliasRemoved { field, alias } => format!("alias `{alias}` of `{field}` removed"),
        })
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub id: String,
    pub version: u32,
    pub updated: bool,
    /// Differences from the previous version (empty for a new id).
    pub changes: Vec<SchemaChange>,
}

/// On-disk and export form: one id with every version, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaHistory {
    pub id: String,
    pub versions: Vec<SchemaDefinition>,
}

#[derive(Default)]
pub struct SchemaRegistry {
    entries: RwLock<BTreeMap<String, Vec<SchemaDefinition>>>,
    events: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry").field("ids", &self.list()).finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Store `schema` under its id. A known id is updated to the next
    /// version, provided the update does not regress the latest one.
    pub fn register(&self, schema: SchemaDefinition) -> Result<Registration, RegistryError> {
        let mut entries = self.entries.write();
        let reg = Self::register_locked(&mut entries, schema)?;
        drop(entries);
        self.announce(&reg);
        Ok(reg)
    }

    fn register_locked(
        entries: &mut BTreeMap<String, Vec<SchemaDefinition>>,
        mut schema: SchemaDefinition,
    ) -> Result<Registration, RegistryError> {
        schema.validate()?;
        let id = schema.id.clone();
        let history = entries.entry(id.clone()).or_default();
        let (version, updated, changes) = match history.last() {
            Some(prev) => {
                let bad = regressions(prev, &schema);
                if !bad.is_empty() {
                    tracing::warn!(schema = %id, changes = bad.len(), "schema update rejected");
                    return Err(RegistryError::Regression { id, changes: bad });
                }
                (prev.version + 1, true, diff_schemas(prev, &schema))
            }
            None => (1, false, Vec::new()),
        };
        schema.version = version;
        let fields = schema.fields.len();
        history.push(schema);
        tracing::info!(schema = %id, version, fields, updated, "schema registered");
        Ok(Registration { id, version, updated, changes })
    }

    fn announce(&self, reg: &Registration) {
        if let Some(sink) = &self.events {
            let fields = self.get(&reg.id).map(|s| s.fields.len()).unwrap_or(0);
            sink.emit(Event::SchemaRegistered {
                id: reg.id.clone(),
                version: reg.version,
                fields,
                updated: reg.updated,
            });
        }
    }

    /// Infer from `sample` on top of the latest version of `id` and register
    /// the result, all under one write lock.
    pub fn refine<'a, I>(
        &self,
        id: &str,
        sample: I,
        engine: &InferenceEngine,
    ) -> Result<(Registration, Inference), RegistryError>
    where
        I: IntoIterator<Item = &'a RawRecord>,
    {
        let mut entries = self.entries.write();
        let base = entries.get(id).and_then(|h| h.last()).cloned();
        let inference = engine.infer(id, sample, base.as_ref());
        let reg = Self::register_locked(&mut entries, inference.schema.clone())?;
        drop(entries);
        self.announce(&reg);
        Ok((reg, inference))
    }

    /// Latest version of `id`.
    pub fn get(&self, id: &str) -> Option<SchemaDefinition> {
        self.entries.read().get(id).and_then(|h| h.last()).cloned()
    }

    pub fn get_version(&self, id: &str, version: u32) -> Result<SchemaDefinition, RegistryError> {
        let entries = self.entries.read();
        let history = entries.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        history
            .iter()
            .find(|s| s.version == version)
            .cloned()
            .ok_or_else(|| RegistryError::VersionNotFound { id: id.to_string(), version })
    }

    pub fn versions(&self, id: &str) -> Vec<u32> {
        self.entries.read().get(id).map(|h| h.iter().map(|s| s.version).collect()).unwrap_or_default()
    }

    /// Latest version of every schema, ordered by id.
    pub fn list(&self) -> Vec<SchemaDefinition> {
        self.entries.read().values().filter_map(|h| h.last().cloned()).collect()
    }

    pub fn remove(&self, id: &str) -> Option<SchemaHistory> {
        self.entries.write().remove(id).map(|versions| SchemaHistory { id: id.to_string(), versions })
    }

    pub fn history(&self, id: &str) -> Option<SchemaHistory> {
        self.entries.read().get(id).map(|v| SchemaHistory { id: id.to_string(), versions: v.clone() })
    }

    pub fn export_json(&self, id: &str) -> Result<String, RegistryError> {
        let history = self.history(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(serde_json::to_string_pretty(&history)?)
    }

    /// Import an exported history. An unknown id takes the history verbatim;
    /// a known id gets the imported latest version as a regular update.
    pub fn import_json(&self, text: &str) -> Result<Registration, RegistryError> {
        let history: SchemaHistory = serde_json::from_str(text)?;
        self.import_history(history)
    }

    fn import_history(&self, history: SchemaHistory) -> Result<Registration, RegistryError> {
        let Some(latest) = history.versions.last().cloned() else {
            return Err(RegistryError::NotFound(history.id));
        };
        let mut entries = self.entries.write();
        if entries.contains_key(&history.id) {
            let mut update = latest;
            update.id = history.id.clone();
            let reg = Self::register_locked(&mut entries, update)?;
            drop(entries);
            self.announce(&reg);
            return Ok(reg);
        }
        for (prev, next) in history.versions.iter().tuple_windows() {
            let bad = regressions(prev, next);
            if !bad.is_empty() {
                return Err(RegistryError::Regression { id: history.id.clone(), changes: bad });
            }
        }
        for s in &history.versions {
            s.validate()?;
        }
        let reg = Registration { id: history.id.clone(), version: latest.version, updated: false, changes: Vec::new() };
        entries.insert(history.id, history.versions);
        drop(entries);
        self.announce(&reg);
        Ok(reg)
    }

    /// Write one `<id>.json` history file per schema into `dir`.
    pub fn save_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
        std::fs::create_dir_all(dir).map_err(|source| RegistryError::Io { path: dir.to_path_buf(), source })?;
        let snapshot: Vec<SchemaHistory> = self
            .entries
            .read()
            .iter()
            .map(|(id, versions)| SchemaHistory { id: id.clone(), versions: versions.clone() })
            .collect();
        // Stems are unique, but a case-insensitive filesystem can still fold two together.
        let mut claimed: HashMap<String, &str> = HashMap::new();
        for history in &snapshot {
            let stem = safe_file_stem(&history.id);
            if let Some(first) = claimed.insert(stem.to_lowercase(), &history.id) {
                return Err(RegistryError::FileClash {
                    first: first.to_string(),
                    second: history.id.clone(),
                    path: dir.join(format!("{stem}.json")),
                });
            }
        }
        let mut written = Vec::new();
        for history in &snapshot {
            let path = dir.join(format!("{}.json", safe_file_stem(&history.id)));
            let text = serde_json::to_string_pretty(history)?;
            std::fs::write(&path, text).map_err(|source| RegistryError::Io { path: path.clone(), source })?;
            written.push(path);
        }
        tracing::debug!(dir = %dir.display(), schemas = written.len(), "registry saved");
        Ok(written)
    }

    /// Load every `*.json` history in `dir` (missing dir = nothing to load).
    pub fn load_dir(&self, dir: &Path) -> Result<usize, RegistryError> {
        if !dir.exists() {
            return Ok(0);
        }
        let read = std::fs::read_dir(dir).map_err(|source| RegistryError::Io { path: dir.to_path_buf(), source })?;
        let mut paths: Vec<PathBuf> = read
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();
        for path in &paths {
            let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io { path: path.clone(), source })?;
            self.import_json(&text)?;
        }
        Ok(paths.len())
    }
}

/// Schema ids as file names. ASCII alphanumerics, `-` and `.` are kept;
/// every other byte, `_` included, becomes `_XX` (hex), so distinct ids
/// never share a file.
pub fn safe_file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("_{b:02X}"));
        }
    }
    out
}

static GLOBAL: Lazy<RwLock<Option<Arc<SchemaRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Create (or return) the process-wide registry.
pub fn init() -> Arc<SchemaRegistry> {
    GLOBAL.write().get_or_insert_with(|| Arc::new(SchemaRegistry::new())).clone()
}

pub fn global() -> Option<Arc<SchemaRegistry>> {
    GLOBAL.read().clone()
}

/// Drop the process-wide registry; outstanding `Arc`s stay valid.
pub fn teardown() -> Option<Arc<SchemaRegistry>> {
    GLOBAL.write().take()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_stems() {
        assert_eq!(safe_file_stem("payments/api v2"), "payments_2Fapi_20v2");
        assert_eq!(safe_file_stem("app-1.log"), "app-1.log");
        assert_ne!(safe_file_stem("a/b"), safe_file_stem("a_b"));
        assert_eq!(safe_file_stem("a_b"), "a_5Fb");
        assert_eq!(safe_file_stem("é"), "_C3_A9");
    }

    #[test]
    fn global_lifecycle() {
        let a = init();
        let b = init();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(global().is_some());
        assert!(teardown().is_some());
        assert!(global().is_none());
    }
}

//! Field-name normalization.
//!
//! Log producers spell the same field many ways (`userId`, `user-id`,
//! `User ID`, `lvl` vs `level`, `retries_of_3`). The rules below fold each
//! path segment to one canonical spelling. They only ever rename paths in the
//! schema; raw record data is left untouched and the original spelling is kept
//! as an alias.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const PATH_SEPARATOR: char = '.';

static RE_DELIM_TAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*(?:--|—|-\s|:)").unwrap());
static RE_INDEX_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:_of_\d+|(?:\s|_)of\s+\d+|_\d+|-\d+|\s+\d+)$").unwrap());
static RE_OF_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+of\b.*$").unwrap());
static RE_CAMEL_ACRONYM: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").unwrap());
static RE_CAMEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());
static RE_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\-.]+").unwrap());
static RE_UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationRules {
    /// Drop everything after `--`, `—`, `- ` or `:` (descriptive noise).
    pub cut_delimiter_tail: bool,
    /// Drop trailing counters: `_3`, `-3`, ` 3`, `_of_3`, ` of 3 docs`.
    pub strip_index_suffix: bool,
    /// `userId` -> `user_Id` before case folding.
    pub split_camel_case: bool,
    pub fold_case: bool,
    /// Spaces, dashes and dots inside a key become `_`.
    pub unify_separators: bool,
    pub strip_prefixes: Vec<String>,
    pub strip_suffixes: Vec<String>,
    /// Applied last, on the already-normalized segment.
    pub synonyms: BTreeMap<String, String>,
}

impl Default for NormalizationRules {
    fn default() -> Self {
        let synonyms = [
            ("lvl", "level"),
            ("loglevel", "level"),
            ("log_level", "level"),
            ("ts", "timestamp"),
            ("time_stamp", "timestamp"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();
        Self {
            cut_delimiter_tail: true,
            strip_index_suffix: true,
            split_camel_case: true,
            fold_case: true,
            unify_separators: true,
            strip_prefixes: vec!["@".to_string()],
            strip_suffixes: Vec::new(),
            synonyms,
        }
    }
}

impl NormalizationRules {
    /// Identity rules: every key is its own canonical name.
    pub fn none() -> Self {
        Self {
            cut_delimiter_tail: false,
            strip_index_suffix: false,
            split_camel_case: false,
            fold_case: false,
            unify_separators: false,
            strip_prefixes: Vec::new(),
            strip_suffixes: Vec::new(),
            synonyms: BTreeMap::new(),
        }
    }

    pub fn with_synonym(mut self, variant: &str, canonical: &str) -> Self {
        self.synonyms.insert(variant.to_string(), canonical.to_string());
        self
    }

    pub fn normalize_segment(&self, raw: &str) -> String {
        let original = raw.trim();
        let mut k = original.to_string();

        if self.cut_delimiter_tail {
            if let Some(m) = RE_DELIM_TAIL.find(&k) {
                if m.start() > 0 {
                    k.truncate(m.start());
                }
            }
        }
        if self.strip_index_suffix {
            k = rewrite(k, |s| RE_INDEX_SUFFIX.replace(s, "").trim().to_string());
            k = rewrite(k, |s| RE_OF_CLAUSE.replace(s, "").trim().to_string());
        }
        for p in &self.strip_prefixes {
            k = rewrite(k, |s| s.strip_prefix(p.as_str()).unwrap_or(s).to_string());
        }
        if self.split_camel_case {
            k = rewrite(k, |s| {
                let split = RE_CAMEL_ACRONYM.replace_all(s, "${1}_${2}");
                RE_CAMEL.replace_all(&split, "${1}_${2}").into_owned()
            });
        }
        if self.unify_separators {
            k = rewrite(k, |s| {
                let unified = RE_SEPARATORS.replace_all(s, "_");
                RE_UNDERSCORES.replace_all(&unified, "_").trim_matches('_').to_string()
            });
        }
        if self.fold_case {
            k = k.to_lowercase();
        }
        for suffix in &self.strip_suffixes {
            k = rewrite(k, |s| s.strip_suffix(suffix.as_str()).unwrap_or(s).to_string());
        }
        if let Some(target) = self.synonyms.get(&k) {
            k = target.clone();
        }
        if k.is_empty() {
            original.to_string()
        } else {
            k
        }
    }

    /// Normalize every segment of a dot path.
    pub fn normalize_path(&self, raw_path: &str) -> String {
        raw_path
            .split(PATH_SEPARATOR)
            .map(|seg| self.normalize_segment(seg))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Depth-first walk over the members of `map`, descending into nested
/// objects but treating arrays as leaves. The callback receives the canonical
/// path, the raw path and the value of every member, parents before children.
pub fn visit_fields<'v, F>(rules: &NormalizationRules, map: &'v Map<String, Value>, f: &mut F)
where
    F: FnMut(&str, &str, &'v Value),
{
    visit_inner(rules, "", "", map, f);
}

fn visit_inner<'v, F>(rules: &NormalizationRules, canon_prefix: &str, raw_prefix: &str, map: &'v Map<String, Value>, f: &mut F)
where
    F: FnMut(&str, &str, &'v Value),
{
    for (key, value) in map {
        let canon = join_path(canon_prefix, &rules.normalize_segment(key));
        let raw = join_path(raw_prefix, key);
        f(&canon, &raw, value);
        if let Value::Object(child) = value {
            visit_inner(rules, &canon, &raw, child, f);
        }
    }
}

/// Apply one rewrite step, keeping the previous spelling if the step would
/// leave nothing.
fn rewrite(current: String, step: impl FnOnce(&str) -> String) -> String {
    let next = step(&current);
    if next.is_empty() {
        current
    } else {
        next
    }
}

pub fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}{PATH_SEPARATOR}{segment}")
    }
}

/// True when `path` is `ancestor` or lies underneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path[ancestor.len()..].starts_with(PATH_SEPARATOR))
}

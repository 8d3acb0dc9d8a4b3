//! Record filters: a conjunction of per-field clauses, evaluated against the
//! coerced values of an extracted record.

use crate::extract::FieldValue;
use crate::schema::SchemaDefinition;
use crate::timestamp::parse_timestamp;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("cannot parse clause `{0}` (expected f==v, f~v, f=~re or f in a..b)")]
    Syntax(String),
    #[error("invalid regex for `{field}`: {detail}")]
    Regex { field: String, detail: String },
}

#[derive(Debug, Clone)]
pub enum Condition {
    Equals(Value),
    /// Substring of a string value, or membership in an array value.
    Contains(String),
    /// Inclusive on both ends; a missing bound is open.
    Range { min: Option<Value>, max: Option<Value> },
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct Clause {
    pub field: String,
    pub condition: Condition,
}

static RE_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([^\s=~]+)\s+in\s+(.*?)\.\.(.*?)\s*$").unwrap());

impl Clause {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { field: field.into(), condition: Condition::Equals(value.into()) }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self { field: field.into(), condition: Condition::Contains(needle.into()) }
    }

    pub fn range(field: impl Into<String>, min: Option<Value>, max: Option<Value>) -> Self {
        Self { field: field.into(), condition: Condition::Range { min, max } }
    }

    pub fn regex(field: impl Into<String>, pattern: &str) -> Result<Self, PredicateError> {
        let field = field.into();
        let re = Regex::new(pattern).map_err(|e| PredicateError::Regex { field: field.clone(), detail: e.to_string() })?;
        Ok(Self { field, condition: Condition::Regex(re) })
    }

    /// Parse the textual form: `f==v`, `f~v`, `f=~re`, `f in a..b` (either
    /// bound may be empty). Values that read as JSON literals (`504`, `true`,
    /// `"x"`) keep their type; anything else is a string.
    pub fn parse(text: &str) -> Result<Self, PredicateError> {
        let text = text.trim();
        if let Some(caps) = RE_RANGE.captures(text) {
            let bound = |s: &str| {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else {
                    Some(literal(s))
                }
            };
            return Ok(Self::range(&caps[1], bound(&caps[2]), bound(&caps[3])));
        }
        // The leftmost operator splits field from value; later ones belong to the value.
        let op = text.char_indices().find_map(|(i, c)| match c {
            '=' if text[i..].starts_with("=~") => Some((i, "=~")),
            '=' if text[i..].starts_with("==") => Some((i, "==")),
            '~' => Some((i, "~")),
            _ => None,
        });
        let Some((at, op)) = op else {
            return Err(PredicateError::Syntax(text.to_string()));
        };
        let field = field_name(&text[..at], text)?;
        let rest = text[at + op.len()..].trim();
        match op {
            "=~" => Self::regex(field, rest),
            "==" => Ok(Self::equals(field, literal(rest))),
            _ => {
                let needle = match literal(rest) {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(Self::contains(field, needle))
            }
        }
    }

    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else { return false };
        match &self.condition {
            Condition::Equals(want) => loosely_equal(value, want),
            Condition::Contains(needle) => match value {
                Value::String(s) => s.contains(needle.as_str()),
                Value::Array(items) => items.iter().any(|i| text_of(i) == *needle),
                other => text_of(other).contains(needle.as_str()),
            },
            Condition::Range { min, max } => {
                let above = min.as_ref().map(|m| compare(value, m).map(|o| o != Ordering::Less).unwrap_or(false));
                let below = max.as_ref().map(|m| compare(value, m).map(|o| o != Ordering::Greater).unwrap_or(false));
                above.unwrap_or(true) && below.unwrap_or(true)
            }
            Condition::Regex(re) => match value {
                Value::Array(items) => items.iter().any(|i| re.is_match(&text_of(i))),
                other => re.is_match(&text_of(other)),
            },
        }
    }
}

fn field_name(raw: &str, whole: &str) -> Result<String, PredicateError> {
    let f = raw.trim();
    if f.is_empty() {
        Err(PredicateError::Syntax(whole.to_string()))
    } else {
        Ok(f.to_string())
    }
}

fn literal(s: &str) -> Value {
    match serde_json::from_str::<Value>(s) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::String(_) | Value::Null)) => v,
        _ => Value::String(s.to_string()),
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(p), Some(q)) => p == q,
            _ => false,
        },
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => text_of(a) == text_of(b),
        _ => false,
    }
}

/// Numbers compare numerically, timestamps chronologically, everything else
/// by text.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        if let (Some(p), Some(q)) = (parse_timestamp(x), parse_timestamp(y)) {
            return Some(p.cmp(&q));
        }
    }
    match (a, b) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => None,
        _ => Some(text_of(a).cmp(&text_of(b))),
    }
}

/// A conjunction of clauses. The empty predicate accepts everything.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn parse_all<S: AsRef<str>>(exprs: &[S]) -> Result<Self, PredicateError> {
        let clauses = exprs.iter().map(|e| Clause::parse(e.as_ref())).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Rewrite every clause onto the canonical field it names, resolving
    /// aliases. Returns the first name the schema does not know.
    pub fn bind(&self, schema: &SchemaDefinition) -> Result<Predicate, String> {
        let mut bound = Vec::with_capacity(self.clauses.len());
        for c in &self.clauses {
            let Some(desc) = schema.resolve(&c.field) else {
                return Err(c.field.clone());
            };
            bound.push(Clause { field: desc.path.clone(), condition: c.condition.clone() });
        }
        Ok(Predicate { clauses: bound })
    }

    /// Stops at the first failing clause.
    pub fn matches(&self, fields: &BTreeMap<String, FieldValue>) -> bool {
        self.clauses.iter().all(|c| c.matches(fields.get(&c.field).and_then(FieldValue::value)))
    }
}

//! Schema-directed extraction: project raw records onto a schema's canonical
//! fields, coerce each value to its declared type, and filter.

use crate::config::ExtractionConfig;
use crate::error::{push_sample, ErrorKind, Issue};
use crate::events::{Event, EventSink};
use crate::normalize::{visit_fields, NormalizationRules};
use crate::predicate::Predicate;
use crate::reader::{Provenance, RawRecord};
use crate::schema::{FieldDescriptor, FieldType, SchemaDefinition};
use crate::timestamp::{timestamp_from_value, to_rfc3339};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("schema `{schema}` has no field or alias named `{field}`")]
    UnknownField { schema: String, field: String },
}

/// A column value: present with its coerced value, or explicitly absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Present(Value),
    Absent,
}

impl FieldValue {
    pub fn value(&self) -> Option<&Value> {
        match self {
            FieldValue::Present(v) => Some(v),
            FieldValue::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, FieldValue::Present(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub source: Provenance,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ExtractedRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(FieldValue::value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub scanned: usize,
    pub included: usize,
    pub missing_required: usize,
    pub filtered_out: usize,
    pub coercion_demoted: usize,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub schema_id: String,
    pub schema_version: u32,
    /// Output columns in schema order.
    pub columns: Vec<String>,
    pub records: Vec<ExtractedRecord>,
    pub stats: ExtractionStats,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Clone, Default)]
pub struct ExtractionEngine {
    rules: NormalizationRules,
    config: ExtractionConfig,
    selected: Option<Vec<String>>,
    events: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for ExtractionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionEngine")
            .field("rules", &self.rules)
            .field("config", &self.config)
            .field("selected", &self.selected)
            .finish()
    }
}

impl ExtractionEngine {
    pub fn new(rules: NormalizationRules, config: ExtractionConfig) -> Self {
        Self { rules, config, selected: None, events: None }
    }

    /// Restrict output columns. Names may be canonical paths or aliases;
    /// required fields outside the selection still gate inclusion.
    pub fn with_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.selected = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    fn emit(&self, event: Event) {
        if let Some(sink) = &self.events {
            sink.emit(event);
        }
    }

    fn columns(&self, schema: &SchemaDefinition) -> Result<Vec<String>, ExtractError> {
        let materialized = |f: &FieldDescriptor| f.field_type != FieldType::Object;
        let Some(selected) = &self.selected else {
            return Ok(schema.fields.iter().filter(|f| materialized(f)).map(|f| f.path.clone()).collect());
        };
        let mut wanted = Vec::with_capacity(selected.len());
        for name in selected {
            let desc = schema.resolve(name).ok_or_else(|| ExtractError::UnknownField {
                schema: schema.id.clone(),
                field: name.clone(),
            })?;
            wanted.push(desc.path.as_str());
        }
        Ok(schema
            .fields
            .iter()
            .filter(|f| materialized(f) && wanted.contains(&f.path.as_str()))
            .map(|f| f.path.clone())
            .collect())
    }

    /// Run one extraction pass. The same records, schema and predicate
    /// always give the same result.
    pub fn extract<I, R>(
        &self,
        records: I,
        schema: &SchemaDefinition,
        predicate: Option<&Predicate>,
    ) -> Result<ExtractionResult, ExtractError>
    where
        I: IntoIterator<Item = R>,
        R: Borrow<RawRecord>,
    {
        let columns = self.columns(schema)?;
        let predicate = match predicate {
            Some(p) => Some(p.bind(schema).map_err(|field| ExtractError::UnknownField {
                schema: schema.id.clone(),
                field,
            })?),
            None => None,
        };
        let descriptors: Vec<&FieldDescriptor> =
            schema.fields.iter().filter(|f| f.field_type != FieldType::Object).collect();

        let mut stats = ExtractionStats::default();
        let mut out = Vec::new();
        for rec in records {
            let rec = rec.borrow();
            stats.scanned += 1;
            let row = self.project(rec, &descriptors, &mut stats);
            let complete = descriptors.iter().all(|d| d.optional || row.get(&d.path).map(FieldValue::is_present).unwrap_or(false));
            if !complete {
                stats.missing_required += 1;
            } else if predicate.as_ref().map(|p| p.matches(&row)).unwrap_or(true) {
                stats.included += 1;
                let fields = row.into_iter().filter(|(k, _)| columns.contains(k)).collect();
                out.push(ExtractedRecord { source: rec.source.clone(), fields });
            } else {
                stats.filtered_out += 1;
            }
            if self.config.progress_every > 0 && stats.scanned % self.config.progress_every == 0 {
                self.emit(Event::ExtractionProgress { scanned: stats.scanned, included: stats.included });
            }
        }

        tracing::info!(
            schema = %schema.id,
            scanned = stats.scanned,
            included = stats.included,
            missing_required = stats.missing_required,
            filtered_out = stats.filtered_out,
            demoted = stats.coercion_demoted,
            "extraction finished"
        );
        self.emit(Event::ExtractionFinished { stats: stats.clone() });
        Ok(ExtractionResult {
            schema_id: schema.id.clone(),
            schema_version: schema.version,
            columns,
            records: out,
            stats,
        })
    }

    fn project(
        &self,
        rec: &RawRecord,
        descriptors: &[&FieldDescriptor],
        stats: &mut ExtractionStats,
    ) -> BTreeMap<String, FieldValue> {
        let mut by_canon: HashMap<String, &Value> = HashMap::new();
        let mut by_raw: HashMap<String, &Value> = HashMap::new();
        visit_fields(&self.rules, &rec.fields, &mut |canon, raw, value| {
            if !value.is_null() {
                by_canon.entry(canon.to_string()).or_insert(value);
                by_raw.insert(raw.to_string(), value);
            }
        });

        let mut row = BTreeMap::new();
        for desc in descriptors {
            let found = by_canon
                .get(&desc.path)
                .copied()
                .or_else(|| desc.aliases.iter().find_map(|a| by_raw.get(a).copied()));
            let value = match found {
                None => FieldValue::Absent,
                Some(v) => match coerce(v, desc.field_type) {
                    Some(c) => FieldValue::Present(c),
                    None => {
                        stats.coercion_demoted += 1;
                        let detail = format!("{} value does not fit {}", FieldType::of(v).as_str(), desc.field_type.as_str());
                        tracing::debug!(field = %desc.path, line = rec.source.line, %detail, "value demoted to absent");
                        push_sample(
                            &mut stats.issues,
                            Issue::at(ErrorKind::CoercionDemoted, &rec.source.file, Some(rec.source.line), detail)
                                .with_field(desc.path.clone()),
                        );
                        FieldValue::Absent
                    }
                },
            };
            row.insert(desc.path.clone(), value);
        }
        row
    }
}

/// Coerce a non-null value to `ty`; `None` means it does not fit.
pub fn coerce(v: &Value, ty: FieldType) -> Option<Value> {
    match ty {
        FieldType::Null => Some(v.clone()),
        FieldType::String => v.is_string().then(|| v.clone()),
        FieldType::Number => match v {
            Value::Number(_) => Some(v.clone()),
            Value::String(s) => parse_number(s.trim()).map(Value::Number),
            _ => None,
        },
        FieldType::Bool => match v {
            Value::Bool(_) => Some(v.clone()),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(Value::Bool(false)),
            _ => None,
        },
        FieldType::Timestamp => timestamp_from_value(v).map(|dt| Value::String(to_rfc3339(&dt))),
        FieldType::Mixed => (!v.is_array() && !v.is_object()).then(|| v.clone()),
        FieldType::Array => v.is_array().then(|| v.clone()),
        FieldType::Object => v.is_object().then(|| v.clone()),
    }
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coercion_table() {
        assert_eq!(coerce(&json!("42"), FieldType::Number), Some(json!(42)));
        assert_eq!(coerce(&json!(" 2.5 "), FieldType::Number), Some(json!(2.5)));
        assert_eq!(coerce(&json!("abc"), FieldType::Number), None);
        assert_eq!(coerce(&json!(42), FieldType::String), None);
        assert_eq!(coerce(&json!("TRUE"), FieldType::Bool), Some(json!(true)));
        assert_eq!(coerce(&json!(1), FieldType::Bool), None);
        assert_eq!(coerce(&json!(1_700_000_000), FieldType::Timestamp), Some(json!("2023-11-14T22:13:20Z")));
        assert_eq!(
            coerce(&json!("2024-01-15 14:20:00"), FieldType::Timestamp),
            Some(json!("2024-01-15T14:20:00Z"))
        );
        assert_eq!(coerce(&json!([1]), FieldType::Mixed), None);
        assert_eq!(coerce(&json!({"a": 1}), FieldType::Null), Some(json!({"a": 1})));
    }

    #[test]
    fn nan_like_strings_are_not_numbers() {
        assert_eq!(coerce(&json!("NaN"), FieldType::Number), None);
    }
}

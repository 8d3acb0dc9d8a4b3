//! Schema inference over a bounded sample of records.
//!
//! Every member of every sampled record is observed under its canonical
//! (normalized) path. Types are unified per path; arrays of objects are
//! inferred recursively with each element counted as its own record, so the
//! element schema is the union of everything any element carried.

use crate::config::InferenceConfig;
use crate::normalize::{is_within, visit_fields, NormalizationRules};
use crate::reader::RawRecord;
use crate::schema::{FieldDescriptor, FieldType, SchemaDefinition, Unified};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inference {
    pub schema: SchemaDefinition,
    pub sampled: usize,
    /// Paths seen both structured and scalar; left out of the schema.
    pub ambiguous: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InferenceEngine {
    rules: NormalizationRules,
    sample_limit: usize,
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::new(NormalizationRules::default(), &InferenceConfig::default())
    }
}

impl InferenceEngine {
    pub fn new(rules: NormalizationRules, config: &InferenceConfig) -> Self {
        Self { rules, sample_limit: config.sample_limit.max(1) }
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit.max(1);
        self
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    pub fn sample_limit(&self) -> usize {
        self.sample_limit
    }

    /// Infer a schema named `id` from at most `sample_limit` records. When
    /// `base` is given the result refines it: no base field is dropped,
    /// types only widen, and fields the base never had come in optional.
    pub fn infer<'a, I>(&self, id: &str, records: I, base: Option<&SchemaDefinition>) -> Inference
    where
        I: IntoIterator<Item = &'a RawRecord>,
    {
        let mut acc = Accumulator::default();
        for rec in records.into_iter().take(self.sample_limit) {
            acc.observe_record(&rec.fields, &self.rules);
        }
        let sampled = acc.records;
        let mut ambiguous = Vec::new();
        let inferred = acc.finish(id, "", &mut ambiguous);
        let mut schema = match base {
            Some(b) => {
                let mut merged = merge_schemas(b, &inferred, "", &mut ambiguous);
                merged.id = id.to_string();
                merged
            }
            None => inferred,
        };
        prune_alias_collisions(&mut schema);
        for path in &ambiguous {
            tracing::warn!(schema = id, field = %path, "field seen as both structured and scalar; excluded");
        }
        tracing::info!(schema = id, fields = schema.fields.len(), sampled, "schema inferred");
        Inference { schema, sampled, ambiguous }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    records: usize,
    order: Vec<String>,
    fields: HashMap<String, FieldStat>,
}

#[derive(Debug)]
struct FieldStat {
    ty: FieldType,
    ambiguous: bool,
    present: usize,
    aliases: BTreeSet<String>,
    element_type: Option<FieldType>,
    elements: Option<Box<Accumulator>>,
}

impl FieldStat {
    fn new() -> Self {
        Self {
            ty: FieldType::Null,
            ambiguous: false,
            present: 0,
            aliases: BTreeSet::new(),
            element_type: None,
            elements: None,
        }
    }

    fn observe_type(&mut self, t: FieldType) {
        match self.ty.widen(t) {
            Unified::Type(w) => self.ty = w,
            Unified::Ambiguous => self.ambiguous = true,
        }
    }

    fn observe_element(&mut self, t: FieldType) {
        self.element_type = Some(match self.element_type {
            None => t,
            Some(prev) => match prev.widen(t) {
                Unified::Type(w) => w,
                Unified::Ambiguous => FieldType::Mixed,
            },
        });
    }
}

impl Accumulator {
    fn observe_record(&mut self, map: &Map<String, Value>, rules: &NormalizationRules) {
        self.records += 1;
        let mut seen: HashSet<String> = HashSet::new();
        visit_fields(rules, map, &mut |canon, raw, value| {
            if !self.fields.contains_key(canon) {
                self.order.push(canon.to_string());
            }
            let stat = self.fields.entry(canon.to_string()).or_insert_with(FieldStat::new);
            if raw != canon {
                stat.aliases.insert(raw.to_string());
            }
            stat.observe_type(FieldType::of(value));
            if !value.is_null() && seen.insert(canon.to_string()) {
                stat.present += 1;
            }
            if let Value::Array(items) = value {
                for item in items {
                    match item {
                        Value::Null => {}
                        Value::Object(obj) => {
                            stat.observe_element(FieldType::Object);
                            stat.elements.get_or_insert_with(Default::default).observe_record(obj, rules);
                        }
                        other => stat.observe_element(FieldType::of(other)),
                    }
                }
            }
        });
    }

    fn finish(self, id: &str, prefix: &str, ambiguous: &mut Vec<String>) -> SchemaDefinition {
        let mut schema = SchemaDefinition::new(id);
        let Accumulator { records, order, mut fields } = self;
        let excluded: Vec<String> =
            order.iter().filter(|p| fields.get(*p).map(|s| s.ambiguous).unwrap_or(false)).cloned().collect();
        ambiguous.extend(excluded.iter().map(|p| format!("{prefix}{p}")));

        for path in order {
            if excluded.iter().any(|ex| is_within(&path, ex)) {
                continue;
            }
            let Some(stat) = fields.remove(&path) else { continue };
            if let Some(sub) = stat.elements {
                let sub_id = format!("{id}/{path}[]");
                let sub_prefix = format!("{prefix}{path}[].");
                schema.elements.insert(path.clone(), sub.finish(&sub_id, &sub_prefix, ambiguous));
            }
            schema.fields.push(FieldDescriptor {
                optional: stat.present < records,
                field_type: stat.ty,
                aliases: stat.aliases,
                element_type: stat.element_type,
                path,
            });
        }
        schema
    }
}

/// An alias may not shadow another field's canonical path. Normalization is
/// not always idempotent (`step_1_2` -> `step_1` -> `step`), so drop those.
fn prune_alias_collisions(schema: &mut SchemaDefinition) {
    let paths: HashSet<String> = schema.fields.iter().map(|f| f.path.clone()).collect();
    for f in &mut schema.fields {
        f.aliases.retain(|a| !paths.contains(a));
    }
    for sub in schema.elements.values_mut() {
        prune_alias_collisions(sub);
    }
}

/// Fold a freshly inferred schema into an existing one without losing any of
/// the existing fields.
pub fn merge_schemas(
    base: &SchemaDefinition,
    inferred: &SchemaDefinition,
    prefix: &str,
    ambiguous: &mut Vec<String>,
) -> SchemaDefinition {
    let mut out = SchemaDefinition { id: base.id.clone(), version: base.version, fields: Vec::new(), elements: Default::default() };
    // Base fields whose structure conflicts with the new sample; new fields
    // underneath them are dropped.
    let mut blocked: Vec<String> = Vec::new();

    for b in &base.fields {
        let mut merged = b.clone();
        match inferred.field(&b.path) {
            Some(n) => {
                match b.field_type.widen(n.field_type) {
                    Unified::Type(t) => merged.field_type = t,
                    Unified::Ambiguous => {
                        ambiguous.push(format!("{prefix}{}", b.path));
                        blocked.push(b.path.clone());
                    }
                }
                merged.optional = b.optional || n.optional;
                merged.aliases.extend(n.aliases.iter().cloned());
                merged.element_type = match (b.element_type, n.element_type) {
                    (Some(x), Some(y)) => Some(match x.widen(y) {
                        Unified::Type(t) => t,
                        Unified::Ambiguous => FieldType::Mixed,
                    }),
                    (x, y) => x.or(y),
                };
            }
            None => merged.optional = true,
        }
        if merged.field_type != FieldType::Object && merged.field_type != FieldType::Null {
            blocked.push(b.path.clone());
        }
        out.fields.push(merged);
    }

    let base_had_records = !base.fields.is_empty();
    for n in &inferred.fields {
        if base.field(&n.path).is_some() {
            continue;
        }
        if blocked.iter().any(|p| is_within(&n.path, p)) {
            ambiguous.push(format!("{prefix}{}", n.path));
            continue;
        }
        let mut added = n.clone();
        added.optional = added.optional || base_had_records;
        out.fields.push(added);
    }

    for f in &out.fields {
        if f.field_type != FieldType::Array {
            continue;
        }
        let sub_prefix = format!("{prefix}{}[].", f.path);
        let sub = match (base.elements.get(&f.path), inferred.elements.get(&f.path)) {
            (Some(b), Some(n)) => Some(merge_schemas(b, n, &sub_prefix, ambiguous)),
            (Some(b), None) => Some(b.clone()),
            (None, Some(n)) => Some(n.clone()),
            (None, None) => None,
        };
        if let Some(sub) = sub {
            out.elements.insert(f.path.clone(), sub);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(values: Vec<Value>) -> Vec<RawRecord> {
        values.into_iter().enumerate().filter_map(|(i, v)| RawRecord::from_value(v, i + 1)).collect()
    }

    #[test]
    fn optional_when_not_in_every_record() {
        let recs = records(vec![json!({"a": 1, "b": "x"}), json!({"a": 2})]);
        let out = InferenceEngine::default().with_sample_limit(10).infer("t", &recs, None);
        assert!(!out.schema.field("a").unwrap().optional);
        assert!(out.schema.field("b").unwrap().optional);
        assert_eq!(out.sampled, 2);
    }

    #[test]
    fn nulls_do_not_count_as_present() {
        let recs = records(vec![json!({"a": null}), json!({"a": true})]);
        let out = InferenceEngine::default().with_sample_limit(10).infer("t", &recs, None);
        let a = out.schema.field("a").unwrap();
        assert_eq!(a.field_type, FieldType::Bool);
        assert!(a.optional);
    }

    #[test]
    fn sample_limit_bounds_the_walk() {
        let recs = records(vec![json!({"a": 1}), json!({"b": 2})]);
        let out = InferenceEngine::default().with_sample_limit(1).infer("t", &recs, None);
        assert_eq!(out.sampled, 1);
        assert!(out.schema.field("b").is_none());
    }

    #[test]
    fn scalar_arrays_record_element_type() {
        let recs = records(vec![json!({"tags": ["a", "b"]}), json!({"tags": [1]})]);
        let out = InferenceEngine::default().with_sample_limit(10).infer("t", &recs, None);
        let tags = out.schema.field("tags").unwrap();
        assert_eq!(tags.field_type, FieldType::Array);
        assert_eq!(tags.element_type, Some(FieldType::Mixed));
        assert!(out.schema.elements.is_empty());
    }
}

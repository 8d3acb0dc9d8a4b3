use crate::timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema id must not be empty")]
    EmptyId,
    #[error("duplicate field path `{0}`")]
    DuplicateField(String),
    #[error("alias `{alias}` maps to both `{first}` and `{second}`")]
    AliasConflict { alias: String, first: String, second: String },
    #[error("element schema `{0}` has no matching array field")]
    OrphanElementSchema(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Only ever observed as JSON null.
    Null,
    String,
    Number,
    Bool,
    Timestamp,
    Object,
    Array,
    /// Conflicting scalar observations.
    Mixed,
}

/// Outcome of unifying two observations of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unified {
    Type(FieldType),
    /// Structured and scalar observations of the same path.
    Ambiguous,
}

impl FieldType {
    pub fn of(v: &Value) -> FieldType {
        match v {
            Value::Null => FieldType::Null,
            Value::Bool(_) => FieldType::Bool,
            Value::Number(_) => FieldType::Number,
            Value::String(s) if timestamp::looks_like_timestamp(s) => FieldType::Timestamp,
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::Array,
            Value::Object(_) => FieldType::Object,
        }
    }

    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Number | FieldType::Bool | FieldType::Timestamp | FieldType::Mixed
        )
    }

    pub fn widen(self, other: FieldType) -> Unified {
        use FieldType::*;
        match (self, other) {
            (a, b) if a == b => Unified::Type(a),
            (Null, x) | (x, Null) => Unified::Type(x),
            (Timestamp, String) | (String, Timestamp) => Unified::Type(String),
            (a, b) if a.is_scalar() && b.is_scalar() => Unified::Type(Mixed),
            _ => Unified::Ambiguous,
        }
    }

    /// True when `next` is `self` or a widening of it.
    pub fn widens_to(self, next: FieldType) -> bool {
        self.widen(next) == Unified::Type(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Null => "null",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::Timestamp => "timestamp",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub path: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub optional: bool,
    /// Raw spellings observed for this field.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aliases: BTreeSet<String>,
    /// Element type for arrays; `object` elements are described by the
    /// schema's element sub-schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<FieldType>,
}

impl FieldDescriptor {
    pub fn new(path: impl Into<String>, field_type: FieldType, optional: bool) -> Self {
        Self { path: path.into(), field_type, optional, aliases: BTreeSet::new(), element_type: None }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub id: String,
    #[serde(default = "first_version")]
    pub version: u32,
    pub fields: Vec<FieldDescriptor>,
    /// Sub-schemas for arrays of objects, keyed by the array field path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub elements: BTreeMap<String, SchemaDefinition>,
}

fn first_version() -> u32 {
    1
}

impl SchemaDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), version: 1, fields: Vec::new(), elements: BTreeMap::new() }
    }

    pub fn field(&self, path: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.path == path)
    }

    /// Look a name up as a canonical path first, then as an alias.
    pub fn resolve(&self, name: &str) -> Option<&FieldDescriptor> {
        self.field(name).or_else(|| self.fields.iter().find(|f| f.aliases.contains(name)))
    }

    pub fn paths(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.path.as_str()).collect()
    }

    /// Check structural invariants: unique paths, every alias owned by exactly
    /// one field, element schemas hang off array fields.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.id.trim().is_empty() {
            return Err(SchemaError::EmptyId);
        }
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for f in &self.fields {
            if owners.insert(f.path.as_str(), f.path.as_str()).is_some() {
                return Err(SchemaError::DuplicateField(f.path.clone()));
            }
        }
        for f in &self.fields {
            for alias in &f.aliases {
                if alias == &f.path {
                    continue;
                }
                if let Some(first) = owners.insert(alias.as_str(), f.path.as_str()) {
                    return Err(SchemaError::AliasConflict {
                        alias: alias.clone(),
                        first: first.to_string(),
                        second: f.path.clone(),
                    });
                }
            }
        }
        for (path, sub) in &self.elements {
            match self.field(path) {
                Some(f) if f.field_type == FieldType::Array => sub.validate()?,
                _ => return Err(SchemaError::OrphanElementSchema(path.clone())),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SchemaChange {
    FieldAdded { field: String, new_type: FieldType, optional: bool },
    FieldRemoved { field: String, old_type: FieldType },
    TypeChanged { field: String, from_type: FieldType, to_type: FieldType },
    BecameOptional { field: String },
    BecameRequired { field: String },
    AliasRemoved { field: String, alias: String },
}

impl SchemaChange {
    /// Changes a newer schema version may not make: anything that would
    /// drop a field, narrow a type or make previously valid records invalid.
    pub fn is_regression(&self) -> bool {
        match self {
            SchemaChange::FieldAdded { optional, .. } => !optional,
            SchemaChange::FieldRemoved { .. } => true,
            SchemaChange::TypeChanged { from_type, to_type, .. } => !from_type.widens_to(*to_type),
            SchemaChange::BecameOptional { .. } => false,
            SchemaChange::BecameRequired { .. } => true,
            SchemaChange::AliasRemoved { .. } => true,
        }
    }
}

/// Field-level differences from `before` to `after`, element sub-schemas
/// included (their paths are reported as `array[].field`).
pub fn diff_schemas(before: &SchemaDefinition, after: &SchemaDefinition) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    diff_into("", before, after, &mut changes);
    changes
}

fn diff_into(prefix: &str, before: &SchemaDefinition, after: &SchemaDefinition, out: &mut Vec<SchemaChange>) {
    let name = |p: &str| format!("{prefix}{p}");
    for b in &before.fields {
        let Some(a) = after.field(&b.path) else {
            out.push(SchemaChange::FieldRemoved { field: name(&b.path), old_type: b.field_type });
            continue;
        };
        if a.field_type != b.field_type {
            out.push(SchemaChange::TypeChanged {
                field: name(&b.path),
                from_type: b.field_type,
                to_type: a.field_type,
            });
        }
        match (b.optional, a.optional) {
            (false, true) => out.push(SchemaChange::BecameOptional { field: name(&b.path) }),
            (true, false) => out.push(SchemaChange::BecameRequired { field: name(&b.path) }),
            _ => {}
        }
        for alias in b.aliases.difference(&a.aliases) {
            out.push(SchemaChange::AliasRemoved { field: name(&b.path), alias: alias.clone() });
        }
    }
    for a in &after.fields {
        if before.field(&a.path).is_none() {
            out.push(SchemaChange::FieldAdded { field: name(&a.path), new_type: a.field_type, optional: a.optional });
        }
    }
    let empty = SchemaDefinition::new(String::new());
    let keys: BTreeSet<&String> = before.elements.keys().chain(after.elements.keys()).collect();
    for key in keys {
        let sub_prefix = format!("{prefix}{key}[].");
        let b = before.elements.get(key).unwrap_or(&empty);
        let a = after.elements.get(key).unwrap_or(&empty);
        diff_into(&sub_prefix, b, a, out);
    }
}

/// The subset of `diff_schemas` that violates monotonic growth.
pub fn regressions(before: &SchemaDefinition, after: &SchemaDefinition) -> Vec<SchemaChange> {
    diff_schemas(before, after).into_iter().filter(SchemaChange::is_regression).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_lattice() {
        use FieldType::*;
        assert_eq!(Number.widen(String), Unified::Type(Mixed));
        assert_eq!(Null.widen(Bool), Unified::Type(Bool));
        assert_eq!(Timestamp.widen(String), Unified::Type(String));
        assert_eq!(Mixed.widen(Number), Unified::Type(Mixed));
        assert_eq!(Object.widen(String), Unified::Ambiguous);
        assert_eq!(Array.widen(Object), Unified::Ambiguous);
        assert!(Number.widens_to(Mixed));
        assert!(!Mixed.widens_to(Number));
    }

    #[test]
    fn validate_rejects_alias_owned_twice() {
        let mut s = SchemaDefinition::new("app");
        s.fields.push(FieldDescriptor::new("level", FieldType::String, false).with_alias("lvl"));
        s.fields.push(FieldDescriptor::new("severity", FieldType::String, true).with_alias("lvl"));
        assert!(matches!(s.validate(), Err(SchemaError::AliasConflict { .. })));
    }

    #[test]
    fn validate_rejects_duplicate_and_orphans() {
        let mut s = SchemaDefinition::new("app");
        s.fields.push(FieldDescriptor::new("a", FieldType::String, false));
        s.fields.push(FieldDescriptor::new("a", FieldType::Number, false));
        assert_eq!(s.validate(), Err(SchemaError::DuplicateField("a".into())));

        let mut s = SchemaDefinition::new("app");
        s.fields.push(FieldDescriptor::new("a", FieldType::String, false));
        s.elements.insert("a".into(), SchemaDefinition::new("app/a[]"));
        assert_eq!(s.validate(), Err(SchemaError::OrphanElementSchema("a".into())));
    }

    #[test]
    fn regressions_flag_removal_and_narrowing_only() {
        let mut before = SchemaDefinition::new("app");
        before.fields.push(FieldDescriptor::new("code", FieldType::Number, false));
        before.fields.push(FieldDescriptor::new("msg", FieldType::Mixed, false));

        let mut after = before.clone();
        after.fields[0].field_type = FieldType::Mixed;
        after.fields[0].optional = true;
        after.fields.push(FieldDescriptor::new("host", FieldType::String, true));
        assert!(regressions(&before, &after).is_empty());

        after.fields[1].field_type = FieldType::String;
        after.fields.push(FieldDescriptor::new("region", FieldType::String, false));
        let bad = regressions(&before, &after);
        assert_eq!(bad.len(), 2);
        after.fields.retain(|f| f.path != "code");
        assert!(regressions(&before, &after)
            .iter()
            .any(|c| matches!(c, SchemaChange::FieldRemoved { field, .. } if field == "code")));
    }
}

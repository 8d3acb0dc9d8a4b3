use logdistill::config::ExtractionConfig;
use logdistill::error::ErrorKind;
use logdistill::events::{CollectingSink, Event};
use logdistill::extract::{ExtractError, ExtractionEngine, FieldValue};
use logdistill::infer::InferenceEngine;
use logdistill::normalize::NormalizationRules;
use logdistill::predicate::{Clause, Predicate};
use logdistill::reader::RawRecord;
use logdistill::schema::{FieldDescriptor, FieldType, SchemaDefinition};
use serde_json::{json, Value};
use std::sync::Arc;

fn records(values: Vec<Value>) -> Vec<RawRecord> {
    values.into_iter().enumerate().filter_map(|(i, v)| RawRecord::from_value(v, i + 1)).collect()
}

fn three_records() -> Vec<RawRecord> {
    records(vec![
        json!({"lvl": "ERR", "msg": "timeout"}),
        json!({"level": "ERR", "msg": "timeout", "code": 504}),
        json!({"lvl": "INFO", "msg": "ok"}),
    ])
}

#[test]
fn end_to_end_level_filter() {
    let recs = three_records();
    let schema = InferenceEngine::default().infer("app", &recs, None).schema;
    let predicate = Predicate::new().and(Clause::equals("level", "ERR"));
    let result = ExtractionEngine::default().extract(&recs, &schema, Some(&predicate)).unwrap();

    assert_eq!(result.columns, vec!["level", "msg", "code"]);
    assert_eq!(result.records.len(), 2);
    let first = &result.records[0];
    assert_eq!(first.source.line, 1);
    assert_eq!(first.get("level"), Some(&json!("ERR")));
    assert_eq!(first.fields["code"], FieldValue::Absent);
    let second = &result.records[1];
    assert_eq!(second.fields["code"], FieldValue::Present(json!(504)));

    assert_eq!(result.stats.scanned, 3);
    assert_eq!(result.stats.included, 2);
    assert_eq!(result.stats.filtered_out, 1);
    assert_eq!(result.stats.missing_required, 0);
}

#[test]
fn predicates_accept_aliases_and_text_syntax() {
    let recs = three_records();
    let schema = InferenceEngine::default().infer("app", &recs, None).schema;
    let predicate = Predicate::parse_all(&["lvl==ERR", "code in 500..599"]).unwrap();
    let result = ExtractionEngine::default().extract(&recs, &schema, Some(&predicate)).unwrap();
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].source.line, 2);

    let unknown = Predicate::parse_all(&["severity==ERR"]).unwrap();
    let err = ExtractionEngine::default().extract(&recs, &schema, Some(&unknown)).unwrap_err();
    assert!(matches!(err, ExtractError::UnknownField { ref field, .. } if field == "severity"));
}

#[test]
fn extraction_is_idempotent() {
    let recs = three_records();
    let schema = InferenceEngine::default().infer("app", &recs, None).schema;
    let engine = ExtractionEngine::default();
    let a = engine.extract(&recs, &schema, None).unwrap();
    let b = engine.extract(&recs, &schema, None).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.records.len(), 3);
}

#[test]
fn number_in_string_field_is_demoted() {
    let mut schema = SchemaDefinition::new("users");
    schema.fields.push(FieldDescriptor::new("user", FieldType::String, true));
    schema.fields.push(FieldDescriptor::new("id", FieldType::Number, false));
    let recs = records(vec![json!({"user": 42, "id": "7"}), json!({"user": "bob", "id": 8})]);

    let result = ExtractionEngine::default().extract(&recs, &schema, None).unwrap();
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.records[0].fields["user"], FieldValue::Absent);
    assert_eq!(result.records[0].get("id"), Some(&json!(7)));
    assert_eq!(result.records[1].get("user"), Some(&json!("bob")));
    assert_eq!(result.stats.coercion_demoted, 1);
    let issue = &result.stats.issues[0];
    assert_eq!(issue.kind, ErrorKind::CoercionDemoted);
    assert_eq!(issue.field.as_deref(), Some("user"));
    assert_eq!(issue.line, Some(1));
}

#[test]
fn demoted_required_field_excludes_the_record() {
    let mut schema = SchemaDefinition::new("users");
    schema.fields.push(FieldDescriptor::new("user", FieldType::String, false));
    let recs = records(vec![json!({"user": 42}), json!({"user": null}), json!({"user": "amy"})]);
    let result = ExtractionEngine::default().extract(&recs, &schema, None).unwrap();
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.stats.missing_required, 2);
    assert_eq!(result.stats.coercion_demoted, 1);
}

#[test]
fn timestamps_are_normalized_to_utc() {
    let mut schema = SchemaDefinition::new("t");
    schema.fields.push(FieldDescriptor::new("timestamp", FieldType::Timestamp, false));
    let recs = records(vec![
        json!({"ts": "2024-01-15T15:20:00+01:00"}),
        json!({"@timestamp": 1_705_328_400_000i64}),
    ]);
    let result = ExtractionEngine::default().extract(&recs, &schema, None).unwrap();
    assert_eq!(result.records[0].get("timestamp"), Some(&json!("2024-01-15T14:20:00Z")));
    assert_eq!(result.records[1].get("timestamp"), Some(&json!("2024-01-15T14:20:00Z")));
}

#[test]
fn alias_lookup_works_under_different_rules() {
    let mut schema = SchemaDefinition::new("app");
    schema.fields.push(FieldDescriptor::new("level", FieldType::String, false).with_alias("Severity"));
    let recs = records(vec![json!({"Severity": "WARN"})]);
    let engine = ExtractionEngine::new(NormalizationRules::none(), ExtractionConfig::default());
    let result = engine.extract(&recs, &schema, None).unwrap();
    assert_eq!(result.records[0].get("level"), Some(&json!("WARN")));
}

#[test]
fn field_selection_limits_columns_only() {
    let recs = three_records();
    let schema = InferenceEngine::default().infer("app", &recs, None).schema;
    let engine = ExtractionEngine::default().with_fields(["msg"]);
    let result = engine.extract(&recs, &schema, None).unwrap();
    assert_eq!(result.columns, vec!["msg"]);
    assert!(result.records.iter().all(|r| r.fields.len() == 1));

    let err = ExtractionEngine::default().with_fields(["nope"]).extract(&recs, &schema, None).unwrap_err();
    assert!(matches!(err, ExtractError::UnknownField { .. }));
}

#[test]
fn object_fields_are_structural() {
    let recs = records(vec![json!({"req": {"id": 1, "path": "/a"}})]);
    let schema = InferenceEngine::default().infer("app", &recs, None).schema;
    let result = ExtractionEngine::default().extract(&recs, &schema, None).unwrap();
    assert_eq!(result.columns, vec!["req.id", "req.path"]);
    assert_eq!(result.records[0].get("req.path"), Some(&json!("/a")));
}

#[test]
fn progress_and_finish_events() {
    let sink = Arc::new(CollectingSink::new());
    let recs = three_records();
    let schema = InferenceEngine::default().infer("app", &recs, None).schema;
    let engine = ExtractionEngine::new(NormalizationRules::default(), ExtractionConfig { progress_every: 2 })
        .with_events(sink.clone());
    engine.extract(&recs, &schema, None).unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], Event::ExtractionProgress { scanned: 2, included: 2 });
    assert!(matches!(&events[1], Event::ExtractionFinished { stats } if stats.included == 3));
}

use logdistill::chunk::{render_record, Budget, ChunkPlanner};
use logdistill::events::{CollectingSink, Event};
use logdistill::extract::{ExtractedRecord, ExtractionResult, FieldValue};
use logdistill::reader::Provenance;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn result_with(messages: Vec<String>) -> ExtractionResult {
    let records = messages
        .into_iter()
        .enumerate()
        .map(|(i, msg)| {
            let mut fields = BTreeMap::new();
            fields.insert("msg".to_string(), FieldValue::Present(json!(msg)));
            fields.insert("code".to_string(), FieldValue::Absent);
            ExtractedRecord {
                source: Provenance { file_id: 0, file: "app.log".into(), line: i + 1, element: None },
                fields,
            }
        })
        .collect();
    ExtractionResult {
        schema_id: "app".to_string(),
        schema_version: 1,
        columns: vec!["msg".to_string(), "code".to_string()],
        records,
        stats: Default::default(),
    }
}

#[test]
fn rendering_is_compact_and_skips_absent_fields() {
    let result = result_with(vec!["hello".to_string()]);
    let line = render_record(&result.records[0], &result.columns);
    assert_eq!(line, r#"{"msg":"hello","_source":"app.log:1"}"#);
}

#[test]
fn chunks_partition_the_result_within_budget() {
    let result = result_with((0..50).map(|i| format!("event number {i}")).collect());
    let budget = Budget::chars(300);
    let plan = ChunkPlanner::new().plan(&result, budget);

    assert!(plan.chunks.len() > 1);
    assert_eq!(plan.chunks[0].start, 0);
    assert_eq!(plan.chunks.last().unwrap().end, 50);
    for pair in plan.chunks.windows(2) {
        assert_eq!(pair[0].end, pair[1].start, "no gaps or overlaps");
    }
    for (i, c) in plan.chunks.iter().enumerate() {
        assert_eq!(c.index, i);
        assert!(!c.oversized);
        assert!(c.chars <= 300);
        assert_eq!(c.render(&result).chars().count(), c.chars);
    }
    assert_eq!(plan.oversized(), 0);
}

#[test]
fn planning_is_deterministic() {
    let result = result_with((0..40).map(|i| "x".repeat(i * 3)).collect());
    let a = ChunkPlanner::new().plan(&result, Budget::chars(200));
    let b = ChunkPlanner::new().plan(&result, Budget::chars(200));
    assert_eq!(a, b);
}

#[test]
fn oversized_record_gets_its_own_chunk() {
    let mut msgs: Vec<String> = vec!["a".into(), "b".into()];
    msgs.push("z".repeat(500));
    msgs.push("c".into());
    let result = result_with(msgs);
    let sink = Arc::new(CollectingSink::new());
    let plan = ChunkPlanner::new().with_events(sink.clone()).plan(&result, Budget::chars(120));

    let spans: Vec<(usize, usize, bool)> = plan.chunks.iter().map(|c| (c.start, c.end, c.oversized)).collect();
    assert_eq!(spans, vec![(0, 2, false), (2, 3, true), (3, 4, false)]);
    assert_eq!(sink.events(), vec![Event::ChunksPlanned { chunks: 3, oversized: 1, budget_chars: 120 }]);
}

#[test]
fn empty_result_has_no_chunks() {
    let plan = ChunkPlanner::new().plan(&result_with(Vec::new()), Budget::chars(100));
    assert!(plan.chunks.is_empty());
    assert!(plan.is_single_pass());
}

#[test]
fn small_result_is_single_pass() {
    let result = result_with(vec!["one".into(), "two".into()]);
    let plan = ChunkPlanner::new().plan(&result, Budget::from_context_tokens(4096));
    assert_eq!(plan.chunks.len(), 1);
    assert!(plan.is_single_pass());
}

#[test]
fn lone_oversized_record_is_not_single_pass() {
    let result = result_with(vec!["q".repeat(400)]);
    let plan = ChunkPlanner::new().plan(&result, Budget::chars(100));
    assert_eq!(plan.chunks.len(), 1);
    assert!(plan.chunks[0].oversized);
    assert!(!plan.is_single_pass());
}

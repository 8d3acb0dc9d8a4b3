use logdistill::config::ReaderConfig;
use logdistill::error::ErrorKind;
use logdistill::reader::{ReadError, RecordSource};
use std::fs;

fn write(dir: &std::path::Path, rel: &str, body: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body).unwrap();
}

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.jsonl", "{\"a\":1}\n{broken\n{\"a\":2}\ngarbage\n");
    write(dir.path(), "b/pretty.json", "{\n  \"level\": \"info\",\n  \"nested\": {\"x\": [1, 2]}\n}\n");
    write(dir.path(), "c.json", "[\n  {\"k\": 1},\n  {\"k\": 2}\n]\n");
    write(dir.path(), "empty.log", "");
    write(dir.path(), "notes.txt", "just some prose\nnothing structured here\n");
    write(dir.path(), "ignored.csv", "{\"never\": true}\n");
    dir
}

#[test]
fn walks_sorted_and_accepts_every_layout() {
    let dir = fixture();
    let src = RecordSource::open(dir.path(), &ReaderConfig::default()).unwrap();
    assert_eq!(src.files().len(), 5, "csv is filtered out");

    let mut it = src.records();
    let recs: Vec<_> = it.by_ref().collect();
    let report = it.into_report();

    assert_eq!(recs.len(), 5);
    assert_eq!(recs[0].fields["a"], 1);
    assert_eq!(recs[1].fields["a"], 2);
    assert_eq!(recs[1].source.line, 3);
    assert_eq!(recs[2].fields["level"], "info");
    assert_eq!(recs[2].source.line, 1);
    assert!(recs[2].fields["nested"].is_object());
    assert_eq!(recs[3].source.element, Some(0));
    assert_eq!(recs[4].source.element, Some(1));
    assert_eq!(recs[4].fields["k"], 2);
    assert!(recs.windows(2).all(|w| w[0].source.file_id <= w[1].source.file_id));

    assert_eq!(report.files_read, 5);
    assert_eq!(report.records, 5);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.unsupported_files, 2);
    let skipped_lines: Vec<_> = report
        .issues
        .iter()
        .filter(|i| i.kind == ErrorKind::ParseSkipped)
        .map(|i| i.line.unwrap())
        .collect();
    assert_eq!(skipped_lines, vec![2, 4]);
}

#[test]
fn unsupported_file_reported_exactly_once() {
    let dir = fixture();
    let src = RecordSource::open(dir.path(), &ReaderConfig::default()).unwrap();
    let mut it = src.records();
    it.by_ref().for_each(drop);
    let report = it.into_report();
    let notes: Vec<_> = report
        .issues
        .iter()
        .filter(|i| i.file.as_ref().map(|f| f.ends_with("notes.txt")).unwrap_or(false))
        .collect();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, ErrorKind::UnsupportedFile);
    assert_eq!(notes[0].detail, "no JSON content");
}

#[test]
fn records_restart_from_the_first_file() {
    let dir = fixture();
    let src = RecordSource::open(dir.path(), &ReaderConfig::default()).unwrap();
    let first: Vec<_> = src.records().collect();
    let second: Vec<_> = src.records().collect();
    assert_eq!(first, second);
    assert_eq!(src.sample(2), first[..2].to_vec());
}

#[test]
fn root_file_is_read_whatever_its_extension() {
    let dir = fixture();
    let src = RecordSource::open(dir.path().join("ignored.csv"), &ReaderConfig::default()).unwrap();
    let recs: Vec<_> = src.records().collect();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].fields["never"], true);
}

#[test]
fn missing_root_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RecordSource::open(dir.path().join("nope"), &ReaderConfig::default()).unwrap_err();
    assert!(matches!(err, ReadError::RootNotFound(_)));
}

#[test]
fn values_opening_in_column_zero_continue_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.json", "{\"items\":\n[1, 2],\n\"a\": 1}\n");
    write(dir.path(), "b.json", "[\n{\"k\": 1},\n{\"k\": 2}\n]\n");
    let src = RecordSource::open(dir.path(), &ReaderConfig::default()).unwrap();
    let mut it = src.records();
    let recs: Vec<_> = it.by_ref().collect();
    let report = it.into_report();

    assert_eq!(report.skipped, 0);
    assert_eq!(recs.len(), 3);
    assert_eq!(recs[0].fields["items"], serde_json::json!([1, 2]));
    assert_eq!(recs[0].fields["a"], 1);
    assert_eq!(recs[2].source.element, Some(1));
}

#[test]
fn truncated_lines_do_not_swallow_the_next_entry() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "cut.jsonl", "{\"a\": 1, \"b\": \"cut\n{\"c\": 2}\n{\"d\": 3,\n{\"e\": 4}\n");
    let src = RecordSource::open(dir.path(), &ReaderConfig::default()).unwrap();
    let mut it = src.records();
    let recs: Vec<_> = it.by_ref().collect();
    let report = it.into_report();

    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0].fields["c"], 2);
    assert_eq!(recs[1].source.line, 4);
    let skipped: Vec<_> = report.issues.iter().filter_map(|i| i.line).collect();
    assert_eq!(skipped, vec![1, 3]);
}

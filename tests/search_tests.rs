use logdistill::config::ReaderConfig;
use logdistill::reader::RecordSource;
use logdistill::search::{search, MatchMode, SearchQuery, MAX_PREVIEWS_PER_FILE};
use std::fs;

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("api.log"),
        "{\"msg\": \"DB timeout\", \"code\": 504}\n{\"msg\": \"ok\"}\n{\"msg\": \"db reconnect\"}\n",
    )
    .unwrap();
    fs::write(dir.path().join("worker.jsonl"), "{\"msg\": \"job started\"}\n{\"msg\": \"job timeout\"}\n").unwrap();
    fs::write(dir.path().join("quiet.json"), "{\"msg\": \"nothing to see\"}\n").unwrap();
    let noisy: String = (0..25).map(|i| format!("{{\"msg\": \"retry {i}\"}}\n")).collect();
    fs::write(dir.path().join("noisy.txt"), noisy).unwrap();
    dir
}

fn run(dir: &tempfile::TempDir, pattern: &str, mode: MatchMode, regex: bool, case_sensitive: bool) -> logdistill::SearchResult {
    let src = RecordSource::open(dir.path(), &ReaderConfig::default()).unwrap();
    let query = SearchQuery::new(pattern, mode, regex, case_sensitive).unwrap();
    search(&src, &query)
}

#[test]
fn keyword_search_splits_matched_and_unmatched_files() {
    let dir = fixture();
    let found = run(&dir, "timeout", MatchMode::Single, false, false);

    let files: Vec<_> = found.matched.iter().map(|f| f.file.file_name().unwrap().to_str().unwrap()).collect();
    assert_eq!(files, vec!["api.log", "worker.jsonl"]);
    assert_eq!(found.matched[0].matches.len(), 1);
    assert_eq!(found.matched[0].matches[0].line, 1);
    assert_eq!(found.matched[1].matches[0].line, 2);
    assert_eq!(found.matched[1].matches[0].text, "{\"msg\": \"job timeout\"}");
    assert_eq!(found.not_matched.len(), 2);
}

#[test]
fn case_sensitivity_is_a_flag() {
    let dir = fixture();
    assert_eq!(run(&dir, "db", MatchMode::Single, false, false).total_matches(), 2);
    assert_eq!(run(&dir, "db", MatchMode::Single, false, true).total_matches(), 1);
}

#[test]
fn all_and_any_modes() {
    let dir = fixture();
    let all = run(&dir, "db, timeout", MatchMode::All, false, false);
    assert_eq!(all.total_matches(), 1);
    assert_eq!(all.matched[0].matches[0].line, 1);

    let any = run(&dir, "reconnect,started", MatchMode::Any, false, false);
    assert_eq!(any.total_matches(), 2);
    assert_eq!(any.matched.len(), 2);
}

#[test]
fn regex_patterns_and_preview_cap() {
    let dir = fixture();
    let found = run(&dir, r"retry \d+", MatchMode::Single, true, false);
    assert_eq!(found.matched.len(), 1);
    let previews = &found.matched[0].matches;
    assert_eq!(previews.len(), MAX_PREVIEWS_PER_FILE);
    assert_eq!(previews.first().unwrap().line, 1);
    assert_eq!(previews.last().unwrap().line, 10);

    let code = run(&dir, r#""code": 5\d\d"#, MatchMode::Single, true, false);
    assert_eq!(code.total_matches(), 1);
}

#[test]
fn blank_pattern_finds_nothing() {
    let dir = fixture();
    let found = run(&dir, "   ", MatchMode::Any, false, false);
    assert!(found.matched.is_empty());
    assert!(found.not_matched.is_empty());
}

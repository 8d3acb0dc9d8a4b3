use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use logdistill::chunk::{Budget, ChunkPlanner};
use logdistill::config::Config;
use logdistill::events::{EventSink, TracingSink};
use logdistill::extract::{ExtractionEngine, ExtractionResult};
use logdistill::infer::InferenceEngine;
use logdistill::predicate::Predicate;
use logdistill::reader::RecordSource;
use logdistill::registry::SchemaRegistry;
use logdistill::search::{self, MatchMode, SearchQuery};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logdistill", version, about = "Schema inference, extraction and search for JSON logs")]
struct Cli {
    /// JSON config file; missing keys keep their defaults
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Directory holding one history file per schema
    #[arg(long = "registry", global = true, default_value = ".logdistill/schemas")]
    registry: PathBuf,

    /// Force pretty (or, with --compact, single-line) JSON output
    #[arg(long = "pretty", global = true, default_value_t = false)]
    pretty: bool,
    #[arg(long = "compact", global = true, default_value_t = false, conflicts_with = "pretty")]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Infer (or refine) a schema from a sample of a log file or directory
    Infer {
        source: PathBuf,
        #[arg(long = "id")]
        id: String,
        /// Records to sample (overrides config)
        #[arg(long = "sample")]
        sample: Option<usize>,
        /// Drop any stored versions and start over at version 1
        #[arg(long = "fresh", default_value_t = false)]
        fresh: bool,
    },
    /// List schemas, or show one
    Schemas {
        id: Option<String>,
        #[arg(long = "version")]
        version: Option<u32>,
        /// Every stored version of `id`
        #[arg(long = "history", default_value_t = false)]
        history: bool,
    },
    /// Remove a schema and its history
    Remove { id: String },
    /// Extract records matching a schema
    Extract {
        source: PathBuf,
        #[arg(long = "schema")]
        schema: String,
        /// Filter clause: f==v, f~v, f=~re, `f in a..b`. Repeat to AND.
        #[arg(long = "where")]
        clauses: Vec<String>,
        /// Output only these fields (canonical names or aliases)
        #[arg(long = "field")]
        fields: Vec<String>,
    },
    /// Search log lines for keywords or regexes
    Search {
        source: PathBuf,
        pattern: String,
        /// single, all (AND) or any (OR); all/any split the pattern on commas
        #[arg(long = "mode", default_value_t = MatchMode::Single)]
        mode: MatchMode,
        /// Treat patterns as regular expressions
        #[arg(long = "regex", default_value_t = false)]
        regex: bool,
        #[arg(long = "case-sensitive", default_value_t = false)]
        case_sensitive: bool,
    },
    /// Show how an extraction would be chunked for the insight service
    Plan {
        source: PathBuf,
        #[arg(long = "schema")]
        schema: String,
        #[arg(long = "where")]
        clauses: Vec<String>,
        #[arg(long = "budget-chars")]
        budget_chars: Option<usize>,
        #[arg(long = "context-tokens")]
        context_tokens: Option<usize>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("logdistill=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}

fn open_registry(dir: &Path, events: Arc<dyn EventSink>) -> anyhow::Result<SchemaRegistry> {
    let registry = SchemaRegistry::new().with_events(events);
    let loaded = registry
        .load_dir(dir)
        .with_context(|| format!("loading schema registry from {}", dir.display()))?;
    tracing::debug!(dir = %dir.display(), loaded, "registry loaded");
    Ok(registry)
}

fn run_extraction(
    cfg: &Config,
    registry: &SchemaRegistry,
    events: Arc<dyn EventSink>,
    source: &Path,
    schema_id: &str,
    clauses: &[String],
    fields: &[String],
) -> anyhow::Result<ExtractionResult> {
    let Some(schema) = registry.get(schema_id) else {
        bail!("unknown schema `{schema_id}`; run `logdistill infer --id {schema_id} <source>` first");
    };
    let predicate = if clauses.is_empty() { None } else { Some(Predicate::parse_all(clauses)?) };
    let mut engine = ExtractionEngine::new(cfg.normalization.clone(), cfg.extraction.clone()).with_events(events);
    if !fields.is_empty() {
        engine = engine.with_fields(fields.iter().cloned());
    }
    let src = RecordSource::open(source, &cfg.reader)?;
    let mut records = src.records();
    let result = engine.extract(&mut records, &schema, predicate.as_ref())?;
    let report = records.into_report();
    if report.skipped > 0 || report.unsupported_files > 0 {
        tracing::warn!(skipped = report.skipped, unsupported = report.unsupported_files, "some input was not usable");
    }
    Ok(result)
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(p) => Config::from_file(p)?,
        None => Config::default(),
    };
    let pretty = if cli.pretty {
        true
    } else if cli.compact {
        false
    } else {
        atty::is(atty::Stream::Stdout)
    };
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let registry = open_registry(&cli.registry, events.clone())?;

    match cli.command {
        Command::Infer { source, id, sample, fresh } => {
            let mut engine = InferenceEngine::new(cfg.normalization.clone(), &cfg.inference);
            if let Some(n) = sample {
                engine = engine.with_sample_limit(n);
            }
            if fresh {
                registry.remove(&id);
            }
            let src = RecordSource::open(&source, &cfg.reader)?;
            let records = src.sample(engine.sample_limit());
            if records.is_empty() {
                bail!("no JSON records found under {}", source.display());
            }
            let (registration, inference) = registry.refine(&id, &records, &engine)?;
            registry.save_dir(&cli.registry)?;
            print_json(
                &serde_json::json!({
                    "registration": registration,
                    "sampled": inference.sampled,
                    "ambiguous": inference.ambiguous,
                    "schema": inference.schema,
                }),
                pretty,
            )?;
        }
        Command::Schemas { id: None, .. } => {
            let summary: Vec<_> = registry
                .list()
                .into_iter()
                .map(|s| serde_json::json!({"id": s.id, "version": s.version, "fields": s.fields.len()}))
                .collect();
            print_json(&summary, pretty)?;
        }
        Command::Schemas { id: Some(id), version, history } => {
            if history {
                let Some(h) = registry.history(&id) else { bail!("unknown schema `{id}`") };
                print_json(&h, pretty)?;
            } else if let Some(v) = version {
                print_json(&registry.get_version(&id, v)?, pretty)?;
            } else {
                let Some(s) = registry.get(&id) else { bail!("unknown schema `{id}`") };
                print_json(&s, pretty)?;
            }
        }
        Command::Remove { id } => {
            if registry.remove(&id).is_none() {
                bail!("unknown schema `{id}`");
            }
            let path = cli.registry.join(format!("{}.json", logdistill::registry::safe_file_stem(&id)));
            if path.exists() {
                std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            }
            tracing::info!(schema = %id, "schema removed");
        }
        Command::Extract { source, schema, clauses, fields } => {
            let result = run_extraction(&cfg, &registry, events, &source, &schema, &clauses, &fields)?;
            print_json(&result, pretty)?;
        }
        Command::Search { source, pattern, mode, regex, case_sensitive } => {
            let query = SearchQuery::new(&pattern, mode, regex, case_sensitive)?;
            let src = RecordSource::open(&source, &cfg.reader)?;
            let found = search::search(&src, &query);
            tracing::info!(
                files = found.matched.len(),
                lines = found.total_matches(),
                "search matched"
            );
            print_json(&found, pretty)?;
        }
        Command::Plan { source, schema, clauses, budget_chars, context_tokens } => {
            let result = run_extraction(&cfg, &registry, events.clone(), &source, &schema, &clauses, &[])?;
            let budget = match (budget_chars, context_tokens) {
                (Some(n), _) => Budget::chars(n),
                (None, Some(ctx)) => Budget::from_context_tokens(ctx),
                (None, None) => cfg.chunking.budget(),
            };
            let plan = ChunkPlanner::new().with_events(events).plan(&result, budget);
            tracing::info!(
                chunks = plan.chunks.len(),
                chars = plan.total_chars(),
                single_pass = plan.is_single_pass(),
                "chunk plan ready"
            );
            print_json(&plan, pretty)?;
        }
    }
    Ok(())
}

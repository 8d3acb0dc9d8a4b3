pub mod error;
pub mod events;
pub mod config;
pub mod timestamp;
pub mod masking;
pub mod normalize;
pub mod reader;
pub mod schema;
pub mod infer;
pub mod registry;
pub mod predicate;
pub mod extract;
pub mod chunk;
pub mod insight;
pub mod pipeline;
pub mod search;

pub use chunk::{Budget, Chunk, ChunkPlan, ChunkPlanner};
pub use config::Config;
pub use error::{ErrorKind, Issue};
pub use events::{CollectingSink, Event, EventSink, NullSink, TracingSink};
pub use extract::{ExtractError, ExtractedRecord, ExtractionEngine, ExtractionResult, ExtractionStats, FieldValue};
pub use infer::{Inference, InferenceEngine};
pub use insight::{InsightReport, InsightService, ServiceError};
pub use normalize::NormalizationRules;
pub use pipeline::{CancellationToken, InsightPipeline, PipelineError, PipelineOutcome, RunState};
pub use predicate::{Clause, Predicate};
pub use reader::{RawRecord, RecordSource};
pub use registry::{RegistryError, SchemaRegistry};
pub use schema::{FieldDescriptor, FieldType, SchemaDefinition};
pub use search::{MatchMode, SearchQuery, SearchResult};

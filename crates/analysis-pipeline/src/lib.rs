//! Move-level game analysis: engine evaluations, highlights and tactics
//! tasks for stored games.

pub mod analysis;
pub mod config;
pub mod deep_pass;
pub mod engine;
pub mod error;
pub mod fast_pass;
pub mod lease;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod tactics;

pub use analysis::{classify, normalize_score, Category};
pub use config::{EngineSettings, PipelineConfig, RetryPolicy, Thresholds, WorkerConfig};
pub use engine::{
    Engine, EngineFactory, EnginePool, EngineRequest, EngineResponse, SearchLimits,
    StockfishFactory,
};
pub use error::PipelineError;
pub use model::{
    EvaluationResult, MoveHighlight, PassKind, PipelineStage, PipelineState, PipelineStatus,
    PvLine, Score, TacticsTask, TaskAnswer, TaskStatus,
};
pub use pipeline::{Pipeline, PipelineReport, ReanalyseOptions, RunOptions};
pub use store::{AnalysisStore, MemoryStore, PgStore};

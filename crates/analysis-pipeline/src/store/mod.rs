//! Storage interface consumed by the pipeline.
//!
//! Evaluations are keyed by (game, position index, pass) and highlights by
//! (game, ply); every write is an upsert so re-running a game overwrites
//! rather than appends.
//!
//! Methods return `impl Future + Send` so pipeline futures stay `Send` and
//! can be handed to `tokio::spawn`.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::future::Future;

use chess_core::MoveSequence;

use crate::error::PipelineError;
use crate::model::{
    EvaluationResult, MoveHighlight, NewTacticsTask, PipelineStatus, TacticsTask, TaskAnswer,
};

pub trait AnalysisStore: Send + Sync + 'static {
    /// Fails with `GameNotFound` for an unknown game.
    fn load_move_sequence(
        &self,
        game_id: i64,
    ) -> impl Future<Output = Result<MoveSequence, PipelineError>> + Send;

    /// Remove every evaluation and highlight of a game; tasks are untouched.
    fn clear_analysis(&self, game_id: i64) -> impl Future<Output = Result<(), PipelineError>> + Send;

    fn save_evaluation(
        &self,
        game_id: i64,
        evaluation: &EvaluationResult,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;

    /// Insert or replace the highlight at `(highlight.game_id, highlight.ply)`.
    fn upsert_highlight(
        &self,
        highlight: &MoveHighlight,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;

    fn delete_highlight(
        &self,
        game_id: i64,
        ply: u32,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;

    fn create_task(
        &self,
        task: &NewTacticsTask,
    ) -> impl Future<Output = Result<TacticsTask, PipelineError>> + Send;

    fn list_tasks(
        &self,
        game_id: i64,
    ) -> impl Future<Output = Result<Vec<TacticsTask>, PipelineError>> + Send;

    fn get_task(
        &self,
        task_id: i64,
    ) -> impl Future<Output = Result<Option<TacticsTask>, PipelineError>> + Send;

    /// Delete one task if it is still open; returns whether it was deleted.
    fn delete_task(&self, task_id: i64) -> impl Future<Output = Result<bool, PipelineError>> + Send;

    /// Delete a game's open tasks; answered tasks are kept.
    fn delete_open_tasks(&self, game_id: i64)
        -> impl Future<Output = Result<u64, PipelineError>> + Send;

    /// Store an answer and mark its task answered.
    fn record_answer(
        &self,
        answer: &TaskAnswer,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;

    fn set_pipeline_state(
        &self,
        game_id: i64,
        status: &PipelineStatus,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;

    fn pipeline_state(
        &self,
        game_id: i64,
    ) -> impl Future<Output = Result<Option<PipelineStatus>, PipelineError>> + Send;
}

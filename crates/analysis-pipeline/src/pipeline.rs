//! Per-game orchestration: fast pass, deep pass, tactics.
//!
//! Every stage commits its own rows before the next one starts, and the
//! game's state is written after each stage so a later failure never hides
//! earlier results.

use std::sync::Arc;

use chess_core::replay;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::deep_pass::DeepPassRunner;
use crate::engine::{EngineFactory, EnginePool};
use crate::error::PipelineError;
use crate::fast_pass::{FastPassRunner, Halt};
use crate::lease::{GameLease, GameLeases};
use crate::model::{PipelineStage, PipelineState, PipelineStatus, TaskAnswer};
use crate::store::AnalysisStore;
use crate::tactics::{verify_answer, TacticsGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Run the deep pass after the fast pass
    pub deep: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { deep: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReanalyseOptions {
    /// Delete the game's open tasks before regenerating
    pub clear_tasks: bool,
    pub deep: bool,
}

impl Default for ReanalyseOptions {
    fn default() -> Self {
        Self {
            clear_tasks: false,
            deep: true,
        }
    }
}

/// Summary of one completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub game_id: i64,
    pub state: PipelineState,
    pub plies: usize,
    pub missing_fast: u32,
    pub missing_deep: u32,
    pub highlights: usize,
    pub tasks_created: usize,
    pub tasks_removed: usize,
    /// Why the deep pass did not run to completion, if it did not
    pub deep_skipped: Option<String>,
}

pub struct Pipeline<S: AnalysisStore, F: EngineFactory> {
    store: Arc<S>,
    pool: Arc<EnginePool<F>>,
    config: Arc<PipelineConfig>,
    leases: Arc<GameLeases>,
}

impl<S: AnalysisStore, F: EngineFactory> Clone for Pipeline<S, F> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
            leases: self.leases.clone(),
        }
    }
}

impl<S: AnalysisStore, F: EngineFactory> Pipeline<S, F> {
    pub fn new(store: Arc<S>, pool: Arc<EnginePool<F>>, config: Arc<PipelineConfig>) -> Self {
        Self {
            store,
            pool,
            config,
            leases: Arc::new(GameLeases::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn pool(&self) -> &EnginePool<F> {
        &self.pool
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self, game_id: i64) -> bool {
        self.leases.is_held(game_id)
    }

    /// Analyse a game from scratch, overwriting earlier results.
    pub async fn run_analysis(
        &self,
        game_id: i64,
        options: RunOptions,
    ) -> Result<PipelineReport, PipelineError> {
        let lease = self.leases.acquire(game_id)?;
        self.run_leased(&lease, options).await
    }

    /// Run the game again from unanalyzed. Answered tasks are kept; open
    /// ones are dropped first when `clear_tasks` is set.
    pub async fn reanalyse(
        &self,
        game_id: i64,
        options: ReanalyseOptions,
    ) -> Result<PipelineReport, PipelineError> {
        let lease = self.leases.acquire(game_id)?;

        if options.clear_tasks {
            let removed = self.store.delete_open_tasks(game_id).await?;
            info!(game_id, removed, "Cleared open tasks");
        }

        self.run_leased(&lease, RunOptions { deep: options.deep })
            .await
    }

    /// Run in the background; the outcome is also visible through
    /// [`Pipeline::pipeline_state`].
    pub fn spawn_analysis(
        &self,
        game_id: i64,
        options: RunOptions,
    ) -> JoinHandle<Result<PipelineReport, PipelineError>> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run_analysis(game_id, options).await })
    }

    pub async fn pipeline_state(&self, game_id: i64) -> Result<PipelineStatus, PipelineError> {
        Ok(self
            .store
            .pipeline_state(game_id)
            .await?
            .unwrap_or_else(PipelineStatus::unanalyzed))
    }

    /// Ask a running analysis to stop at the next ply or position boundary.
    pub fn cancel(&self, game_id: i64) -> bool {
        let cancelled = self.leases.cancel(game_id);
        if cancelled {
            info!(game_id, "Cancellation requested");
        }
        cancelled
    }

    pub async fn verify_task_answer(
        &self,
        task_id: i64,
        proposed_move: &str,
    ) -> Result<TaskAnswer, PipelineError> {
        verify_answer(
            self.store.as_ref(),
            self.pool.as_ref(),
            &self.config,
            task_id,
            proposed_move,
        )
        .await
    }

    /// Quit every engine once in-flight searches are back.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn run_leased(
        &self,
        lease: &GameLease,
        options: RunOptions,
    ) -> Result<PipelineReport, PipelineError> {
        let game_id = lease.game_id();
        let cancel = lease.cancel_flag();
        let store = self.store.as_ref();
        let pool = self.pool.as_ref();
        let config = self.config.as_ref();

        let game = store.load_move_sequence(game_id).await?;
        let positions = match replay(&game.plies) {
            Ok(positions) => positions,
            Err(e) => {
                let e = PipelineError::from(e);
                error!(game_id, error = %e, "Move sequence does not replay");
                self.fail(game_id, PipelineStage::Fast, &e.to_string(), 0).await;
                return Err(e);
            }
        };
        info!(game_id, plies = game.len(), deep = options.deep, "Starting analysis");

        // Fast pass
        let fast = self
            .stage(game_id, PipelineStage::Fast, 0, async {
                // State first, then rows
                self.set_state(game_id, PipelineState::Unanalyzed, 0).await?;
                store.clear_analysis(game_id).await?;
                FastPassRunner::new(store, pool, config)
                    .run(game_id, &positions, cancel)
                    .await
            })
            .await?;
        let missing_fast = fast.missing.len() as u32;
        match fast.halted {
            Some(Halt::Cancelled) => {
                self.fail(game_id, PipelineStage::Fast, "cancelled", missing_fast).await;
                return Err(PipelineError::Cancelled(game_id));
            }
            Some(Halt::EngineDown(e)) => {
                error!(game_id, error = %e, "Engine unavailable, fast pass failed");
                self.fail(game_id, PipelineStage::Fast, &e.to_string(), missing_fast).await;
                return Err(e);
            }
            None => {}
        }
        self.set_state(game_id, PipelineState::FastDone, missing_fast).await?;

        let mut evaluations = fast.evaluations;
        let mut highlights = fast.highlights;
        let mut state = PipelineState::FastDone;
        let mut missing_deep = 0;

        // Deep pass
        let deep_skipped = if options.deep {
            let deep = self
                .stage(game_id, PipelineStage::Deep, missing_fast, async {
                    DeepPassRunner::new(store, pool, config)
                        .run(game_id, &positions, &mut evaluations, &mut highlights, cancel)
                        .await
                })
                .await?;
            missing_deep = deep.missing.len() as u32;

            match deep.halted {
                Some(Halt::Cancelled) => {
                    self.fail(game_id, PipelineStage::Deep, "cancelled", missing_fast + missing_deep)
                        .await;
                    return Err(PipelineError::Cancelled(game_id));
                }
                Some(Halt::EngineDown(e)) => {
                    warn!(game_id, error = %e, "Deep pass skipped, fast results stand");
                    Some(e.to_string())
                }
                None => {
                    state = PipelineState::DeepDone;
                    self.set_state(game_id, PipelineState::DeepDone, missing_fast + missing_deep)
                        .await?;
                    None
                }
            }
        } else {
            Some("fast-only run".to_string())
        };
        let missing = missing_fast + missing_deep;

        // Tactics
        if lease.is_cancelled() {
            self.fail(game_id, PipelineStage::Tactics, "cancelled", missing).await;
            return Err(PipelineError::Cancelled(game_id));
        }
        let tactics = self
            .stage(game_id, PipelineStage::Tactics, missing, async {
                TacticsGenerator::new(store, config)
                    .reconcile(game_id, &positions, &highlights, &evaluations)
                    .await
            })
            .await?;

        let report = PipelineReport {
            game_id,
            state,
            plies: game.len(),
            missing_fast,
            missing_deep,
            highlights: highlights.len(),
            tasks_created: tactics.created.len(),
            tasks_removed: tactics.removed.len(),
            deep_skipped,
        };
        info!(
            game_id,
            state = report.state.as_str(),
            highlights = report.highlights,
            tasks_created = report.tasks_created,
            missing,
            "Analysis finished"
        );
        Ok(report)
    }

    /// Await one stage, recording `Failed(stage)` if it errors.
    async fn stage<T>(
        &self,
        game_id: i64,
        stage: PipelineStage,
        missing: u32,
        work: impl std::future::Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        match work.await {
            Ok(value) => Ok(value),
            Err(e) => {
                error!(game_id, stage = stage.as_str(), error = %e, "Pipeline stage failed");
                self.fail(game_id, stage, &e.to_string(), missing).await;
                Err(e)
            }
        }
    }

    async fn set_state(
        &self,
        game_id: i64,
        state: PipelineState,
        missing: u32,
    ) -> Result<(), PipelineError> {
        self.store
            .set_pipeline_state(game_id, &PipelineStatus::new(state, missing))
            .await
    }

    /// Record a failure; a store error here is logged, the original error wins.
    async fn fail(&self, game_id: i64, stage: PipelineStage, reason: &str, missing: u32) {
        let state = PipelineState::Failed {
            stage,
            reason: reason.to_string(),
        };
        if let Err(e) = self.set_state(game_id, state, missing).await {
            warn!(game_id, error = %e, "Could not record failed state");
        }
    }
}

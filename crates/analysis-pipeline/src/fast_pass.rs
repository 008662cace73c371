//! Fast pass: one quick evaluation per position, classified move by move.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chess_core::Position;
use tracing::{debug, info, warn};

use crate::analysis::highlight_for;
use crate::config::PipelineConfig;
use crate::engine::{EngineFactory, EnginePool, EngineRequest};
use crate::error::PipelineError;
use crate::model::{EvaluationSet, MoveHighlight, PassKind};
use crate::store::AnalysisStore;

/// Why a pass stopped before its last position
#[derive(Debug)]
pub enum Halt {
    Cancelled,
    /// Retries exhausted on an engine-down error
    EngineDown(PipelineError),
}

#[derive(Debug)]
pub struct FastPassOutcome {
    pub evaluations: EvaluationSet,
    /// Current highlight per ply
    pub highlights: BTreeMap<u32, MoveHighlight>,
    /// Position indices left without an evaluation
    pub missing: Vec<u32>,
    pub halted: Option<Halt>,
}

pub struct FastPassRunner<'a, S, F: EngineFactory> {
    store: &'a S,
    pool: &'a EnginePool<F>,
    config: &'a PipelineConfig,
}

impl<'a, S: AnalysisStore, F: EngineFactory> FastPassRunner<'a, S, F> {
    pub fn new(store: &'a S, pool: &'a EnginePool<F>, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            pool,
            config,
        }
    }

    /// Evaluate `positions` in order and classify each ply as soon as both
    /// of its positions are known.
    ///
    /// Engine trouble on one position is recorded as missing and the walk
    /// goes on; only store errors are returned as `Err`.
    pub async fn run(
        &self,
        game_id: i64,
        positions: &[Position],
        cancel: &AtomicBool,
    ) -> Result<FastPassOutcome, PipelineError> {
        let limits = self.config.engine.fast;
        let thresholds = &self.config.thresholds;

        let mut evaluations = Vec::with_capacity(positions.len());
        let mut highlights = BTreeMap::new();
        let mut missing = Vec::new();
        let mut halted = None;

        info!(game_id, positions = positions.len(), "Starting fast pass");

        for position in positions {
            if cancel.load(Ordering::SeqCst) {
                info!(game_id, ply = position.index, "Fast pass cancelled");
                halted = Some(Halt::Cancelled);
                break;
            }

            let request = EngineRequest::new(position.fen.clone(), limits);
            let evaluation = match self.pool.evaluate(&request, &self.config.retry).await {
                Ok(response) => Some(response.into_evaluation(position.index, PassKind::Fast, &limits)),
                Err(e) if e.is_engine_down() => {
                    warn!(game_id, ply = position.index, error = %e, "Engine down, stopping fast pass");
                    halted = Some(Halt::EngineDown(e));
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!(game_id, ply = position.index, error = %e, "Evaluation failed, marking missing");
                    missing.push(position.index);
                    None
                }
                Err(e) => return Err(e),
            };

            if let Some(evaluation) = &evaluation {
                self.store.save_evaluation(game_id, evaluation).await?;
            }
            evaluations.push(evaluation);

            // Classify the move that led here
            let Some(played) = position.last_move.as_deref() else {
                continue;
            };
            let k = position.index as usize;
            let (Some(Some(before)), Some(Some(after))) = (evaluations.get(k - 1), evaluations.get(k))
            else {
                debug!(game_id, ply = position.index, "Skipping classification, evaluation missing");
                continue;
            };

            if let Some(highlight) =
                highlight_for(game_id, played, before, after, thresholds, PassKind::Fast)
            {
                debug!(
                    game_id,
                    ply = highlight.ply,
                    category = %highlight.category,
                    delta = highlight.eval_delta_cp,
                    "Provisional highlight"
                );
                self.store.upsert_highlight(&highlight).await?;
                highlights.insert(highlight.ply, highlight);
            }
        }

        // Positions never reached count as missing too
        missing.extend(positions.iter().skip(evaluations.len()).map(|p| p.index));

        info!(
            game_id,
            evaluated = evaluations.iter().flatten().count(),
            missing = missing.len(),
            highlights = highlights.len(),
            "Fast pass finished"
        );

        Ok(FastPassOutcome {
            evaluations: EvaluationSet::new(evaluations),
            highlights,
            missing,
            halted,
        })
    }
}

//! Deep pass: re-check flagged plies with more search and MultiPV.
//!
//! Only the positions around candidate plies are searched, each once, and
//! concurrently up to the pool size. A candidate with deep data on both
//! sides is regraded from deep data alone; the result replaces the fast
//! highlight or removes it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chess_core::Position;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::analysis::highlight_for;
use crate::config::PipelineConfig;
use crate::engine::{EngineFactory, EnginePool, EngineRequest};
use crate::error::PipelineError;
use crate::fast_pass::Halt;
use crate::model::{EvaluationResult, EvaluationSet, MoveHighlight, PassKind};
use crate::store::AnalysisStore;

#[derive(Debug, Default)]
pub struct DeepPassOutcome {
    /// Candidate plies regraded from deep data
    pub regraded: Vec<u32>,
    /// Regraded plies that lost their highlight
    pub removed: Vec<u32>,
    /// Candidate plies kept at their fast grading for lack of deep data
    pub missing: Vec<u32>,
    pub halted: Option<Halt>,
}

enum Searched {
    Done(EvaluationResult),
    Failed(PipelineError),
    Skipped,
}

pub struct DeepPassRunner<'a, S, F: EngineFactory> {
    store: &'a S,
    pool: &'a EnginePool<F>,
    config: &'a PipelineConfig,
}

impl<'a, S: AnalysisStore, F: EngineFactory> DeepPassRunner<'a, S, F> {
    pub fn new(store: &'a S, pool: &'a EnginePool<F>, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            pool,
            config,
        }
    }

    /// Plies whose current highlight is in a configured candidate category
    pub fn candidates(&self, highlights: &BTreeMap<u32, MoveHighlight>) -> Vec<u32> {
        highlights
            .values()
            .filter(|h| self.config.deep_candidates.contains(&h.category))
            .map(|h| h.ply)
            .collect()
    }

    async fn search(
        &self,
        ply: u32,
        fen: String,
        cancel: &AtomicBool,
        halt: &AtomicBool,
    ) -> (u32, Searched) {
        if cancel.load(Ordering::SeqCst) || halt.load(Ordering::SeqCst) {
            return (ply, Searched::Skipped);
        }
        let limits = self.config.engine.deep;
        let request = EngineRequest::new(fen, limits);
        match self.pool.evaluate(&request, &self.config.retry).await {
            Ok(response) => {
                let evaluation = response.into_evaluation(ply, PassKind::Deep, &limits);
                (ply, Searched::Done(evaluation))
            }
            Err(e) => {
                if e.is_engine_down() {
                    halt.store(true, Ordering::SeqCst);
                }
                (ply, Searched::Failed(e))
            }
        }
    }

    pub async fn run(
        &self,
        game_id: i64,
        positions: &[Position],
        evaluations: &mut EvaluationSet,
        highlights: &mut BTreeMap<u32, MoveHighlight>,
        cancel: &AtomicBool,
    ) -> Result<DeepPassOutcome, PipelineError> {
        let candidates = self.candidates(highlights);
        let mut outcome = DeepPassOutcome::default();
        if candidates.is_empty() {
            info!(game_id, "No deep pass candidates");
            return Ok(outcome);
        }

        let needed: BTreeSet<u32> = candidates.iter().flat_map(|&k| [k - 1, k]).collect();
        info!(
            game_id,
            candidates = candidates.len(),
            positions = needed.len(),
            "Starting deep pass"
        );

        let halt = AtomicBool::new(false);
        let targets: Vec<(u32, String)> = needed
            .iter()
            .filter_map(|&ply| positions.get(ply as usize))
            .map(|p| (p.index, p.fen.clone()))
            .collect();
        let searches = targets
            .into_iter()
            .map(|(ply, fen)| self.search(ply, fen, cancel, &halt));

        // In-flight searches always run to completion
        let results: Vec<(u32, Searched)> = stream::iter(searches)
            .buffer_unordered(self.pool.size())
            .collect()
            .await;

        let mut engine_down = None;
        for (ply, searched) in results {
            match searched {
                Searched::Done(evaluation) => {
                    self.store.save_evaluation(game_id, &evaluation).await?;
                    evaluations.insert_deep(evaluation);
                }
                Searched::Failed(e) if e.is_engine_down() => {
                    warn!(game_id, ply, error = %e, "Engine down during deep pass");
                    engine_down.get_or_insert(e);
                }
                Searched::Failed(e) if e.is_transient() => {
                    warn!(game_id, ply, error = %e, "Deep evaluation failed, keeping fast grading");
                }
                Searched::Failed(e) => return Err(e),
                Searched::Skipped => {}
            }
        }

        for &k in &candidates {
            let (Some(before), Some(after)) = (evaluations.deep(k - 1), evaluations.deep(k)) else {
                outcome.missing.push(k);
                continue;
            };
            let Some(played) = positions.get(k as usize).and_then(|p| p.last_move.as_deref()) else {
                continue;
            };

            let regraded = highlight_for(
                game_id,
                played,
                before,
                after,
                &self.config.thresholds,
                PassKind::Deep,
            );
            outcome.regraded.push(k);

            match regraded {
                Some(highlight) => {
                    debug!(
                        game_id,
                        ply = k,
                        category = %highlight.category,
                        delta = highlight.eval_delta_cp,
                        "Deep highlight"
                    );
                    self.store.upsert_highlight(&highlight).await?;
                    highlights.insert(k, highlight);
                }
                None => {
                    debug!(game_id, ply = k, "Deep pass cleared highlight");
                    self.store.delete_highlight(game_id, k).await?;
                    highlights.remove(&k);
                    outcome.removed.push(k);
                }
            }
        }

        outcome.halted = if cancel.load(Ordering::SeqCst) {
            Some(Halt::Cancelled)
        } else {
            engine_down.map(Halt::EngineDown)
        };

        info!(
            game_id,
            regraded = outcome.regraded.len(),
            removed = outcome.removed.len(),
            missing = outcome.missing.len(),
            "Deep pass finished"
        );
        Ok(outcome)
    }
}

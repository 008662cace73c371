//! Tactics tasks from final blunders, and engine-judged answers.

use std::collections::{BTreeMap, BTreeSet};

use chess_core::{apply_uci, Position};
use chrono::Utc;
use tracing::{debug, info};

use crate::analysis::{normalize_score, Category};
use crate::config::PipelineConfig;
use crate::engine::{EngineFactory, EnginePool, EngineRequest};
use crate::error::PipelineError;
use crate::model::{EvaluationSet, MoveHighlight, NewTacticsTask, TaskAnswer, TaskStatus};
use crate::store::AnalysisStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TacticsOutcome {
    pub created: Vec<i64>,
    pub removed: Vec<i64>,
}

pub struct TacticsGenerator<'a, S> {
    store: &'a S,
    config: &'a PipelineConfig,
}

impl<'a, S: AnalysisStore> TacticsGenerator<'a, S> {
    pub fn new(store: &'a S, config: &'a PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Bring the game's tasks in line with its final highlights: one task
    /// per blunder, anchored one ply earlier, and no open task left behind
    /// for a ply that is no longer a blunder.
    pub async fn reconcile(
        &self,
        game_id: i64,
        positions: &[Position],
        highlights: &BTreeMap<u32, MoveHighlight>,
        evaluations: &EvaluationSet,
    ) -> Result<TacticsOutcome, PipelineError> {
        let mut outcome = TacticsOutcome::default();

        let blunders: BTreeSet<u32> = highlights
            .values()
            .filter(|h| h.category == Category::Blunder)
            .map(|h| h.ply)
            .collect();

        let mut anchored = BTreeSet::new();
        for task in self.store.list_tasks(game_id).await? {
            if task.status == TaskStatus::Open && !blunders.contains(&task.source_ply) {
                if self.store.delete_task(task.id).await? {
                    debug!(game_id, task_id = task.id, ply = task.source_ply, "Removed stale task");
                    outcome.removed.push(task.id);
                }
                continue;
            }
            anchored.insert(task.anchor_ply);
        }

        for &ply in &blunders {
            // A first-move blunder has no earlier position of the mover's
            if ply < 2 {
                continue;
            }
            let anchor = ply - 1;
            if anchored.contains(&anchor) {
                continue;
            }
            let (Some(position), Some(evaluation)) =
                (positions.get(anchor as usize), evaluations.authoritative(anchor))
            else {
                debug!(game_id, ply, "No anchor evaluation, skipping task");
                continue;
            };

            let target_moves = evaluation.top_moves(self.config.thresholds.mate_score_cp);
            if target_moves.is_empty() {
                continue;
            }

            let task = self
                .store
                .create_task(&NewTacticsTask {
                    game_id,
                    source_ply: ply,
                    anchor_ply: anchor,
                    fen: position.fen.clone(),
                    target_moves,
                })
                .await?;
            debug!(game_id, task_id = task.id, anchor, "Created tactics task");
            anchored.insert(anchor);
            outcome.created.push(task.id);
        }

        info!(
            game_id,
            created = outcome.created.len(),
            removed = outcome.removed.len(),
            "Tactics tasks reconciled"
        );
        Ok(outcome)
    }
}

/// Judge a proposed answer to a task and record it.
///
/// A target move is correct outright. Any other legal move is searched
/// with deep limits and accepted if it loses no more than the near-best
/// tolerance against the anchor evaluation.
pub async fn verify_answer<S, F>(
    store: &S,
    pool: &EnginePool<F>,
    config: &PipelineConfig,
    task_id: i64,
    proposed_move: &str,
) -> Result<TaskAnswer, PipelineError>
where
    S: AnalysisStore,
    F: EngineFactory,
{
    let task = store
        .get_task(task_id)
        .await?
        .ok_or(PipelineError::TaskNotFound(task_id))?;

    let proposed_move = proposed_move.trim();
    let after_fen = apply_uci(&task.fen, proposed_move)?;

    let answer = if task.target_moves.iter().any(|m| m == proposed_move) {
        TaskAnswer {
            task_id,
            proposed_move: proposed_move.to_string(),
            is_correct: true,
            loss_cp: 0,
            engine_best_move: task.target_moves.first().cloned(),
            answered_at: Utc::now(),
        }
    } else {
        let limits = config.engine.deep;
        let mate_cp = config.thresholds.mate_score_cp;

        let anchor = pool
            .evaluate(&EngineRequest::new(task.fen.clone(), limits), &config.retry)
            .await?;
        let after = pool
            .evaluate(&EngineRequest::new(after_fen, limits), &config.retry)
            .await?;

        let best_cp = normalize_score(anchor.score(), mate_cp);
        let played_cp = -normalize_score(after.score(), mate_cp);
        let loss_cp = (best_cp - played_cp).max(0);

        TaskAnswer {
            task_id,
            proposed_move: proposed_move.to_string(),
            is_correct: loss_cp <= config.thresholds.near_best_tolerance_cp,
            loss_cp,
            engine_best_move: anchor.best_move,
            answered_at: Utc::now(),
        }
    };

    store.record_answer(&answer).await?;
    info!(
        task_id,
        proposed = %answer.proposed_move,
        correct = answer.is_correct,
        loss_cp = answer.loss_cp,
        "Recorded task answer"
    );
    Ok(answer)
}

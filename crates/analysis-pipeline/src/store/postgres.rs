//! Postgres store over the `chessbuddy` schema

use chess_core::{MoveSequence, Ply, Side};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::debug;

use super::AnalysisStore;
use crate::error::PipelineError;
use crate::model::{
    EvaluationResult, MoveHighlight, NewTacticsTask, PipelineStage, PipelineState, PipelineStatus,
    Score, TacticsTask, TaskAnswer, TaskStatus,
};

/// Engine name written next to every evaluation
const ENGINE_NAME: &str = "stockfish";

/// Owner of generated tasks and their answers (single-user deployment)
const TASK_OWNER_ID: i64 = 1;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    game_id: i64,
    source_ply: i32,
    position_ply: i32,
    fen: String,
    target_moves: Vec<String>,
    status: String,
    created_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_task(self) -> TacticsTask {
        TacticsTask {
            id: self.id,
            game_id: self.game_id,
            source_ply: self.source_ply.max(0) as u32,
            anchor_ply: self.position_ply.max(0) as u32,
            fen: self.fen,
            target_moves: self.target_moves,
            status: task_status_from_db(&self.status),
            created_at: self.created_at,
            answered_at: self.answered_at,
        }
    }
}

const TASK_COLUMNS: &str = "id, game_id, source_ply, position_ply, fen, target_moves, status, created_at, answered_at";

/// Tasks still waiting for an answer are stored as `new`.
fn task_status_from_db(status: &str) -> TaskStatus {
    match status {
        "new" => TaskStatus::Open,
        _ => TaskStatus::Answered,
    }
}

fn task_status_to_db(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Open => "new",
        TaskStatus::Answered => "answered",
    }
}

/// Move row an evaluation of position index `ply` hangs off: the move that
/// produced it, or the first move for the starting position.
fn anchor_move_ply(ply: u32) -> i32 {
    ply.max(1) as i32
}

/// Side to move at position index `ply` of a game from the standard start
fn eval_side(ply: u32) -> char {
    Side::of_ply(ply + 1).as_char()
}

fn score_columns(score: Score) -> (Option<i32>, Option<i32>) {
    match score {
        Score::Cp(cp) => (Some(cp), None),
        Score::Mate(n) => (None, Some(n)),
    }
}

fn state_from_row(
    state: &str,
    stage: Option<String>,
    reason: Option<String>,
) -> Result<PipelineState, PipelineError> {
    Ok(match state {
        "unanalyzed" => PipelineState::Unanalyzed,
        "fast_done" => PipelineState::FastDone,
        "deep_done" => PipelineState::DeepDone,
        "failed" => PipelineState::Failed {
            stage: stage
                .as_deref()
                .and_then(PipelineStage::parse)
                .unwrap_or(PipelineStage::Fast),
            reason: reason.unwrap_or_default(),
        },
        other => {
            return Err(PipelineError::Configuration(format!(
                "unknown analysis state '{other}' in database"
            )))
        }
    })
}

impl AnalysisStore for PgStore {
    async fn load_move_sequence(&self, game_id: i64) -> Result<MoveSequence, PipelineError> {
        let game: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT id, result FROM chessbuddy.games WHERE id = $1")
                .bind(game_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((_, result)) = game else {
            return Err(PipelineError::GameNotFound(game_id));
        };

        let rows: Vec<(i32, String, Option<String>)> = sqlx::query_as(
            "SELECT ply, side, COALESCE(uci, san) FROM chessbuddy.moves WHERE game_id = $1 ORDER BY ply",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;

        let mut plies = Vec::with_capacity(rows.len());
        for (ply, side, notation) in rows {
            let notation = notation.ok_or_else(|| {
                PipelineError::InvalidPosition(format!("game {game_id} ply {ply} has no move text"))
            })?;
            let side = if side.trim() == "b" { Side::Black } else { Side::White };
            plies.push(Ply {
                index: ply.max(0) as u32,
                notation,
                side,
            });
        }

        debug!(game_id, plies = plies.len(), "Loaded move sequence");
        Ok(MoveSequence {
            game_id,
            plies,
            result,
        })
    }

    async fn clear_analysis(&self, game_id: i64) -> Result<(), PipelineError> {
        sqlx::query("DELETE FROM chessbuddy.move_highlights WHERE game_id = $1")
            .bind(game_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM chessbuddy.engine_evaluations WHERE game_id = $1")
            .bind(game_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_evaluation(
        &self,
        game_id: i64,
        evaluation: &EvaluationResult,
    ) -> Result<(), PipelineError> {
        let (score_cp, score_mate) = score_columns(evaluation.score);
        let pv = evaluation
            .lines
            .first()
            .map(|l| l.moves.join(" "))
            .filter(|pv| !pv.is_empty());
        let lines: JsonValue = serde_json::to_value(&evaluation.lines)?;

        let saved = sqlx::query(
            r#"INSERT INTO chessbuddy.engine_evaluations (
                game_id, move_id, ply, pass, eval_side, score_cp, score_mate,
                best_move_uci, pv, lines, depth, movetime_ms, engine_name
            )
            SELECT $1, m.id, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            FROM chessbuddy.moves m
            WHERE m.game_id = $1 AND m.ply = $13
            ON CONFLICT (game_id, ply, pass) DO UPDATE SET
                move_id = EXCLUDED.move_id,
                eval_side = EXCLUDED.eval_side,
                score_cp = EXCLUDED.score_cp,
                score_mate = EXCLUDED.score_mate,
                best_move_uci = EXCLUDED.best_move_uci,
                pv = EXCLUDED.pv,
                lines = EXCLUDED.lines,
                depth = EXCLUDED.depth,
                movetime_ms = EXCLUDED.movetime_ms,
                created_at = NOW()"#,
        )
        .bind(game_id)
        .bind(evaluation.ply as i32)
        .bind(evaluation.pass.as_str())
        .bind(eval_side(evaluation.ply).to_string())
        .bind(score_cp)
        .bind(score_mate)
        .bind(evaluation.best_move.as_deref())
        .bind(pv)
        .bind(&lines)
        .bind(evaluation.depth.map(|d| d as i32))
        .bind(evaluation.movetime_ms as i64)
        .bind(ENGINE_NAME)
        .bind(anchor_move_ply(evaluation.ply))
        .execute(&self.pool)
        .await?;

        if saved.rows_affected() == 0 {
            // A game without moves has only its starting position
            debug!(game_id, ply = evaluation.ply, "No move row for evaluation, not stored");
        }

        Ok(())
    }

    async fn upsert_highlight(&self, highlight: &MoveHighlight) -> Result<(), PipelineError> {
        let result = sqlx::query(
            r#"INSERT INTO chessbuddy.move_highlights (
                game_id, move_id, category_id, ply, played_move_uci,
                eval_before_cp, eval_after_cp, eval_delta_cp, created_by_model
            )
            SELECT $1, m.id, c.id, $2, $4, $5, $6, $7, $8
            FROM chessbuddy.move_categories c
            LEFT JOIN chessbuddy.moves m ON m.game_id = $1 AND m.ply = $2
            WHERE c.key = $3
            ON CONFLICT (game_id, ply) DO UPDATE SET
                move_id = EXCLUDED.move_id,
                category_id = EXCLUDED.category_id,
                played_move_uci = EXCLUDED.played_move_uci,
                eval_before_cp = EXCLUDED.eval_before_cp,
                eval_after_cp = EXCLUDED.eval_after_cp,
                eval_delta_cp = EXCLUDED.eval_delta_cp,
                created_by_model = EXCLUDED.created_by_model,
                created_at = NOW()"#,
        )
        .bind(highlight.game_id)
        .bind(highlight.ply as i32)
        .bind(highlight.category.as_str())
        .bind(&highlight.played_move)
        .bind(highlight.eval_before_cp)
        .bind(highlight.eval_after_cp)
        .bind(highlight.eval_delta_cp)
        .bind(format!("{ENGINE_NAME}-{}", highlight.source.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Configuration(format!(
                "move category '{}' is not seeded",
                highlight.category
            )));
        }
        Ok(())
    }

    async fn delete_highlight(&self, game_id: i64, ply: u32) -> Result<(), PipelineError> {
        sqlx::query("DELETE FROM chessbuddy.move_highlights WHERE game_id = $1 AND ply = $2")
            .bind(game_id)
            .bind(ply as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_task(&self, task: &NewTacticsTask) -> Result<TacticsTask, PipelineError> {
        let row: TaskRow = sqlx::query_as(&format!(
            r#"INSERT INTO chessbuddy.tactics_tasks (
                user_id, game_id, move_id, source_highlight_id, source_ply, position_ply,
                fen, target_moves, category_id, status
            )
            VALUES (
                $7, $1,
                (SELECT id FROM chessbuddy.moves WHERE game_id = $1 AND ply = $2),
                (SELECT id FROM chessbuddy.move_highlights WHERE game_id = $1 AND ply = $2),
                $2, $3, $4, $5,
                (SELECT id FROM chessbuddy.move_categories WHERE key = 'blunder'),
                $6
            )
            RETURNING {TASK_COLUMNS}"#
        ))
        .bind(task.game_id)
        .bind(task.source_ply as i32)
        .bind(task.anchor_ply as i32)
        .bind(&task.fen)
        .bind(&task.target_moves)
        .bind(task_status_to_db(TaskStatus::Open))
        .bind(TASK_OWNER_ID)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_task())
    }

    async fn list_tasks(&self, game_id: i64) -> Result<Vec<TacticsTask>, PipelineError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM chessbuddy.tactics_tasks WHERE game_id = $1 ORDER BY id"
        ))
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TacticsTask>, PipelineError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM chessbuddy.tactics_tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TaskRow::into_task))
    }

    async fn delete_task(&self, task_id: i64) -> Result<bool, PipelineError> {
        let result = sqlx::query("DELETE FROM chessbuddy.tactics_tasks WHERE id = $1 AND status = $2")
            .bind(task_id)
            .bind(task_status_to_db(TaskStatus::Open))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_open_tasks(&self, game_id: i64) -> Result<u64, PipelineError> {
        let result =
            sqlx::query("DELETE FROM chessbuddy.tactics_tasks WHERE game_id = $1 AND status = $2")
                .bind(game_id)
                .bind(task_status_to_db(TaskStatus::Open))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn record_answer(&self, answer: &TaskAnswer) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE chessbuddy.tactics_tasks SET status = $2, answered_at = $3 WHERE id = $1",
        )
        .bind(answer.task_id)
        .bind(task_status_to_db(TaskStatus::Answered))
        .bind(answer.answered_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PipelineError::TaskNotFound(answer.task_id));
        }

        sqlx::query(
            r#"INSERT INTO chessbuddy.tactics_responses (
                task_id, user_id, proposed_move_uci, evaluated_by_engine, is_correct,
                score_cp_delta, engine_best_move_uci, created_at
            ) VALUES ($1, $2, $3, TRUE, $4, $5, $6, $7)"#,
        )
        .bind(answer.task_id)
        .bind(TASK_OWNER_ID)
        .bind(&answer.proposed_move)
        .bind(answer.is_correct)
        .bind(-answer.loss_cp)
        .bind(answer.engine_best_move.as_deref())
        .bind(answer.answered_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_pipeline_state(
        &self,
        game_id: i64,
        status: &PipelineStatus,
    ) -> Result<(), PipelineError> {
        let (stage, reason) = match &status.state {
            PipelineState::Failed { stage, reason } => (Some(stage.as_str()), Some(reason.as_str())),
            _ => (None, None),
        };

        sqlx::query(
            r#"INSERT INTO chessbuddy.analysis_state (
                game_id, state, failed_stage, failure_reason, missing_evaluations, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (game_id) DO UPDATE SET
                state = EXCLUDED.state,
                failed_stage = EXCLUDED.failed_stage,
                failure_reason = EXCLUDED.failure_reason,
                missing_evaluations = EXCLUDED.missing_evaluations,
                updated_at = EXCLUDED.updated_at"#,
        )
        .bind(game_id)
        .bind(status.state.as_str())
        .bind(stage)
        .bind(reason)
        .bind(status.missing_evaluations as i32)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pipeline_state(&self, game_id: i64) -> Result<Option<PipelineStatus>, PipelineError> {
        let row: Option<(String, Option<String>, Option<String>, i32, DateTime<Utc>)> =
            sqlx::query_as(
                r#"SELECT state, failed_stage, failure_reason, missing_evaluations, updated_at
                FROM chessbuddy.analysis_state WHERE game_id = $1"#,
            )
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(state, stage, reason, missing, updated_at)| {
            Ok(PipelineStatus {
                state: state_from_row(&state, stage, reason)?,
                missing_evaluations: missing.max(0) as u32,
                updated_at,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_mapping() {
        assert_eq!(task_status_from_db("new"), TaskStatus::Open);
        assert_eq!(task_status_from_db("answered"), TaskStatus::Answered);
        assert_eq!(task_status_to_db(TaskStatus::Open), "new");
    }

    #[test]
    fn test_start_position_hangs_off_first_move() {
        assert_eq!(anchor_move_ply(0), 1);
        assert_eq!(anchor_move_ply(1), 1);
        assert_eq!(anchor_move_ply(7), 7);
    }

    #[test]
    fn test_eval_side_follows_position_index() {
        assert_eq!(eval_side(0), 'w');
        assert_eq!(eval_side(1), 'b');
        assert_eq!(eval_side(2), 'w');
    }

    #[test]
    fn test_state_from_row() {
        assert_eq!(state_from_row("deep_done", None, None).unwrap(), PipelineState::DeepDone);
        assert_eq!(
            state_from_row("failed", Some("deep".into()), Some("cancelled".into())).unwrap(),
            PipelineState::Failed {
                stage: PipelineStage::Deep,
                reason: "cancelled".into()
            }
        );
        assert!(state_from_row("bogus", None, None).is_err());
    }
}

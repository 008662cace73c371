//! In-process store for tests and local runs

use std::collections::{BTreeMap, HashMap};

use chess_core::MoveSequence;
use chrono::Utc;
use tokio::sync::RwLock;

use super::AnalysisStore;
use crate::error::PipelineError;
use crate::model::{
    EvaluationResult, MoveHighlight, NewTacticsTask, PassKind, PipelineStatus, TacticsTask,
    TaskAnswer, TaskStatus,
};

#[derive(Default)]
struct State {
    games: HashMap<i64, MoveSequence>,
    evaluations: BTreeMap<(i64, u32, PassKind), EvaluationResult>,
    highlights: BTreeMap<(i64, u32), MoveHighlight>,
    tasks: BTreeMap<i64, TacticsTask>,
    answers: Vec<TaskAnswer>,
    states: HashMap<i64, PipelineStatus>,
    next_task_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_game(&self, game: MoveSequence) {
        self.state.write().await.games.insert(game.game_id, game);
    }

    /// Evaluations of a game ordered by (ply, pass)
    pub async fn evaluations(&self, game_id: i64) -> Vec<EvaluationResult> {
        self.state
            .read()
            .await
            .evaluations
            .range((game_id, 0, PassKind::Fast)..=(game_id, u32::MAX, PassKind::Deep))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Highlights of a game ordered by ply
    pub async fn highlights(&self, game_id: i64) -> Vec<MoveHighlight> {
        self.state
            .read()
            .await
            .highlights
            .range((game_id, 0)..=(game_id, u32::MAX))
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub async fn tasks(&self, game_id: i64) -> Vec<TacticsTask> {
        self.state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.game_id == game_id)
            .cloned()
            .collect()
    }

    pub async fn answers(&self, task_id: i64) -> Vec<TaskAnswer> {
        self.state
            .read()
            .await
            .answers
            .iter()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl AnalysisStore for MemoryStore {
    async fn load_move_sequence(&self, game_id: i64) -> Result<MoveSequence, PipelineError> {
        self.state
            .read()
            .await
            .games
            .get(&game_id)
            .cloned()
            .ok_or(PipelineError::GameNotFound(game_id))
    }

    async fn clear_analysis(&self, game_id: i64) -> Result<(), PipelineError> {
        let mut state = self.state.write().await;
        state.evaluations.retain(|(g, _, _), _| *g != game_id);
        state.highlights.retain(|(g, _), _| *g != game_id);
        Ok(())
    }

    async fn save_evaluation(
        &self,
        game_id: i64,
        evaluation: &EvaluationResult,
    ) -> Result<(), PipelineError> {
        self.state
            .write()
            .await
            .evaluations
            .insert((game_id, evaluation.ply, evaluation.pass), evaluation.clone());
        Ok(())
    }

    async fn upsert_highlight(&self, highlight: &MoveHighlight) -> Result<(), PipelineError> {
        self.state
            .write()
            .await
            .highlights
            .insert((highlight.game_id, highlight.ply), highlight.clone());
        Ok(())
    }

    async fn delete_highlight(&self, game_id: i64, ply: u32) -> Result<(), PipelineError> {
        self.state.write().await.highlights.remove(&(game_id, ply));
        Ok(())
    }

    async fn create_task(&self, task: &NewTacticsTask) -> Result<TacticsTask, PipelineError> {
        let mut state = self.state.write().await;
        state.next_task_id += 1;
        let created = TacticsTask {
            id: state.next_task_id,
            game_id: task.game_id,
            source_ply: task.source_ply,
            anchor_ply: task.anchor_ply,
            fen: task.fen.clone(),
            target_moves: task.target_moves.clone(),
            status: TaskStatus::Open,
            created_at: Utc::now(),
            answered_at: None,
        };
        state.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn list_tasks(&self, game_id: i64) -> Result<Vec<TacticsTask>, PipelineError> {
        Ok(self.tasks(game_id).await)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TacticsTask>, PipelineError> {
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }

    async fn delete_task(&self, task_id: i64) -> Result<bool, PipelineError> {
        let mut state = self.state.write().await;
        let open = matches!(
            state.tasks.get(&task_id),
            Some(t) if t.status == TaskStatus::Open
        );
        if open {
            state.tasks.remove(&task_id);
        }
        Ok(open)
    }

    async fn delete_open_tasks(&self, game_id: i64) -> Result<u64, PipelineError> {
        let mut state = self.state.write().await;
        let before = state.tasks.len();
        state
            .tasks
            .retain(|_, t| t.game_id != game_id || t.status != TaskStatus::Open);
        Ok((before - state.tasks.len()) as u64)
    }

    async fn record_answer(&self, answer: &TaskAnswer) -> Result<(), PipelineError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&answer.task_id)
            .ok_or(PipelineError::TaskNotFound(answer.task_id))?;
        task.status = TaskStatus::Answered;
        task.answered_at = Some(answer.answered_at);
        state.answers.push(answer.clone());
        Ok(())
    }

    async fn set_pipeline_state(
        &self,
        game_id: i64,
        status: &PipelineStatus,
    ) -> Result<(), PipelineError> {
        self.state
            .write()
            .await
            .states
            .insert(game_id, status.clone());
        Ok(())
    }

    async fn pipeline_state(&self, game_id: i64) -> Result<Option<PipelineStatus>, PipelineError> {
        Ok(self.state.read().await.states.get(&game_id).cloned())
    }
}

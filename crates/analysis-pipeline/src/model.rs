//! Records produced by the pipeline

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::Category;

/// Engine score from the side-to-move perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Score {
    Cp(i32),
    /// Mate in N (positive = side to move mates, 0 = side to move is mated)
    Mate(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassKind {
    Fast,
    Deep,
}

impl PassKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PassKind::Fast => "fast",
            PassKind::Deep => "deep",
        }
    }
}

/// A single ranked line from MultiPV analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvLine {
    /// 1-based MultiPV rank
    pub rank: u32,
    pub score: Score,
    pub moves: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Position index: 0 = start, k = after ply k
    pub ply: u32,
    pub score: Score,
    pub best_move: Option<String>,
    /// Ranked principal variations, best first
    pub lines: Vec<PvLine>,
    pub depth: Option<u32>,
    pub movetime_ms: u64,
    pub pass: PassKind,
}

impl EvaluationResult {
    /// Moves whose line scores the same as the top line once normalised.
    pub fn top_moves(&self, mate_score_cp: i32) -> Vec<String> {
        let Some(top) = self.lines.first() else {
            return self.best_move.iter().cloned().collect();
        };
        let top_cp = crate::analysis::normalize_score(top.score, mate_score_cp);

        let mut moves: Vec<String> = Vec::new();
        for line in &self.lines {
            if crate::analysis::normalize_score(line.score, mate_score_cp) != top_cp {
                continue;
            }
            if let Some(first) = line.moves.first() {
                if !moves.contains(first) {
                    moves.push(first.clone());
                }
            }
        }
        if moves.is_empty() {
            moves.extend(self.best_move.iter().cloned());
        }
        moves
    }
}

/// Evaluations gathered during one run, indexed by position.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSet {
    fast: Vec<Option<EvaluationResult>>,
    deep: BTreeMap<u32, EvaluationResult>,
}

impl EvaluationSet {
    pub fn new(fast: Vec<Option<EvaluationResult>>) -> Self {
        Self {
            fast,
            deep: BTreeMap::new(),
        }
    }

    pub fn fast(&self, ply: u32) -> Option<&EvaluationResult> {
        self.fast.get(ply as usize).and_then(Option::as_ref)
    }

    pub fn deep(&self, ply: u32) -> Option<&EvaluationResult> {
        self.deep.get(&ply)
    }

    pub fn insert_deep(&mut self, evaluation: EvaluationResult) {
        self.deep.insert(evaluation.ply, evaluation);
    }

    /// Deep evaluation if there is one, else fast
    pub fn authoritative(&self, ply: u32) -> Option<&EvaluationResult> {
        self.deep(ply).or_else(|| self.fast(ply))
    }
}

/// A classified notable move; at most one per (game, ply)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveHighlight {
    pub game_id: i64,
    pub ply: u32,
    pub category: Category,
    pub played_move: String,
    pub eval_before_cp: i32,
    pub eval_after_cp: i32,
    /// Mover's perspective, negative = loss
    pub eval_delta_cp: i32,
    pub source: PassKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Answered,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Answered => "answered",
        }
    }
}

/// Task as requested by the generator, before the store assigns an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTacticsTask {
    pub game_id: i64,
    /// Ply of the blunder this task was derived from
    pub source_ply: u32,
    /// Always `source_ply - 1`
    pub anchor_ply: u32,
    pub fen: String,
    pub target_moves: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TacticsTask {
    pub id: i64,
    pub game_id: i64,
    pub source_ply: u32,
    pub anchor_ply: u32,
    pub fen: String,
    pub target_moves: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

/// A user's answer to a task, as judged by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAnswer {
    pub task_id: i64,
    pub proposed_move: String,
    pub is_correct: bool,
    /// Loss versus the engine's best line, mover's perspective (0 = as good)
    pub loss_cp: i32,
    pub engine_best_move: Option<String>,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Fast,
    Deep,
    Tactics,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Fast => "fast",
            PipelineStage::Deep => "deep",
            PipelineStage::Tactics => "tactics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(PipelineStage::Fast),
            "deep" => Some(PipelineStage::Deep),
            "tactics" => Some(PipelineStage::Tactics),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Unanalyzed,
    FastDone,
    DeepDone,
    /// Committed results up to the failing stage are kept
    Failed { stage: PipelineStage, reason: String },
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Unanalyzed => "unanalyzed",
            PipelineState::FastDone => "fast_done",
            PipelineState::DeepDone => "deep_done",
            PipelineState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    #[serde(flatten)]
    pub state: PipelineState,
    /// Evaluations that could not be obtained in the last run
    pub missing_evaluations: u32,
    pub updated_at: DateTime<Utc>,
}

impl PipelineStatus {
    pub fn new(state: PipelineState, missing_evaluations: u32) -> Self {
        Self {
            state,
            missing_evaluations,
            updated_at: Utc::now(),
        }
    }

    pub fn unanalyzed() -> Self {
        Self::new(PipelineState::Unanalyzed, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with_lines(lines: Vec<PvLine>) -> EvaluationResult {
        EvaluationResult {
            ply: 4,
            score: lines[0].score,
            best_move: lines[0].moves.first().cloned(),
            lines,
            depth: Some(18),
            movetime_ms: 400,
            pass: PassKind::Deep,
        }
    }

    #[test]
    fn test_top_moves_collects_equal_lines() {
        let eval = eval_with_lines(vec![
            PvLine { rank: 1, score: Score::Cp(120), moves: vec!["d1h5".into(), "g7g6".into()] },
            PvLine { rank: 2, score: Score::Cp(120), moves: vec!["f3g5".into()] },
            PvLine { rank: 3, score: Score::Cp(40), moves: vec!["e1g1".into()] },
        ]);
        assert_eq!(eval.top_moves(10_000), vec!["d1h5", "f3g5"]);
    }

    #[test]
    fn test_top_moves_falls_back_to_best_move() {
        let mut eval = eval_with_lines(vec![PvLine {
            rank: 1,
            score: Score::Mate(2),
            moves: vec![],
        }]);
        eval.best_move = Some("h5f7".into());
        assert_eq!(eval.top_moves(10_000), vec!["h5f7"]);
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let status = PipelineState::Failed {
            stage: PipelineStage::Fast,
            reason: "engine down".into(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["stage"], "fast");
    }
}

//! Engine oracle: request/response contract, UCI process adapter,
//! restartable sessions and the bounded session pool.

mod pool;
mod session;
mod stockfish;

pub use pool::{EnginePool, SessionGuard};
pub use session::EngineSession;
pub use stockfish::{StockfishEngine, StockfishFactory};

use std::future::Future;

use crate::error::PipelineError;
use crate::model::{EvaluationResult, PassKind, PvLine, Score};

/// Search effort for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    pub movetime_ms: u64,
    pub depth: Option<u32>,
    pub multipv: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    pub fen: String,
    pub limits: SearchLimits,
}

impl EngineRequest {
    pub fn new(fen: impl Into<String>, limits: SearchLimits) -> Self {
        Self {
            fen: fen.into(),
            limits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    /// Ranked lines, best first; never empty on success
    pub lines: Vec<PvLine>,
    /// `None` when the side to move has no legal move
    pub best_move: Option<String>,
    pub depth: Option<u32>,
}

impl EngineResponse {
    pub fn score(&self) -> Score {
        self.lines.first().map(|l| l.score).unwrap_or(Score::Cp(0))
    }

    /// Record this answer as the evaluation of position `ply`.
    pub fn into_evaluation(self, ply: u32, pass: PassKind, limits: &SearchLimits) -> EvaluationResult {
        let score = self.score();
        let best_move = self
            .best_move
            .or_else(|| self.lines.first().and_then(|l| l.moves.first().cloned()));
        EvaluationResult {
            ply,
            score,
            best_move,
            lines: self.lines,
            depth: self.depth,
            movetime_ms: limits.movetime_ms,
            pass,
        }
    }
}

/// One running engine that answers search requests.
pub trait Engine: Send + 'static {
    fn evaluate(
        &mut self,
        request: &EngineRequest,
    ) -> impl Future<Output = Result<EngineResponse, PipelineError>> + Send;

    /// Ask the engine to exit; failures are ignored.
    fn quit(&mut self) -> impl Future<Output = ()> + Send;
}

/// Starts engine processes for sessions.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: Engine;

    /// Fails with `EngineUnavailable` if the engine cannot be started.
    fn spawn(&self) -> impl Future<Output = Result<Self::Engine, PipelineError>> + Send;
}

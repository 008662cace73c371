//! Pipeline error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine timeout: {0}")]
    EngineTimeout(String),

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Engine pool exhausted: none of {0} sessions has a running engine")]
    EnginePoolExhausted(usize),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Game not found: {0}")]
    GameNotFound(i64),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Analysis already in progress for game {0}")]
    AnalysisInProgress(i64),

    #[error("Analysis cancelled for game {0}")]
    Cancelled(i64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("Secrets Manager error: {0}")]
    SecretsManager(String),
}

impl PipelineError {
    /// One slow or broken search; retried, then recorded as missing data.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::EngineTimeout(_) | PipelineError::EngineFailure(_)
        )
    }

    /// The engine subsystem cannot serve requests; retried, then escalated.
    pub fn is_engine_down(&self) -> bool {
        matches!(
            self,
            PipelineError::EngineUnavailable(_) | PipelineError::EnginePoolExhausted(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.is_transient() || self.is_engine_down()
    }
}

impl From<chess_core::ReplayError> for PipelineError {
    fn from(e: chess_core::ReplayError) -> Self {
        PipelineError::InvalidPosition(e.to_string())
    }
}

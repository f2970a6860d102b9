//! Engine error taxonomy.
//!
//! Every per-task failure is recovered inside the engine by the next tier;
//! callers only ever see one of these when all tiers are exhausted, when the
//! payload is rejected up front, or when the engine is shutting down.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("initialization failed: {reason}")]
    InitializationFailure { reason: String },

    #[error("worker spawn attempt {attempt} timed out after {timeout_ms}ms")]
    WorkerSpawnTimeout { attempt: usize, timeout_ms: u64 },

    #[error("worker {worker} lost: {reason}")]
    WorkerLost { worker: u64, reason: String },

    #[error("task {task} timed out after {timeout_ms}ms")]
    TaskTimeout { task: String, timeout_ms: u64 },

    #[error("task execution failed: {reason}")]
    TaskExecutionError { reason: String },

    #[error("chunk result of {got} values overflows its {capacity}-value slot at offset {offset}")]
    BoundsViolation {
        offset: usize,
        capacity: usize,
        got: usize,
    },

    #[error("no worker ever reached ready state")]
    PoolExhausted,

    #[error("shutdown budget of {budget_ms}ms exhausted with {skipped} hook(s) skipped")]
    ShutdownTimeout { budget_ms: u64, skipped: usize },

    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Errors that must reach the caller even when a fallback tier exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineError::ShuttingDown | EngineError::InvalidPayload { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

use thiserror::Error;

/// 编排器错误
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Too many pending tasks ({pending}/{max})")]
    QueueFull { pending: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Process timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("Process exited with {code}: {stderr}")]
    ProcessFailed { code: String, stderr: String },

    #[error("Unexpected tool output: {0}")]
    InvalidOutput(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

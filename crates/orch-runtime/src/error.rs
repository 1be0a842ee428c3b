use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to container runtime: {0}")]
    Connect(String),

    #[error("container runtime request failed: {0}")]
    Api(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("container runtime {operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("unexpected container runtime output: {0}")]
    Parse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

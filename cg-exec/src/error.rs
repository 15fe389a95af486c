use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("backing program missing: {0}")]
    ProgramMissing(String),

    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

use std::time::Duration;

use pilot_core::TaskError;
use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("exit code {code}: {diagnostic}")]
    NonZeroExit { code: i32, diagnostic: String },
    #[error("killed by signal: {diagnostic}")]
    KilledBySignal { diagnostic: String },
    #[error("timed out after {}s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },
    #[error("output file was not written: {0}")]
    MissingOutput(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

impl From<ExecError> for TaskError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::NonZeroExit { code, diagnostic } => TaskError::Execution {
                code: Some(code),
                diagnostic,
            },
            ExecError::KilledBySignal { diagnostic } => TaskError::Execution {
                code: None,
                diagnostic,
            },
            ExecError::MissingOutput(path) => TaskError::Execution {
                code: Some(0),
                diagnostic: format!("task exited successfully but did not write its output file {path}"),
            },
            ExecError::Codec(msg) => TaskError::Execution {
                code: Some(0),
                diagnostic: format!("unreadable task output: {msg}"),
            },
            ExecError::Timeout { elapsed } => TaskError::Timeout { elapsed },
            ExecError::Spawn(msg) | ExecError::Setup(msg) => TaskError::Setup(msg),
            ExecError::Io(msg) => TaskError::Io(msg),
        }
    }
}

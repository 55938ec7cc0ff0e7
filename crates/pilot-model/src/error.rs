use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("unsupported file type: {0} (expected: txt|json|bin)")]
    UnsupportedFileType(String),
    #[error("unsupported platform: {0} (expected: process|docker|apptainer)")]
    UnsupportedPlatform(String),
    #[error("invalid task env: {0}")]
    InvalidEnv(String),
}

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Analysis failed for {path}: {message}")]
    Analysis { path: PathBuf, message: String },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Timed out after {waited:?} waiting for analysis of {path}")]
    AnalysisWaitTimeout { path: PathBuf, waited: Duration },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, FluxError>;

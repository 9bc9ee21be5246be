use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
    #[error("environment {0} has no expert controller")]
    NoExpert(String),
    #[error("{0} requires an expert dataset")]
    MissingDataset(String),
    #[error("policy network must have at least one hidden layer")]
    EmptyNetwork,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    /// Rejects a zero count or size.
    pub fn ensure_positive(field: &'static str, value: usize) -> Result<(), Self> {
        if value == 0 {
            return Err(Self::Invalid {
                field,
                reason: "must be positive".to_owned(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("expert dataset not found: {0}")]
    NotFound(PathBuf),
    #[error("expert dataset {0} contains no transitions")]
    Empty(PathBuf),
    #[error("expert dataset {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),
    #[error("checkpoint {path} is missing metadata")]
    MissingMetadata { path: PathBuf },
    #[error("checkpoint was written by {found}, expected {expected}")]
    AlgorithmMismatch { expected: String, found: String },
    #[error("tensor {name} has shape {found:?}, network expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("tensor {0} missing from checkpoint")]
    MissingTensor(String),
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("worker {rank} failed: {message}")]
    Worker { rank: usize, message: String },
    #[error("worker {rank} sent an unexpected reply: {reply}")]
    UnexpectedReply { rank: usize, reply: String },
    #[error("packet of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("worker {rank} could not be started: {reason}")]
    WorkerSpawn { rank: usize, reason: String },
    #[error("environment pool is closed")]
    Closed,
}

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed diff in {file} at {hunk}: {reason}")]
    MalformedDiff {
        file: String,
        hunk: String,
        reason: String,
    },

    #[error("cannot locate finding in {file}: {snippet}")]
    UnresolvedLocation { file: String, snippet: String },

    #[error("task {task_id} failed: {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("job {job_id} timed out after {timeout:?}")]
    WorkerTimeout { job_id: u64, timeout: Duration },

    #[error("job {job_id} crashed: {message}")]
    WorkerCrash { job_id: u64, message: String },

    #[error("job {job_id} cancelled")]
    WorkerCancelled { job_id: u64 },

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("completion error: {0}")]
    Completion(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("state error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, Error>;

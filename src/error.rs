use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A task graph that cannot be executed. These errors are raised while the
/// graph is being built or extended, never by a running task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidTask {
    #[error("Task '{0}' is defined more than once")]
    Duplicate(String),

    #[error("Task '{task}' depends on '{dep}' which does not exist")]
    UnknownDependency { task: String, dep: String },

    #[error("Task '{0}' does not exist")]
    Unknown(String),

    #[error("Cyclic task dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Tasks '{0}' and '{1}' share the target '{2}'")]
    SharedTarget(String, String, Utf8PathBuf),

    #[error("Task '{task}': calc_dep result is invalid, {reason}")]
    CalcResult { task: String, reason: String },

    #[error("Task generator '{0}': {1}")]
    Generator(String, String),

    #[error("Invalid task file: {0}")]
    File(String),
}

/// Reasons a single task did not complete successfully.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    /// An action reported failure: returned `false` or a command exited
    /// with a non-zero status.
    #[error("Task failed: {0}")]
    Failed(String),

    /// An action raised an error or panicked.
    #[error("Task error: {0}")]
    Error(String),

    #[error("Dependencies have failed: {}", .0.join(", "))]
    UnmetDependency(Vec<String>),

    /// Checking or recording the dependency state of the task went wrong.
    #[error("Dependency error: {0}")]
    Dependency(String),
}

impl Failure {
    /// Whether this is an error rather than a plain task failure. Errors
    /// escalate the final run result to `ERROR`.
    pub fn is_error(&self) -> bool {
        !matches!(self, Failure::Failed(_))
    }
}

/// A request to terminate the whole run, raised from inside an action.
///
/// It is never treated as a task failure: runners stop dispatching, finish
/// what is in flight, tear down and hand the request back to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[error("Exit requested with code {0}")]
pub struct ExitRequest(pub i32);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Dependent file '{0}' does not exist")]
    MissingFile(Utf8PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode the dependency file.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode the dependency file.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

/// Problems talking to a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't decode worker message.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode worker message.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Worker {0} exited unexpectedly")]
    Lost(usize),

    #[error("Worker failure: {0}")]
    Remote(String),
}

/// Everything that can stop `run_tasks` early.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Exit(#[from] ExitRequest),

    #[error(transparent)]
    Invalid(#[from] InvalidTask),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Couldn't build the thread pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Dispatcher is holding but nothing is running")]
    Stalled,
}

/// Errors of the command layer: selecting tasks, loading files.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Task '{0}' not found")]
    UnknownTask(String),

    #[error(transparent)]
    Invalid(#[from] InvalidTask),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

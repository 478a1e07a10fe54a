mod dispatcher;
mod node;
mod runner;

pub use crate::engine::dispatcher::{Dispatch, TaskDispatcher};
pub use crate::engine::node::{ExecNode, RunStatus};
pub use crate::engine::runner::{
    LocalSpawner, ProcessRunner, ProcessSpawner, RunOptions, RunResult, Runner, Spawn, Strategy,
    ThreadRunner, WorkerHandle,
};

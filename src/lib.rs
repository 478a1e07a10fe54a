#![forbid(unsafe_code)]
//! Dependency-aware task execution.
//!
//! Tasks declare actions to run and what they depend on: files, other
//! tasks, and tasks whose results describe more dependencies. A
//! [`TaskDispatcher`] walks the graph lazily from the selected tasks and
//! hands out tasks whose dependencies have settled. A runner decides for
//! each one whether it is ignored, failed, up to date or has to execute,
//! consulting a [`DependencyStore`], and notifies a [`Reporter`] at every
//! step.
//!
//! Three execution strategies share the same selection logic:
//!
//! - [`Runner`] executes one task at a time on the calling thread,
//! - [`ThreadRunner`] executes actions on a `rayon` thread pool,
//! - [`ProcessRunner`] executes actions in worker processes.
//!
//! ```no_run
//! use tasuki::{
//!     Action, ConsoleReporter, FileStore, RunOptions, Runner, Strategy, Task, TaskDispatcher,
//!     task_map,
//! };
//!
//! let tasks = task_map([
//!     Task::builder("compile")
//!         .file_dep(["main.c"])
//!         .targets(["main.o"])
//!         .action(Action::cmd("cc -c %(dependencies)s -o %(targets)s"))
//!         .build(),
//!     Task::builder("link")
//!         .task_dep(["compile"])
//!         .action(Action::cmd("cc main.o -o main"))
//!         .build(),
//! ]);
//!
//! let store = FileStore::open(".tasuki.db")?;
//! let mut runner = Runner::new(store, ConsoleReporter::stdout(), RunOptions::default());
//! let mut dispatcher = TaskDispatcher::new(tasks, ["link"]);
//! let result = runner.run_all(&mut dispatcher)?;
//! std::process::exit(result.code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Programs using the process pool must hand control to
//! [`worker::serve_stdio`] early in `main` when [`worker::is_worker`] is
//! true, since workers are started by re-executing the program.

mod action;
pub mod clean;
mod core;
mod engine;
mod error;
pub mod loader;
mod report;
mod store;
mod task;
pub mod worker;

#[cfg(test)]
mod testing;

pub use crate::action::{Action, ActionContext, Outcome};
pub use crate::core::Values;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::report::{ConsoleReporter, ReportMethod, Reporter, UnknownMethod};
pub use crate::store::{DependencyStore, FileStore, Status};
pub use crate::task::{
    Clean, GetArg, Task, TaskBuilder, TaskMap, TaskOutput, TaskState, UpToDate, task_map,
};

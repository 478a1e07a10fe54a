mod process;
mod thread;

use petgraph::graph::NodeIndex;

use crate::core::Values;
use crate::engine::dispatcher::{Dispatch, TaskDispatcher};
use crate::engine::node::{ExecNode, RunStatus};
use crate::error::{ExitRequest, Failure, RunError};
use crate::report::Reporter;
use crate::store::{DependencyStore, Status};
use crate::task::Task;

pub use process::{LocalSpawner, ProcessRunner, ProcessSpawner, Spawn, WorkerHandle};
pub use thread::ThreadRunner;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunResult {
    #[default]
    Success,
    /// At least one task failed.
    Failure,
    /// At least one error happened, in a task or in the engine.
    Error,
}

impl RunResult {
    /// Process exit code of the result.
    pub fn code(self) -> i32 {
        match self {
            RunResult::Success => 0,
            RunResult::Failure => 1,
            RunResult::Error => 2,
        }
    }
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunResult::Success => write!(f, "SUCCESS"),
            RunResult::Failure => write!(f, "FAILURE"),
            RunResult::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Keep running independent tasks after a failure.
    pub continue_on_error: bool,
    /// Run tasks even when they are up to date.
    pub always_execute: bool,
}

/// A unit of work handed to an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Run(NodeIndex),
    Hold,
}

/// An execution strategy. All strategies share the selection and result
/// handling of [`Runner`] and differ only in where actions run.
pub trait Strategy {
    /// Drives the dispatcher until every selected task went through or the
    /// run was halted.
    fn run_tasks(&mut self, dispatcher: &mut TaskDispatcher) -> Result<(), RunError>;

    /// Closes the store, runs teardown and completes the report.
    fn finish(&mut self) -> RunResult;

    /// Records an error that stopped the run.
    fn abort(&mut self, error: &RunError);

    /// Runs the tasks and always finishes. A termination request raised by a
    /// task is returned once everything is cleaned up.
    fn run_all(&mut self, dispatcher: &mut TaskDispatcher) -> Result<RunResult, ExitRequest> {
        let exit = match self.run_tasks(dispatcher) {
            Ok(()) => None,
            Err(RunError::Exit(request)) => Some(request),
            Err(err) => {
                self.abort(&err);
                None
            }
        };

        let result = self.finish();
        match exit {
            Some(request) => Err(request),
            None => Ok(result),
        }
    }
}

/// Runs tasks one at a time on the calling thread. The parallel strategies
/// wrap it for everything except executing actions.
pub struct Runner<D, R> {
    pub store: D,
    pub reporter: R,
    options: RunOptions,
    teardown_list: Vec<Task>,
    final_result: RunResult,
    stop_running: bool,
}

impl<D: DependencyStore, R: Reporter> Runner<D, R> {
    pub fn new(store: D, reporter: R, options: RunOptions) -> Self {
        Self {
            store,
            reporter,
            options,
            teardown_list: Vec::new(),
            final_result: RunResult::Success,
            stop_running: false,
        }
    }

    /// Decides whether the task of a node has to execute now.
    ///
    /// On the first call the task is resolved as ignored, failed, up to date
    /// or to run. A task with setup tasks is deferred on the first call and
    /// offered again once they ran. Returns `true` only when the task should
    /// execute right away, with its `getargs` resolved.
    pub fn select_task(&mut self, dispatcher: &mut TaskDispatcher, ix: NodeIndex) -> bool {
        let node = dispatcher.node_mut(ix);

        if node.run_status == RunStatus::Pending {
            self.reporter.get_status(&node.task);

            if !node.ignored_deps.is_empty() || self.store.status_is_ignore(&node.task) {
                node.run_status = RunStatus::Ignored;
                self.reporter.skip_ignore(&node.task);
                tracing::info!("task '{}': ignored", node.name());
                return false;
            }

            if !node.bad_deps.is_empty() {
                let failure = Failure::UnmetDependency(node.failed_deps());
                self.handle_task_error(node, failure);
                return false;
            }

            let status = match self.options.always_execute {
                true => Ok(Status::Run),
                false => self.store.get_status(&node.task),
            };
            match status {
                Err(err) => {
                    let failure = Failure::Dependency(err.to_string());
                    self.handle_task_error(node, failure);
                    return false;
                }
                Ok(Status::UpToDate) => {
                    node.run_status = RunStatus::UpToDate;
                    node.task.values = self.store.get_values(&node.task.name);
                    self.reporter.skip_uptodate(&node.task);
                    tracing::info!("task '{}': up to date", node.name());
                    return false;
                }
                Ok(Status::Run) => node.run_status = RunStatus::Run,
            }

            if !node.task.setup.is_empty() {
                return false;
            }
        } else if !node.bad_deps.is_empty() {
            // a setup task failed
            let failure = Failure::UnmetDependency(node.failed_deps());
            self.handle_task_error(node, failure);
            return false;
        }

        let options = match self.getargs(dispatcher, ix) {
            Ok(options) => options,
            Err(failure) => {
                self.handle_task_error(dispatcher.node_mut(ix), failure);
                return false;
            }
        };
        dispatcher.node_mut(ix).task.options.extend(options);
        true
    }

    /// Reads the values a task asked for through `getargs`. Reading from a
    /// group task collects the value of every subtask, keyed by subtask name.
    fn getargs(&self, dispatcher: &TaskDispatcher, ix: NodeIndex) -> Result<Values, Failure> {
        let task = &dispatcher.node(ix).task;
        let mut options = Values::new();

        for (arg, source) in &task.getargs {
            let Some(from) = dispatcher.task(&source.task) else {
                return Err(Failure::Dependency(format!(
                    "getargs '{arg}': task '{}' does not exist",
                    source.task
                )));
            };

            let value = if from.has_subtask {
                let prefix = format!("{}:", from.name);
                let mut group = serde_json::Map::new();
                for sub in &from.task_dep {
                    let key = sub.strip_prefix(&prefix).unwrap_or(sub);
                    let value = self.getarg_value(arg, sub, source.key.as_deref())?;
                    group.insert(key.to_string(), value);
                }
                serde_json::Value::Object(group)
            } else {
                self.getarg_value(arg, &from.name, source.key.as_deref())?
            };

            options.insert(arg.clone(), value);
        }

        Ok(options)
    }

    fn getarg_value(
        &self,
        arg: &str,
        task: &str,
        key: Option<&str>,
    ) -> Result<serde_json::Value, Failure> {
        let values = self.store.get_values(task);
        match key {
            None => Ok(serde_json::Value::Object(values.into_iter().collect())),
            Some(key) => values.get(key).cloned().ok_or_else(|| {
                Failure::Dependency(format!("getargs '{arg}': task '{task}' has no value '{key}'"))
            }),
        }
    }

    /// Registers teardown and notifies the reporter, everything that
    /// happens on the coordinator right before a task executes.
    pub(crate) fn prepare_execute(&mut self, task: &Task) {
        self.register_teardown(task);
        self.reporter.execute_task(task);
    }

    pub(crate) fn register_teardown(&mut self, task: &Task) {
        if !task.teardown.is_empty() {
            self.teardown_list.push(task.clone());
        }
    }

    pub fn execute_task(&mut self, task: &mut Task) -> Result<Option<Failure>, ExitRequest> {
        self.prepare_execute(task);
        tracing::info!("task '{}': executing", task.name);
        task.execute()
    }

    /// Records the outcome of an executed task.
    pub fn process_task_result(&mut self, node: &mut ExecNode, failure: Option<Failure>) {
        if let Some(failure) = failure {
            self.handle_task_error(node, failure);
            return;
        }

        match self.store.save_success(&node.task) {
            Ok(()) => {
                node.run_status = RunStatus::Done;
                self.reporter.add_success(&node.task);
                tracing::info!("task '{}': done", node.name());
            }
            Err(err) => {
                let failure = Failure::Dependency(err.to_string());
                self.handle_task_error(node, failure);
            }
        }
    }

    fn handle_task_error(&mut self, node: &mut ExecNode, failure: Failure) {
        tracing::warn!("task '{}': {failure}", node.name());
        node.run_status = RunStatus::Failed;
        self.store.remove_success(&node.task);
        self.reporter.add_failure(&node.task, &failure);

        self.final_result = match failure.is_error() || self.final_result == RunResult::Error {
            true => RunResult::Error,
            false => RunResult::Failure,
        };
        if !self.options.continue_on_error {
            self.stop_running = true;
        }
    }

    /// Stops handing out new tasks.
    pub(crate) fn stop(&mut self) {
        self.stop_running = true;
    }

    /// Fetches the next task to execute for a parallel executor, skipping
    /// over tasks that resolve without execution. Never blocks: returns
    /// [`Job::Hold`] when nothing is ready.
    pub(crate) fn next_job(
        &mut self,
        dispatcher: &mut TaskDispatcher,
        completed: Option<NodeIndex>,
    ) -> Result<Option<Job>, RunError> {
        if self.stop_running {
            return Ok(None);
        }

        let mut processed = completed;
        loop {
            match dispatcher.next(processed.take())? {
                None => return Ok(None),
                Some(Dispatch::Hold) => return Ok(Some(Job::Hold)),
                Some(Dispatch::Ready(ix)) => {
                    if self.select_task(dispatcher, ix) {
                        return Ok(Some(Job::Run(ix)));
                    }
                    processed = Some(ix);
                }
            }
        }
    }

    /// Runs the teardown actions of every executed task, last executed
    /// first. Failures are reported and do not stop the remaining ones.
    pub fn teardown(&mut self) {
        for mut task in std::mem::take(&mut self.teardown_list).into_iter().rev() {
            self.reporter.teardown_task(&task);
            if let Some(failure) = task.execute_teardown() {
                tracing::warn!("teardown of '{}': {failure}", task.name);
                self.reporter.cleanup_error(&task, &failure);
            }
        }
    }

    fn abort_run(&mut self, error: &RunError) {
        tracing::error!("{error}");
        self.reporter.runtime_error(&error.to_string());
        self.final_result = RunResult::Error;
        self.stop_running = true;
    }

    fn finish_run(&mut self) -> RunResult {
        if let Err(err) = self.store.close() {
            self.reporter.runtime_error(&err.to_string());
            self.final_result = RunResult::Error;
        }
        self.teardown();
        self.reporter.complete_run();
        self.final_result
    }
}

impl<D: DependencyStore, R: Reporter> Strategy for Runner<D, R> {
    fn run_tasks(&mut self, dispatcher: &mut TaskDispatcher) -> Result<(), RunError> {
        let mut processed = None;

        while !self.stop_running {
            let ix = match dispatcher.next(processed.take())? {
                None => break,
                Some(Dispatch::Hold) => return Err(RunError::Stalled),
                Some(Dispatch::Ready(ix)) => ix,
            };

            processed = Some(ix);
            if !self.select_task(dispatcher, ix) {
                continue;
            }

            let node = dispatcher.node_mut(ix);
            let failure = self.execute_task(&mut node.task)?;
            self.process_task_result(node, failure);
        }

        Ok(())
    }

    fn finish(&mut self) -> RunResult {
        self.finish_run()
    }

    fn abort(&mut self, error: &RunError) {
        self.abort_run(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::testing::{self, FakeReporter};

    fn sequential(
        _: &crate::task::TaskMap,
        store: FileStore,
        reporter: FakeReporter,
        options: RunOptions,
    ) -> Runner<FileStore, FakeReporter> {
        Runner::new(store, reporter, options)
    }

    testing::strategy_tests!(sequential);

    #[test]
    fn test_run_result_codes() {
        assert_eq!(RunResult::Success.code(), 0);
        assert_eq!(RunResult::Failure.code(), 1);
        assert_eq!(RunResult::Error.code(), 2);
        assert_eq!(RunResult::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_always_execute_ignores_store() {
        let (dir, root) = testing::tempdir();
        let dep = root.join("dep.txt");
        std::fs::write(&dep, "x").unwrap();
        let task = || {
            Task::builder("t1")
                .file_dep([dep.clone()])
                .action(crate::action::Action::func(|_| Ok(())))
                .build()
        };

        let mut store = FileStore::in_memory();
        store.save_success(&task()).unwrap();

        let options = RunOptions {
            always_execute: true,
            ..RunOptions::default()
        };
        let (result, events, _) = testing::run(&sequential, vec![task()], &["t1"], store, options);
        assert_eq!(result, Ok(RunResult::Success));
        let expected = [("start", "t1"), ("execute", "t1"), ("success", "t1")];
        assert_eq!(events, testing::events(&expected));
        drop(dir);
    }
}

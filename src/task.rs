//! Task descriptions and everything a single task does on its own.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{Action, ActionEnv};
use crate::core::Values;
use crate::error::{ExitRequest, Failure, InvalidTask};

/// Tasks of one run, keyed by name.
pub type TaskMap = HashMap<String, Task>;

/// Collects tasks into a [`TaskMap`].
pub fn task_map(tasks: impl IntoIterator<Item = Task>) -> TaskMap {
    tasks.into_iter().map(|t| (t.name.clone(), t)).collect()
}

/// Where a `getargs` entry reads its value from. With no key the whole
/// values map of the task is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArg {
    pub task: String,
    pub key: Option<String>,
}

type UpToDateFn = dyn Fn(&Task, &Values) -> bool + Send + Sync;

/// An extra condition for a task to be up to date. Predicates receive the
/// task and the values it saved on its last successful run.
#[derive(Clone)]
pub enum UpToDate {
    Fixed(bool),
    Check(Arc<UpToDateFn>),
}

impl UpToDate {
    pub fn check(f: impl Fn(&Task, &Values) -> bool + Send + Sync + 'static) -> Self {
        UpToDate::Check(Arc::new(f))
    }

    pub(crate) fn holds(&self, task: &Task, saved: &Values) -> bool {
        match self {
            UpToDate::Fixed(value) => *value,
            UpToDate::Check(f) => f(task, saved),
        }
    }
}

impl std::fmt::Debug for UpToDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpToDate::Fixed(value) => write!(f, "Fixed({value})"),
            UpToDate::Check(_) => write!(f, "Check"),
        }
    }
}

/// What cleaning a task does.
#[derive(Debug, Clone, Default)]
pub enum Clean {
    #[default]
    Nothing,
    /// Remove target files, and target directories once empty.
    Targets,
    Actions(Vec<Action>),
}

/// One unit of work and its dependencies.
///
/// Tasks are plain data: the fields are public and a task is not modified
/// by the engine once a run starts, apart from the runtime fields at the
/// bottom and the dependencies discovered through `calc_dep`.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub name: String,
    pub actions: Vec<Action>,
    pub file_dep: BTreeSet<Utf8PathBuf>,
    pub task_dep: Vec<String>,
    /// Tasks whose values describe further dependencies of this task.
    pub calc_dep: Vec<String>,
    /// Tasks that run only when this task is going to run.
    pub setup: Vec<String>,
    pub targets: Vec<Utf8PathBuf>,
    pub getargs: BTreeMap<String, GetArg>,
    pub teardown: Vec<Action>,
    pub clean: Clean,
    pub uptodate: Vec<UpToDate>,
    pub has_subtask: bool,
    pub is_subtask: bool,
    pub doc: Option<String>,

    /// Values resolved from `getargs` right before execution.
    pub options: Values,
    pub result: Option<Value>,
    pub values: Values,
}

/// The part of a task that travels to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub name: String,
    pub options: Values,
    pub file_dep: BTreeSet<Utf8PathBuf>,
}

/// What executing a task produced, sent back from workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: Option<Value>,
    pub values: Values,
    pub out: Vec<Option<String>>,
    pub err: Vec<Option<String>>,
}

/// Dependencies newly added to a task from calc_dep results.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct NewDeps {
    pub task_dep: Vec<String>,
    pub calc_dep: Vec<String>,
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            task: Task {
                name: name.into(),
                ..Task::default()
            },
        }
    }

    /// The name of the group task for subtasks, the task name otherwise.
    pub fn basename(&self) -> &str {
        match self.is_subtask {
            true => match self.name.split_once(':') {
                Some((base, _)) => base,
                None => &self.name,
            },
            false => &self.name,
        }
    }

    /// Captured stdout of all actions of the last execution.
    pub fn out(&self) -> String {
        self.actions
            .iter()
            .filter_map(|a| a.out.as_deref())
            .collect()
    }

    /// Captured stderr of all actions of the last execution.
    pub fn err(&self) -> String {
        self.actions
            .iter()
            .filter_map(|a| a.err.as_deref())
            .collect()
    }

    /// Runs the actions in order and stops at the first one that fails.
    pub fn execute(&mut self) -> Result<Option<Failure>, ExitRequest> {
        self.result = None;
        let env = ActionEnv {
            task: &self.name,
            options: &self.options,
            targets: &self.targets,
            file_dep: &self.file_dep,
        };

        for action in &mut self.actions {
            if let Some(failure) = action.execute(env)? {
                return Ok(Some(failure));
            }
            if action.result.is_some() {
                self.result = action.result.clone();
            }
            self.values
                .extend(action.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(None)
    }

    /// Runs the teardown actions. A termination request here is only an
    /// error of this teardown.
    pub fn execute_teardown(&mut self) -> Option<Failure> {
        let env = ActionEnv {
            task: &self.name,
            options: &self.options,
            targets: &self.targets,
            file_dep: &self.file_dep,
        };

        for action in &mut self.teardown {
            match action.execute(env) {
                Ok(None) => {}
                Ok(Some(failure)) => return Some(failure),
                Err(exit) => return Some(Failure::Error(exit.to_string())),
            }
        }
        None
    }

    /// Cleans whatever the task produced, reporting each step to `out`.
    pub fn execute_clean(&mut self, out: &mut dyn Write, dryrun: bool) -> Option<Failure> {
        match &mut self.clean {
            Clean::Nothing => None,
            Clean::Targets => clean_targets(&self.name, &self.targets, out, dryrun),
            Clean::Actions(actions) => {
                let env = ActionEnv {
                    task: &self.name,
                    options: &self.options,
                    targets: &self.targets,
                    file_dep: &self.file_dep,
                };
                for action in actions {
                    let _ = writeln!(out, "{} - executing '{action}'", self.name);
                    if dryrun {
                        continue;
                    }
                    match action.execute(env) {
                        Ok(None) => {}
                        Ok(Some(failure)) => return Some(failure),
                        Err(exit) => return Some(Failure::Error(exit.to_string())),
                    }
                }
                None
            }
        }
    }

    /// Folds the values of a calc_dep task into this task. Recognized keys
    /// are `file_dep`, `task_dep` and `calc_dep`, each a list of strings.
    pub(crate) fn update_deps(&mut self, values: &Values) -> Result<NewDeps, InvalidTask> {
        let mut new = NewDeps::default();

        for (key, value) in values {
            let target = match key.as_str() {
                "file_dep" | "task_dep" | "calc_dep" => key.as_str(),
                _ => continue,
            };

            let items = string_list(value).ok_or_else(|| InvalidTask::CalcResult {
                task: self.name.clone(),
                reason: format!("'{target}' must be a list of strings, got {value}"),
            })?;

            for item in items {
                match target {
                    "file_dep" => {
                        self.file_dep.insert(Utf8PathBuf::from(item));
                    }
                    "task_dep" if !self.task_dep.iter().any(|t| t == item) => {
                        self.task_dep.push(item.to_string());
                        new.task_dep.push(item.to_string());
                    }
                    "calc_dep" if !self.calc_dep.iter().any(|t| t == item) => {
                        self.calc_dep.push(item.to_string());
                        new.calc_dep.push(item.to_string());
                    }
                    _ => {}
                }
            }
        }

        Ok(new)
    }

    pub fn state(&self) -> TaskState {
        TaskState {
            name: self.name.clone(),
            options: self.options.clone(),
            file_dep: self.file_dep.clone(),
        }
    }

    pub fn apply_state(&mut self, state: TaskState) {
        self.options = state.options;
        self.file_dep = state.file_dep;
    }

    pub fn output(&self) -> TaskOutput {
        TaskOutput {
            result: self.result.clone(),
            values: self.values.clone(),
            out: self.actions.iter().map(|a| a.out.clone()).collect(),
            err: self.actions.iter().map(|a| a.err.clone()).collect(),
        }
    }

    pub fn apply_output(&mut self, output: TaskOutput) {
        self.result = output.result;
        self.values = output.values;
        for (action, out) in self.actions.iter_mut().zip(output.out) {
            action.out = out;
        }
        for (action, err) in self.actions.iter_mut().zip(output.err) {
            action.err = err;
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<&str>> {
    value.as_array()?.iter().map(Value::as_str).collect()
}

fn clean_targets(
    name: &str,
    targets: &[Utf8PathBuf],
    out: &mut dyn Write,
    dryrun: bool,
) -> Option<Failure> {
    // deepest paths first, so files go before the directories holding them
    let mut targets: Vec<_> = targets.iter().collect();
    targets.sort_by(|a, b| b.cmp(a));

    for path in targets.iter().filter(|p| p.is_file()) {
        let _ = writeln!(out, "{name} - removing file '{path}'");
        if !dryrun && let Err(err) = std::fs::remove_file(path) {
            return Some(Failure::Error(format!("Couldn't remove '{path}': {err}")));
        }
    }

    for path in targets.iter().filter(|p| p.is_dir()) {
        let empty = std::fs::read_dir(path).map(|mut d| d.next().is_none());
        if let Ok(true) = empty {
            let _ = writeln!(out, "{name} - removing dir '{path}'");
            if !dryrun && let Err(err) = std::fs::remove_dir(path) {
                return Some(Failure::Error(format!("Couldn't remove '{path}': {err}")));
            }
        } else {
            let _ = writeln!(out, "{name} - cannot remove (it is not empty) '{path}'");
        }
    }

    None
}

/// Builder for [`Task`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn action(mut self, action: Action) -> Self {
        self.task.actions.push(action);
        self
    }

    pub fn file_dep<P: Into<Utf8PathBuf>>(mut self, deps: impl IntoIterator<Item = P>) -> Self {
        self.task.file_dep.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn task_dep<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.task.task_dep.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn calc_dep<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.task.calc_dep.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn setup<S: Into<String>>(mut self, tasks: impl IntoIterator<Item = S>) -> Self {
        self.task.setup.extend(tasks.into_iter().map(Into::into));
        self
    }

    pub fn targets<P: Into<Utf8PathBuf>>(mut self, targets: impl IntoIterator<Item = P>) -> Self {
        let targets = targets.into_iter().map(Into::into);
        self.task.targets.extend(targets);
        self
    }

    pub fn getarg(
        mut self,
        name: impl Into<String>,
        task: impl Into<String>,
        key: Option<&str>,
    ) -> Self {
        let arg = GetArg {
            task: task.into(),
            key: key.map(str::to_string),
        };
        self.task.getargs.insert(name.into(), arg);
        self
    }

    pub fn teardown(mut self, action: Action) -> Self {
        self.task.teardown.push(action);
        self
    }

    pub fn clean(mut self, clean: Clean) -> Self {
        self.task.clean = clean;
        self
    }

    pub fn uptodate(mut self, condition: UpToDate) -> Self {
        self.task.uptodate.push(condition);
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.task.doc = Some(doc.into());
        self
    }

    pub(crate) fn group(mut self, subtasks: Vec<String>) -> Self {
        self.task.has_subtask = true;
        self.task.task_dep.extend(subtasks);
        self
    }

    pub(crate) fn subtask(mut self) -> Self {
        self.task.is_subtask = true;
        self
    }

    /// Finishes the task. Tasks read through `getargs` become setup tasks.
    pub fn build(self) -> Task {
        let mut task = self.task;
        for arg in task.getargs.values() {
            if !task.setup.contains(&arg.task) {
                task.setup.push(arg.task.clone());
            }
        }
        task
    }
}

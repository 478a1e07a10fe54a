//! Task files: JSON documents describing tasks, the way they are flattened
//! into [`Task`]s, and the validated set of tasks a command works on.
use std::collections::{BTreeMap, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::action::{Action, shell};
use crate::engine::RunOptions;
use crate::error::{CommandError, InvalidTask};
use crate::task::{Clean, GetArg, Task, TaskBuilder, TaskMap, UpToDate};

/// How actions are executed in parallel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ParType {
    #[default]
    Process,
    Thread,
}

/// Run settings read from the `config` object of a task file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Tasks to run when none are named.
    pub default_tasks: Option<Vec<String>>,
    #[serde(rename = "continue")]
    pub continue_on_error: bool,
    pub always_execute: bool,
    /// Number of parallel workers, `0` runs sequentially.
    pub num_process: usize,
    pub par_type: ParType,
    pub dep_file: Option<Utf8PathBuf>,
}

impl From<&RunConfig> for RunOptions {
    fn from(config: &RunConfig) -> Self {
        RunOptions {
            continue_on_error: config.continue_on_error,
            always_execute: config.always_execute,
        }
    }
}

/// Distinguishes a missing field from an explicit `null`.
fn explicit<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CleanSpec {
    Targets(bool),
    Actions(Vec<Action>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UpToDateSpec {
    Fixed(bool),
    /// A shell command, up to date when it exits with success.
    Cmd(String),
}

/// One task as written in a task file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    #[serde(default, deserialize_with = "explicit")]
    pub name: Option<Option<String>>,
    pub basename: Option<String>,
    pub actions: Option<Vec<Action>>,
    /// Paths or glob patterns.
    #[serde(default)]
    pub file_dep: Vec<String>,
    #[serde(default)]
    pub task_dep: Vec<String>,
    #[serde(default)]
    pub calc_dep: Vec<String>,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub targets: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub getargs: BTreeMap<String, GetArg>,
    #[serde(default)]
    pub teardown: Vec<Action>,
    pub clean: Option<CleanSpec>,
    #[serde(default)]
    pub uptodate: Vec<UpToDateSpec>,
    pub doc: Option<String>,
}

/// What a task file binds to a name: a single task, a list of task
/// specs and nested lists, or nothing.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TaskGen {
    Spec(Box<TaskSpec>),
    List(Vec<TaskGen>),
    None(()),
}

fn expand_file_dep(task: &str, patterns: &[String]) -> Result<Vec<Utf8PathBuf>, InvalidTask> {
    let invalid = |reason: String| InvalidTask::Generator(task.to_string(), reason);
    let mut paths = Vec::new();

    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            paths.push(Utf8PathBuf::from(pattern));
            continue;
        }
        for path in glob::glob(pattern).map_err(|e| invalid(e.to_string()))? {
            let path = path.map_err(|e| invalid(e.to_string()))?;
            let path = Utf8PathBuf::try_from(path)
                .map_err(|e| invalid(e.to_string()))?;
            if path.is_file() {
                paths.push(path);
            }
        }
    }

    Ok(paths)
}

fn uptodate_cmd(cmd: String) -> UpToDate {
    UpToDate::check(move |task, _| match shell(&cmd).output() {
        Ok(output) => output.status.success(),
        Err(err) => {
            tracing::warn!("task '{}': uptodate command '{cmd}': {err}", task.name);
            false
        }
    })
}

impl TaskSpec {
    fn into_builder(self, name: String, doc: Option<&str>) -> Result<TaskBuilder, InvalidTask> {
        let Some(actions) = self.actions else {
            let reason = "a task must contain 'actions'".into();
            return Err(InvalidTask::Generator(name, reason));
        };

        let mut builder = Task::builder(name.as_str())
            .file_dep(expand_file_dep(&name, &self.file_dep)?)
            .task_dep(self.task_dep)
            .calc_dep(self.calc_dep)
            .setup(self.setup)
            .targets(self.targets);

        for action in actions {
            builder = builder.action(action);
        }
        for action in self.teardown {
            builder = builder.teardown(action);
        }
        for (arg, source) in self.getargs {
            builder = builder.getarg(arg, source.task, source.key.as_deref());
        }
        for condition in self.uptodate {
            builder = builder.uptodate(match condition {
                UpToDateSpec::Fixed(value) => UpToDate::Fixed(value),
                UpToDateSpec::Cmd(cmd) => uptodate_cmd(cmd),
            });
        }
        builder = builder.clean(match self.clean {
            None | Some(CleanSpec::Targets(false)) => Clean::Nothing,
            Some(CleanSpec::Targets(true)) => Clean::Targets,
            Some(CleanSpec::Actions(actions)) => Clean::Actions(actions),
        });
        if let Some(doc) = self.doc.as_deref().or(doc) {
            builder = builder.doc(doc);
        }

        Ok(builder)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Seen {
    Standalone,
    Group,
}

/// Turns what a task file binds to `name` into tasks.
///
/// A single spec is one task named `name`, or its `basename`. A list makes
/// subtasks `basename:name` of a group task, or standalone tasks for items
/// with only a `basename`. Nested lists are flattened. An item with a null
/// `name` only sets the doc of its group.
pub fn generate_tasks(
    name: &str,
    generator: TaskGen,
    doc: Option<&str>,
) -> Result<Vec<Task>, InvalidTask> {
    let invalid = |reason: String| InvalidTask::Generator(name.to_string(), reason);

    let items = match generator {
        TaskGen::None(()) => return Ok(Vec::new()),
        TaskGen::Spec(mut spec) => {
            if spec.name.is_some() {
                return Err(invalid("only subtasks use the field 'name'".into()));
            }
            let task_name = spec.basename.take().unwrap_or_else(|| name.to_string());
            return Ok(vec![spec.into_builder(task_name, doc)?.build()]);
        }
        TaskGen::List(items) => {
            let mut flat = Vec::new();
            flatten(items, &mut flat);
            flat
        }
    };

    let mut tasks: Vec<Task> = Vec::new();
    let mut seen: HashMap<String, Seen> = HashMap::new();
    // group name -> position in `tasks`
    let mut groups: HashMap<String, usize> = HashMap::new();

    for mut spec in items {
        let basename = spec.basename.take();

        let Some(sub) = spec.name.take() else {
            let Some(basename) = basename else {
                return Err(invalid("a subtask must contain the field 'name'".into()));
            };
            if seen.insert(basename.clone(), Seen::Standalone).is_some() {
                return Err(invalid(format!("task '{basename}' is defined more than once")));
            }
            tasks.push(spec.into_builder(basename, None)?.build());
            continue;
        };

        let basename = basename.unwrap_or_else(|| name.to_string());
        let group = match groups.get(&basename) {
            Some(&ix) => ix,
            None => {
                if seen.insert(basename.clone(), Seen::Group) == Some(Seen::Standalone) {
                    return Err(invalid(format!("task '{basename}' is defined more than once")));
                }
                let mut group = Task::builder(basename.as_str()).group(Vec::new());
                if let Some(doc) = doc {
                    group = group.doc(doc);
                }
                tasks.push(group.build());
                groups.insert(basename.clone(), tasks.len() - 1);
                tasks.len() - 1
            }
        };

        let Some(sub) = sub else {
            tasks[group].doc = spec.doc;
            continue;
        };

        let full = format!("{basename}:{sub}");
        if tasks.iter().any(|t| t.name == full) {
            return Err(invalid(format!("subtask '{full}' is defined more than once")));
        }

        let task = spec.into_builder(full.clone(), doc)?.subtask().build();
        tasks[group].task_dep.push(full);
        tasks.push(task);
    }

    if tasks.is_empty() {
        let mut group = Task::builder(name).group(Vec::new());
        if let Some(doc) = doc {
            group = group.doc(doc);
        }
        tasks.push(group.build());
    }

    Ok(tasks)
}

fn flatten(items: Vec<TaskGen>, out: &mut Vec<TaskSpec>) {
    for item in items {
        match item {
            TaskGen::Spec(spec) => out.push(*spec),
            TaskGen::List(nested) => flatten(nested, out),
            TaskGen::None(()) => {}
        }
    }
}

/// A parsed task file.
#[derive(Debug)]
pub struct TaskFile {
    pub config: RunConfig,
    /// Tasks in definition order.
    pub tasks: Vec<Task>,
}

impl TaskFile {
    pub fn load(path: &Utf8Path) -> Result<Self, InvalidTask> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| InvalidTask::File(format!("{path}: {e}")))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, InvalidTask> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| InvalidTask::File(e.to_string()))?;
        let Value::Object(mut document) = document else {
            return Err(InvalidTask::File("the document must be an object".into()));
        };

        let config = match document.remove("config") {
            None => RunConfig::default(),
            Some(config @ Value::Object(_)) => serde_json::from_value(config)
                .map_err(|e| InvalidTask::File(format!("config: {e}")))?,
            Some(other) => {
                return Err(InvalidTask::File(format!("config must be an object, got {other}")));
            }
        };

        let mut tasks = Vec::new();
        if let Some(defs) = document.remove("tasks") {
            let Value::Object(defs) = defs else {
                return Err(InvalidTask::File("tasks must be an object".into()));
            };
            for (name, def) in defs {
                let generator = serde_json::from_value(def)
                    .map_err(|e| InvalidTask::Generator(name.clone(), e.to_string()))?;
                tasks.extend(generate_tasks(&name, generator, None)?);
            }
        }

        if let Some(key) = document.keys().next() {
            return Err(InvalidTask::File(format!("unknown key '{key}'")));
        }

        tracing::debug!("loaded {} tasks", tasks.len());
        Ok(Self { config, tasks })
    }
}

/// A validated collection of tasks in definition order.
#[derive(Debug, Clone)]
pub struct TaskSet {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    targets: HashMap<Utf8PathBuf, usize>,
}

impl TaskSet {
    /// Checks names, references, targets and static cycles. A task that
    /// depends on a file another task creates gets a `task_dep` on it.
    pub fn new(mut tasks: Vec<Task>) -> Result<Self, InvalidTask> {
        let mut index = HashMap::new();
        for (ix, task) in tasks.iter().enumerate() {
            if index.insert(task.name.clone(), ix).is_some() {
                return Err(InvalidTask::Duplicate(task.name.clone()));
            }
        }

        let mut targets: HashMap<Utf8PathBuf, usize> = HashMap::new();
        for (ix, task) in tasks.iter().enumerate() {
            for target in &task.targets {
                if let Some(&other) = targets.get(target) {
                    return Err(InvalidTask::SharedTarget(
                        tasks[other].name.clone(),
                        task.name.clone(),
                        target.clone(),
                    ));
                }
                targets.insert(target.clone(), ix);
            }
        }

        for task in &tasks {
            let refs = task
                .task_dep
                .iter()
                .chain(&task.calc_dep)
                .chain(&task.setup)
                .chain(task.getargs.values().map(|arg| &arg.task));
            for dep in refs {
                if !index.contains_key(dep) {
                    return Err(InvalidTask::UnknownDependency {
                        task: task.name.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        for ix in 0..tasks.len() {
            let producers: Vec<String> = tasks[ix]
                .file_dep
                .iter()
                .filter_map(|dep| targets.get(dep))
                .filter(|&&producer| producer != ix)
                .map(|&producer| tasks[producer].name.clone())
                .collect();
            let task = &mut tasks[ix];
            for producer in producers {
                if !task.task_dep.contains(&producer) {
                    task.task_dep.push(producer);
                }
            }
        }

        check_cycles(&tasks, &index)?;
        Ok(Self { tasks, index, targets })
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&ix| &self.tasks[ix])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Resolves names given on the command line. A name is a task name or a
    /// target path. With no names the default tasks are used, or else every
    /// task that is not a subtask.
    pub fn select(
        &self,
        names: &[String],
        default_tasks: Option<&[String]>,
    ) -> Result<Vec<String>, CommandError> {
        let names = match (names.is_empty(), default_tasks) {
            (false, _) => names.to_vec(),
            (true, Some(defaults)) => defaults.to_vec(),
            (true, None) => {
                let all = self.tasks.iter().filter(|t| !t.is_subtask);
                return Ok(all.map(|t| t.name.clone()).collect());
            }
        };

        names
            .into_iter()
            .map(|name| {
                if self.index.contains_key(&name) {
                    return Ok(name);
                }
                match self.targets.get(Utf8Path::new(&name)) {
                    Some(&ix) => Ok(self.tasks[ix].name.clone()),
                    None => Err(CommandError::UnknownTask(name)),
                }
            })
            .collect()
    }

    pub fn into_map(self) -> TaskMap {
        crate::task::task_map(self.tasks)
    }
}

fn check_cycles(tasks: &[Task], index: &HashMap<String, usize>) -> Result<(), InvalidTask> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = tasks
        .iter()
        .map(|t| graph.add_node(t.name.as_str()))
        .collect();

    for (ix, task) in tasks.iter().enumerate() {
        let deps = task.task_dep.iter().chain(&task.calc_dep);
        for dep in deps.chain(&task.setup) {
            graph.add_edge(nodes[index[dep]], nodes[ix], ());
        }
    }

    let Err(cycle) = toposort(&graph, None) else {
        return Ok(());
    };

    let start = cycle.node_id();
    let names = tarjan_scc(&graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .map(|mut scc| {
            scc.reverse();
            let mut names: Vec<String> = scc.iter().map(|&n| graph[n].to_string()).collect();
            names.push(graph[scc[0]].to_string());
            names
        })
        .unwrap_or_else(|| vec![graph[start].to_string()]);

    Err(InvalidTask::Cycle(names))
}

use std::collections::HashSet;

use petgraph::graph::NodeIndex;

use crate::task::Task;

/// Where a node is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    /// Not decided yet.
    #[default]
    Pending,
    /// Selected to execute, or executing.
    Run,
    Done,
    Failed,
    Ignored,
    UpToDate,
}

impl RunStatus {
    /// Dependents can proceed once a dependency reaches one of these.
    pub fn is_settled(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Run)
    }
}

/// How a dependency was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DepKind {
    Task,
    Calc,
}

/// Progress of a node through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Stage {
    /// Resolving `task_dep` and `calc_dep`.
    #[default]
    Deps,
    /// Yielded as ready for the first time.
    Selected,
    /// Parked until the runner decides whether the task runs.
    SelectWait,
    /// Waiting on setup tasks.
    Setup,
    /// Yielded again after its setup tasks.
    Finished,
}

/// Runtime state of one task within a run. The node owns its task for the
/// duration of the run.
#[derive(Debug, Clone)]
pub struct ExecNode {
    pub task: Task,
    /// The node whose dependency brought this one in.
    pub parent: Option<NodeIndex>,
    pub run_status: RunStatus,

    /// Names on the path from the root, this node included.
    pub(crate) ancestors: Vec<String>,
    /// Declared dependencies not materialized yet.
    pub(crate) task_dep: Vec<String>,
    pub(crate) calc_dep: Vec<String>,
    pub(crate) wait_run: HashSet<String>,
    pub(crate) wait_run_calc: HashSet<String>,
    /// Set while the node is parked until the runner selects it.
    pub(crate) wait_select: bool,
    pub(crate) bad_deps: Vec<(String, DepKind)>,
    pub(crate) ignored_deps: Vec<String>,
    pub(crate) stage: Stage,
}

impl ExecNode {
    pub(crate) fn new(task: Task, parent: Option<(NodeIndex, &ExecNode)>) -> Self {
        let mut ancestors = parent.map(|(_, p)| p.ancestors.clone()).unwrap_or_default();
        ancestors.push(task.name.clone());

        Self {
            task_dep: task.task_dep.clone(),
            calc_dep: task.calc_dep.clone(),
            task,
            parent: parent.map(|(ix, _)| ix),
            run_status: RunStatus::Pending,
            ancestors,
            wait_run: HashSet::new(),
            wait_run_calc: HashSet::new(),
            wait_select: false,
            bad_deps: Vec::new(),
            ignored_deps: Vec::new(),
            stage: Stage::Deps,
        }
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    /// Records the final status of a dependency. A dependency declared both
    /// as task_dep and calc_dep is recorded once.
    pub(crate) fn parent_status(&mut self, dep: &str, status: RunStatus, kind: DepKind) {
        match status {
            RunStatus::Failed if !self.bad_deps.iter().any(|(name, _)| name == dep) => {
                self.bad_deps.push((dep.to_string(), kind))
            }
            RunStatus::Ignored if !self.ignored_deps.iter().any(|name| name == dep) => {
                self.ignored_deps.push(dep.to_string())
            }
            _ => {}
        }
    }

    /// Names of failed dependencies, task dependencies first.
    pub(crate) fn failed_deps(&self) -> Vec<String> {
        let task = self.bad_deps.iter().filter(|(_, k)| *k == DepKind::Task);
        let calc = self.bad_deps.iter().filter(|(_, k)| *k == DepKind::Calc);
        task.chain(calc).map(|(name, _)| name.clone()).collect()
    }

    pub(crate) fn is_waiting(&self) -> bool {
        !self.wait_run.is_empty() || !self.wait_run_calc.is_empty()
    }
}

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::engine::node::{DepKind, ExecNode, RunStatus, Stage};
use crate::error::InvalidTask;
use crate::task::{Task, TaskMap};

/// What the dispatcher hands out next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// This node is ready to be considered by the runner.
    Ready(NodeIndex),
    /// Nothing is ready until one of the nodes already handed out is sent
    /// back as processed.
    Hold,
}

enum Step {
    Ready,
    Wait,
    Done,
}

/// Walks the task graph on demand and hands out nodes whose dependencies
/// have settled.
///
/// Tasks are turned into nodes lazily, at most once each, starting from the
/// selected roots and following `task_dep`, `calc_dep` and, for tasks that
/// are going to run, `setup`. Edges of the graph point from a dependency to
/// the node waiting on it.
pub struct TaskDispatcher {
    /// Definitions not materialized yet.
    tasks: TaskMap,
    graph: DiGraph<ExecNode, ()>,
    nodes: HashMap<String, NodeIndex>,
    roots: VecDeque<String>,
    ready: VecDeque<NodeIndex>,
    waiting: HashSet<NodeIndex>,
    current: Option<NodeIndex>,
}

impl TaskDispatcher {
    pub fn new(tasks: TaskMap, selected: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tasks,
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            roots: selected.into_iter().map(Into::into).collect(),
            ready: VecDeque::new(),
            waiting: HashSet::new(),
            current: None,
        }
    }

    pub fn node(&self, ix: NodeIndex) -> &ExecNode {
        &self.graph[ix]
    }

    pub fn node_mut(&mut self, ix: NodeIndex) -> &mut ExecNode {
        &mut self.graph[ix]
    }

    pub fn find(&self, name: &str) -> Option<NodeIndex> {
        self.nodes.get(name).copied()
    }

    /// Every task, materialized or not.
    pub fn task(&self, name: &str) -> Option<&Task> {
        match self.nodes.get(name) {
            Some(&ix) => Some(&self.graph[ix].task),
            None => self.tasks.get(name),
        }
    }

    /// Gives all tasks back, with the runtime state of those that took part
    /// in the run.
    pub fn into_tasks(self) -> TaskMap {
        let mut tasks = self.tasks;
        let (nodes, _) = self.graph.into_nodes_edges();
        for node in nodes {
            let task = node.weight.task;
            tasks.insert(task.name.clone(), task);
        }
        tasks
    }

    /// Returns the next ready node, [`Dispatch::Hold`], or `None` once every
    /// selected task went through.
    ///
    /// `processed` is the node handed out earlier that the runner has
    /// finished with: selected and skipped, executed, or deferred for setup.
    pub fn next(&mut self, processed: Option<NodeIndex>) -> Result<Option<Dispatch>, InvalidTask> {
        if let Some(ix) = processed {
            self.update_waiting(ix)?;
        }

        loop {
            let ix = match self.current {
                Some(ix) => ix,
                None => {
                    if let Some(ix) = self.ready.pop_front() {
                        ix
                    } else if let Some(name) = self.roots.pop_front() {
                        if self.nodes.contains_key(&name) {
                            continue;
                        }
                        let task = self
                            .tasks
                            .remove(&name)
                            .ok_or_else(|| InvalidTask::Unknown(name.clone()))?;
                        self.insert(ExecNode::new(task, None))
                    } else if !self.waiting.is_empty() {
                        return Ok(Some(Dispatch::Hold));
                    } else {
                        return Ok(None);
                    }
                }
            };

            self.current = Some(ix);
            match self.step(ix)? {
                Step::Ready => {
                    tracing::debug!("dispatch: '{}' ready", self.graph[ix].name());
                    return Ok(Some(Dispatch::Ready(ix)));
                }
                Step::Wait => {
                    self.waiting.insert(ix);
                    self.current = None;
                }
                Step::Done => self.current = None,
            }
        }
    }

    fn insert(&mut self, node: ExecNode) -> NodeIndex {
        let name = node.name().to_string();
        let ix = self.graph.add_node(node);
        self.nodes.insert(name, ix);
        ix
    }

    /// Advances the state machine of one node.
    fn step(&mut self, ix: NodeIndex) -> Result<Step, InvalidTask> {
        match self.graph[ix].stage {
            Stage::Deps => {
                self.add_deps(ix)?;
                if self.graph[ix].is_waiting() {
                    return Ok(Step::Wait);
                }
                self.graph[ix].stage = Stage::Selected;
                Ok(Step::Ready)
            }
            Stage::Selected | Stage::SelectWait => {
                let node = &mut self.graph[ix];
                if node.task.setup.is_empty() {
                    node.stage = Stage::Finished;
                    return Ok(Step::Done);
                }
                match node.run_status {
                    RunStatus::Pending => {
                        node.wait_select = true;
                        node.stage = Stage::SelectWait;
                        Ok(Step::Wait)
                    }
                    RunStatus::Run => self.add_setup(ix),
                    _ => {
                        node.stage = Stage::Finished;
                        Ok(Step::Done)
                    }
                }
            }
            Stage::Setup => {
                if self.graph[ix].is_waiting() {
                    return Ok(Step::Wait);
                }
                self.graph[ix].stage = Stage::Finished;
                Ok(Step::Ready)
            }
            Stage::Finished => Ok(Step::Done),
        }
    }

    /// Materializes pending `calc_dep` and `task_dep` of a node until no new
    /// ones show up. Results of settled calc_dep tasks may add more.
    fn add_deps(&mut self, ix: NodeIndex) -> Result<(), InvalidTask> {
        let mut created = Vec::new();

        loop {
            let node = &mut self.graph[ix];
            let calc_dep = std::mem::take(&mut node.calc_dep);
            let task_dep = std::mem::take(&mut node.task_dep);
            if calc_dep.is_empty() && task_dep.is_empty() {
                break;
            }

            for name in calc_dep {
                let dep = self.gen_node(ix, &name, &mut created)?;
                self.add_wait_run(ix, dep, DepKind::Calc)?;
            }
            for name in task_dep {
                let dep = self.gen_node(ix, &name, &mut created)?;
                self.add_wait_run(ix, dep, DepKind::Task)?;
            }
        }

        self.schedule(created);
        Ok(())
    }

    fn add_setup(&mut self, ix: NodeIndex) -> Result<Step, InvalidTask> {
        self.graph[ix].stage = Stage::Setup;

        let mut created = Vec::new();
        for name in self.graph[ix].task.setup.clone() {
            let dep = self.gen_node(ix, &name, &mut created)?;
            self.add_wait_run(ix, dep, DepKind::Task)?;
        }
        self.schedule(created);

        if self.graph[ix].is_waiting() {
            return Ok(Step::Wait);
        }
        self.graph[ix].stage = Stage::Finished;
        Ok(Step::Ready)
    }

    /// Puts nodes in front of the ready queue keeping their order, so that
    /// the walk stays depth first.
    fn schedule(&mut self, created: Vec<NodeIndex>) {
        for ix in created.into_iter().rev() {
            self.ready.push_front(ix);
        }
    }

    /// Finds or creates the node of a dependency of `parent`.
    fn gen_node(
        &mut self,
        parent: NodeIndex,
        name: &str,
        created: &mut Vec<NodeIndex>,
    ) -> Result<NodeIndex, InvalidTask> {
        let ancestors = &self.graph[parent].ancestors;
        if ancestors.iter().any(|a| a == name) {
            let mut cycle = ancestors.clone();
            cycle.push(name.to_string());
            return Err(InvalidTask::Cycle(cycle));
        }

        if let Some(&ix) = self.nodes.get(name) {
            return Ok(ix);
        }

        let task = self.tasks.remove(name).ok_or_else(|| InvalidTask::UnknownDependency {
            task: self.graph[parent].name().to_string(),
            dep: name.to_string(),
        })?;
        let node = ExecNode::new(task, Some((parent, &self.graph[parent])));
        let ix = self.insert(node);
        created.push(ix);
        Ok(ix)
    }

    /// Makes `ix` wait on `dep` unless `dep` has already settled.
    fn add_wait_run(
        &mut self,
        ix: NodeIndex,
        dep: NodeIndex,
        kind: DepKind,
    ) -> Result<(), InvalidTask> {
        let status = self.graph[dep].run_status;
        let name = self.graph[dep].name().to_string();

        if !status.is_settled() {
            self.graph.update_edge(dep, ix, ());
            let node = &mut self.graph[ix];
            match kind {
                DepKind::Task => node.wait_run.insert(name),
                DepKind::Calc => node.wait_run_calc.insert(name),
            };
            return Ok(());
        }

        self.graph[ix].parent_status(&name, status, kind);
        if kind == DepKind::Calc {
            self.process_calc(ix, dep)?;
        }
        Ok(())
    }

    /// Folds the values of a succeeded calc_dep task into the node.
    fn process_calc(&mut self, ix: NodeIndex, dep: NodeIndex) -> Result<(), InvalidTask> {
        if !matches!(self.graph[dep].run_status, RunStatus::Done | RunStatus::UpToDate) {
            return Ok(());
        }

        let values = self.graph[dep].task.values.clone();
        let node = &mut self.graph[ix];
        let new = node.task.update_deps(&values)?;
        node.task_dep.extend(new.task_dep);
        node.calc_dep.extend(new.calc_dep);
        Ok(())
    }

    /// Lets the nodes waiting on `ix` know it has settled.
    /// Woken nodes go to the front of the ready queue, in the order they
    /// started waiting.
    fn update_waiting(&mut self, ix: NodeIndex) -> Result<(), InvalidTask> {
        if self.graph[ix].wait_select {
            self.graph[ix].wait_select = false;
            self.waiting.remove(&ix);
            self.ready.push_front(ix);
        }

        let status = self.graph[ix].run_status;
        if !status.is_settled() {
            return Ok(());
        }

        let name = self.graph[ix].name().to_string();
        // petgraph lists the newest edge first
        let mut dependents: Vec<_> = self
            .graph
            .neighbors_directed(ix, Direction::Outgoing)
            .collect();
        dependents.reverse();

        let mut woken = Vec::new();
        for dependent in dependents {
            let node = &mut self.graph[dependent];
            let mut wake = false;

            if node.wait_run.remove(&name) {
                node.parent_status(&name, status, DepKind::Task);
                wake = !node.is_waiting();
            }
            if node.wait_run_calc.remove(&name) {
                node.parent_status(&name, status, DepKind::Calc);
                self.process_calc(dependent, ix)?;
                wake = true;
            }

            if wake && self.waiting.remove(&dependent) {
                woken.push(dependent);
            }
        }

        self.schedule(woken);
        Ok(())
    }
}

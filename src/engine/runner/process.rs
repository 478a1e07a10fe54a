use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use petgraph::graph::NodeIndex;

use super::{Job, RunOptions, RunResult, Runner, Strategy};
use crate::engine::dispatcher::TaskDispatcher;
use crate::error::{ExitRequest, RunError, WorkerError};
use crate::report::{ReportMethod, Reporter};
use crate::store::DependencyStore;
use crate::task::TaskMap;
use crate::worker::{self, ChannelOutbox, Envelope, Message, Order, WORKER_ENV};

/// A running worker as seen by the coordinator.
pub trait WorkerHandle {
    fn send(&mut self, order: &Order) -> Result<(), WorkerError>;

    /// Waits for the worker to end. Called once, after its last order.
    fn join(self: Box<Self>) -> Result<(), WorkerError>;
}

/// Starts workers. Everything a worker sends goes to `sender`, tagged with
/// its number, and ends with an envelope carrying no message.
pub trait Spawn {
    fn spawn(
        &mut self,
        worker: usize,
        sender: Sender<Envelope>,
    ) -> Result<Box<dyn WorkerHandle>, WorkerError>;
}

/// Runs workers as child processes of a program that serves orders on its
/// stdin when [`WORKER_ENV`] is set, see [`worker::serve_stdio`].
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Spawn for ProcessSpawner {
    fn spawn(
        &mut self,
        worker: usize,
        sender: Sender<Envelope>,
    ) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(WorkerError::Lost(worker))?;
        let stdout = child.stdout.take().ok_or(WorkerError::Lost(worker))?;
        tracing::debug!("started worker {worker} as process {}", child.id());

        let reader = std::thread::spawn(move || {
            let mut stdout = BufReader::new(stdout);
            loop {
                let message = match worker::read_frame::<Message>(&mut stdout) {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(err) => Message::Fatal {
                        message: err.to_string(),
                    },
                };
                let fatal = matches!(message, Message::Fatal { .. });
                let envelope = Envelope {
                    worker,
                    message: Some(message),
                };
                if sender.send(envelope).is_err() || fatal {
                    break;
                }
            }
            let _ = sender.send(Envelope { worker, message: None });
        });

        Ok(Box::new(ProcessHandle {
            child,
            stdin: Some(BufWriter::new(stdin)),
            reader,
        }))
    }
}

struct ProcessHandle {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    reader: JoinHandle<()>,
}

impl WorkerHandle for ProcessHandle {
    fn send(&mut self, order: &Order) -> Result<(), WorkerError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerError::Remote("worker input is closed".into()))?;
        ciborium::into_writer(order, &mut *stdin)?;
        stdin.flush()?;
        Ok(())
    }

    fn join(mut self: Box<Self>) -> Result<(), WorkerError> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        let _ = self.reader.join();
        match status.success() {
            true => Ok(()),
            false => Err(WorkerError::Remote(format!("worker process ended with {status}"))),
        }
    }
}

/// Runs workers as threads of this process, each with its own copy of the
/// tasks. Orders and messages take the same path as with processes, minus
/// the encoding.
#[derive(Debug, Clone)]
pub struct LocalSpawner {
    tasks: TaskMap,
}

impl LocalSpawner {
    pub fn new(tasks: TaskMap) -> Self {
        Self { tasks }
    }
}

impl Spawn for LocalSpawner {
    fn spawn(
        &mut self,
        worker: usize,
        sender: Sender<Envelope>,
    ) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        let (orders, inbox) = channel::<Order>();
        let tasks = self.tasks.clone();

        let thread = std::thread::Builder::new()
            .name(format!("tasuki-worker-{worker}"))
            .spawn(move || {
                let mut outbox = ChannelOutbox {
                    worker,
                    sender: sender.clone(),
                };
                let result = worker::serve(&tasks, || Ok(inbox.recv().ok()), &mut outbox);
                let _ = sender.send(Envelope { worker, message: None });
                result
            })?;

        Ok(Box::new(LocalHandle { orders, thread }))
    }
}

struct LocalHandle {
    orders: Sender<Order>,
    thread: JoinHandle<Result<(), WorkerError>>,
}

impl WorkerHandle for LocalHandle {
    fn send(&mut self, order: &Order) -> Result<(), WorkerError> {
        self.orders
            .send(order.clone())
            .map_err(|_| WorkerError::Remote("worker thread is gone".into()))
    }

    fn join(self: Box<Self>) -> Result<(), WorkerError> {
        drop(self.orders);
        self.thread
            .join()
            .map_err(|_| WorkerError::Remote("worker thread panicked".into()))?
    }
}

static AVAILABLE: LazyLock<bool> = LazyLock::new(|| std::env::current_exe().is_ok());

struct Worker {
    handle: Box<dyn WorkerHandle>,
    /// Sent `Shutdown`, or stopped on its own.
    done: bool,
}

/// Bookkeeping of the coordinator loop.
#[derive(Default)]
struct Pool {
    busy: HashMap<usize, NodeIndex>,
    idle: VecDeque<usize>,
    /// Workers whose message stream is still open.
    live: usize,
    exit: Option<ExitRequest>,
    error: Option<RunError>,
}

impl Pool {
    fn fail(&mut self, err: RunError) {
        tracing::error!("{err}");
        self.error.get_or_insert(err);
    }
}

/// Executes actions in worker processes.
///
/// Selection, the store and the reporter stay with the coordinator. A
/// worker executes one task at a time and reports back; reporter calls made
/// on the worker side are replayed here.
pub struct ProcessRunner<D, R, S = ProcessSpawner> {
    base: Runner<D, R>,
    spawner: S,
    num_process: usize,
    workers: Vec<Worker>,
}

impl<D: DependencyStore, R: Reporter, S: Spawn> ProcessRunner<D, R, S> {
    pub fn new(store: D, reporter: R, options: RunOptions, num_process: usize, spawner: S) -> Self {
        Self {
            base: Runner::new(store, reporter, options),
            spawner,
            num_process: num_process.max(1),
            workers: Vec::new(),
        }
    }

    /// Whether worker processes can be started on this platform.
    pub fn available() -> bool {
        *AVAILABLE
    }

    /// Starts one worker per available job, up to `num_process`.
    fn start_workers(
        &mut self,
        dispatcher: &mut TaskDispatcher,
        sender: &Sender<Envelope>,
        pool: &mut Pool,
    ) -> Result<(), RunError> {
        for worker in 0..self.num_process {
            let Some(job) = self.base.next_job(dispatcher, None)? else {
                break;
            };

            let handle = self.spawner.spawn(worker, sender.clone())?;
            self.workers.push(Worker { handle, done: false });
            pool.live += 1;
            self.assign(dispatcher, worker, job, pool);
        }
        Ok(())
    }

    fn assign(&mut self, dispatcher: &TaskDispatcher, worker: usize, job: Job, pool: &mut Pool) {
        let order = match job {
            Job::Run(ix) => {
                let task = &dispatcher.node(ix).task;
                self.base.register_teardown(task);
                pool.busy.insert(worker, ix);
                Order::Run(task.state())
            }
            Job::Hold => {
                pool.idle.push_back(worker);
                Order::Hold
            }
        };

        if let Err(err) = self.workers[worker].handle.send(&order) {
            pool.busy.remove(&worker);
            self.base.stop();
            pool.fail(err.into());
        }
    }

    fn shutdown(&mut self, worker: usize) {
        let entry = &mut self.workers[worker];
        if entry.done {
            return;
        }
        entry.done = true;
        if let Err(err) = entry.handle.send(&Order::Shutdown) {
            tracing::debug!("worker {worker}: {err}");
        }
    }

    /// Hands out jobs to free workers, the one that just reported first.
    fn refill(
        &mut self,
        dispatcher: &mut TaskDispatcher,
        first: Option<usize>,
        completed: Option<NodeIndex>,
        pool: &mut Pool,
    ) {
        let mut free: VecDeque<usize> = std::mem::take(&mut pool.idle);
        if let Some(worker) = first {
            free.push_front(worker);
        }

        let mut completed = completed;
        while let Some(worker) = free.pop_front() {
            let job = match self.base.next_job(dispatcher, completed.take()) {
                Ok(job) => job,
                Err(err) => {
                    self.base.stop();
                    pool.fail(err);
                    None
                }
            };

            match job {
                Some(Job::Hold) => {
                    // nothing else is ready either
                    pool.idle.push_back(worker);
                    pool.idle.extend(free.drain(..));
                }
                Some(job) => self.assign(dispatcher, worker, job, pool),
                None => self.shutdown(worker),
            }
        }

        if pool.busy.is_empty() && !pool.idle.is_empty() {
            pool.fail(RunError::Stalled);
            self.base.stop();
            for worker in std::mem::take(&mut pool.idle) {
                self.shutdown(worker);
            }
        }
    }

    fn handle(&mut self, dispatcher: &mut TaskDispatcher, envelope: Envelope, pool: &mut Pool) {
        let worker = envelope.worker;
        let Some(message) = envelope.message else {
            pool.live -= 1;
            self.workers[worker].done = true;
            if pool.busy.remove(&worker).is_some() {
                self.base.stop();
                pool.fail(WorkerError::Lost(worker).into());
            }
            pool.idle.retain(|w| *w != worker);
            return;
        };

        match message {
            Message::Report { name, method } => {
                let Some(ix) = dispatcher.find(&name) else {
                    tracing::warn!("worker {worker}: report for unknown task '{name}'");
                    return;
                };
                match method.parse::<ReportMethod>() {
                    Ok(method) => {
                        let task = &dispatcher.node(ix).task;
                        method.call(&mut self.base.reporter, task);
                    }
                    Err(err) => tracing::warn!("worker {worker}: cannot replay '{}'", err.0),
                }
            }
            Message::Done { name, failure, output } => {
                let Some(ix) = pool.busy.remove(&worker) else {
                    tracing::warn!("worker {worker}: unexpected result for '{name}'");
                    return;
                };
                let node = dispatcher.node_mut(ix);
                node.task.apply_output(output);
                self.base.process_task_result(node, failure);
                self.refill(dispatcher, Some(worker), Some(ix), pool);
            }
            Message::Exit { name, code } => {
                tracing::info!("task '{name}': requested exit {code}");
                pool.busy.remove(&worker);
                self.workers[worker].done = true;
                pool.exit.get_or_insert(ExitRequest(code));
                self.base.stop();
                self.refill(dispatcher, None, None, pool);
            }
            Message::Fatal { message } => {
                pool.busy.remove(&worker);
                self.workers[worker].done = true;
                self.base.stop();
                pool.fail(WorkerError::Remote(message).into());
                self.refill(dispatcher, None, None, pool);
            }
        }
    }

    fn coordinate(
        &mut self,
        dispatcher: &mut TaskDispatcher,
        receiver: &Receiver<Envelope>,
        pool: &mut Pool,
    ) {
        while pool.live > 0 {
            let Ok(envelope) = receiver.recv() else {
                break;
            };
            self.handle(dispatcher, envelope, pool);
        }
    }
}

impl<D: DependencyStore, R: Reporter, S: Spawn> Strategy for ProcessRunner<D, R, S> {
    fn run_tasks(&mut self, dispatcher: &mut TaskDispatcher) -> Result<(), RunError> {
        let (sender, receiver) = channel();
        let mut pool = Pool::default();

        if let Err(err) = self.start_workers(dispatcher, &sender, &mut pool) {
            self.base.stop();
            pool.fail(err);
        }
        // only workers hold senders from here on
        drop(sender);

        // a run that starts with a hold has nothing in flight
        self.refill(dispatcher, None, None, &mut pool);
        self.coordinate(dispatcher, &receiver, &mut pool);

        match (pool.exit, pool.error) {
            (Some(request), _) => Err(request.into()),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(()),
        }
    }

    fn finish(&mut self) -> RunResult {
        for worker in 0..self.workers.len() {
            self.shutdown(worker);
        }
        for (ix, worker) in std::mem::take(&mut self.workers).into_iter().enumerate() {
            if let Err(err) = worker.handle.join() {
                tracing::warn!("worker {ix}: {err}");
                self.base.reporter.runtime_error(&err.to_string());
            }
        }
        self.base.finish_run()
    }

    fn abort(&mut self, error: &RunError) {
        self.base.abort_run(error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::action::Action;
    use crate::store::FileStore;
    use crate::task::Task;
    use crate::testing::{self, FakeReporter};

    type LocalRunner = ProcessRunner<FileStore, FakeReporter, LocalSpawner>;

    fn local(
        tasks: &TaskMap,
        store: FileStore,
        reporter: FakeReporter,
        options: RunOptions,
    ) -> LocalRunner {
        let spawner = LocalSpawner::new(tasks.clone());
        ProcessRunner::new(store, reporter, options, 1, spawner)
    }

    testing::strategy_tests!(local);

    type Sent = Arc<Mutex<Vec<(usize, String)>>>;

    /// Records every order sent to every worker.
    struct Recording {
        inner: LocalSpawner,
        sent: Sent,
    }

    struct RecordingHandle {
        inner: Box<dyn WorkerHandle>,
        worker: usize,
        sent: Sent,
    }

    impl Spawn for Recording {
        fn spawn(
            &mut self,
            worker: usize,
            sender: Sender<Envelope>,
        ) -> Result<Box<dyn WorkerHandle>, WorkerError> {
            Ok(Box::new(RecordingHandle {
                inner: self.inner.spawn(worker, sender)?,
                worker,
                sent: self.sent.clone(),
            }))
        }
    }

    impl WorkerHandle for RecordingHandle {
        fn send(&mut self, order: &Order) -> Result<(), WorkerError> {
            let label = match order {
                Order::Run(state) => state.name.clone(),
                Order::Hold => "hold".into(),
                Order::Shutdown => "shutdown".into(),
            };
            self.sent.lock().unwrap().push((self.worker, label));
            self.inner.send(order)
        }

        fn join(self: Box<Self>) -> Result<(), WorkerError> {
            self.inner.join()
        }
    }

    fn start(
        tasks: Vec<Task>,
        selected: &[&str],
        num_process: usize,
    ) -> (Vec<(usize, String)>, usize, Result<(), RunError>) {
        let tasks = crate::task::task_map(tasks);
        let sent = Sent::default();
        let spawner = Recording {
            inner: LocalSpawner::new(tasks.clone()),
            sent: sent.clone(),
        };
        let mut runner = ProcessRunner::new(
            FileStore::in_memory(),
            FakeReporter::default(),
            RunOptions::default(),
            num_process,
            spawner,
        );
        let mut dispatcher = TaskDispatcher::new(tasks, selected.iter().copied());

        let (sender, _receiver) = channel();
        let mut pool = Pool::default();
        let result = runner.start_workers(&mut dispatcher, &sender, &mut pool);
        let started = runner.workers.len();
        runner.finish();

        let sent = sent.lock().unwrap().clone();
        (sent, started, result)
    }

    fn noop(name: &str) -> Task {
        Task::builder(name).action(Action::func(|_| Ok(()))).build()
    }

    fn order(worker: usize, label: &str) -> (usize, String) {
        (worker, label.to_string())
    }

    #[test]
    fn test_start_one_job_per_process() {
        let tasks = vec![noop("t1"), noop("t2"), noop("t3")];
        let (sent, started, result) = start(tasks, &["t1", "t2", "t3"], 2);
        assert!(result.is_ok());
        assert_eq!(started, 2);
        assert_eq!(sent[..2].to_vec(), vec![order(0, "t1"), order(1, "t2")]);
    }

    #[test]
    fn test_start_no_more_processes_than_jobs() {
        let (sent, started, _) = start(vec![noop("t1"), noop("t2")], &["t1"], 2);
        assert_eq!(started, 1);
        assert_eq!(sent, vec![order(0, "t1"), order(0, "shutdown")]);
    }

    #[test]
    fn test_start_dependent_gets_hold() {
        let tasks = vec![Task::builder("t1").task_dep(["t2"]).build(), noop("t2")];
        let (sent, started, _) = start(tasks, &["t1"], 2);
        assert_eq!(started, 2);
        assert_eq!(sent[..2].to_vec(), vec![order(0, "t2"), order(1, "hold")]);
    }

    fn pair(
        tasks: &TaskMap,
        store: FileStore,
        reporter: FakeReporter,
        options: RunOptions,
    ) -> LocalRunner {
        let spawner = LocalSpawner::new(tasks.clone());
        ProcessRunner::new(store, reporter, options, 2, spawner)
    }

    #[test]
    fn test_held_worker_picks_up_dependent() {
        let tasks = vec![
            Task::builder("t1")
                .task_dep(["t2", "t3"])
                .action(Action::func(|_| Ok(())))
                .build(),
            noop("t2"),
            noop("t3"),
            noop("t4"),
        ];
        let options = RunOptions::default();
        let (result, log, _) = testing::run_fresh(&pair, tasks, &["t1", "t4"], options);
        assert_eq!(result, Ok(RunResult::Success));
        for name in ["t1", "t2", "t3", "t4"] {
            assert!(log.contains(&("success", name.to_string())), "{name} missing from {log:?}");
        }
        let pos = |(kind, name): (&'static str, &str)| {
            log.iter().position(|e| *e == (kind, name.to_string()))
        };
        assert!(pos(("success", "t2")) < pos(("execute", "t1")));
        assert!(pos(("success", "t3")) < pos(("execute", "t1")));
    }

    #[test]
    fn test_available() {
        assert!(ProcessRunner::<FileStore, FakeReporter>::available());
    }
}

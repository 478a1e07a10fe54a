//! The worker side of the process pool.
//!
//! A worker receives [`Order`]s and answers with [`Message`]s. Out of
//! process the two travel as back to back CBOR values over the worker's
//! stdin and stdout, so actions running in a worker must not print to the
//! real stdout; command actions capture their output and closures write to
//! [`ActionContext::out`](crate::ActionContext::out).
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::sync::mpsc::Sender;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ExitRequest, Failure, WorkerError};
use crate::report::{ReportMethod, Reporter};
use crate::task::{Task, TaskMap, TaskOutput, TaskState};

/// Set in the environment of worker processes.
pub const WORKER_ENV: &str = "TASUKI_WORKER";

/// Whether this process was started as a worker.
pub fn is_worker() -> bool {
    std::env::var(WORKER_ENV).is_ok_and(|v| v == "1")
}

/// Coordinator to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Order {
    Run(TaskState),
    /// Nothing to do right now, wait for the next order.
    Hold,
    Shutdown,
}

/// Worker to coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Done {
        name: String,
        failure: Option<Failure>,
        output: TaskOutput,
    },
    /// A reporter call made by the worker, replayed by the coordinator.
    Report { name: String, method: String },
    /// The task asked to terminate the run. The worker stops after this.
    Exit { name: String, code: i32 },
    /// The worker cannot go on.
    Fatal { message: String },
}

/// A message tagged with the worker it came from. `None` means the worker
/// will not send anything anymore.
#[derive(Debug)]
pub struct Envelope {
    pub worker: usize,
    pub message: Option<Message>,
}

/// Where a worker sends its messages.
pub trait Outbox {
    fn send(&mut self, message: Message) -> Result<(), WorkerError>;
}

/// Writes messages as CBOR to a stream.
pub struct CborOutbox<W: Write>(pub W);

impl<W: Write> Outbox for CborOutbox<W> {
    fn send(&mut self, message: Message) -> Result<(), WorkerError> {
        ciborium::into_writer(&message, &mut self.0)?;
        self.0.flush()?;
        Ok(())
    }
}

/// Hands messages to a coordinator in the same process.
pub struct ChannelOutbox {
    pub worker: usize,
    pub sender: Sender<Envelope>,
}

impl Outbox for ChannelOutbox {
    fn send(&mut self, message: Message) -> Result<(), WorkerError> {
        let envelope = Envelope {
            worker: self.worker,
            message: Some(message),
        };
        self.sender
            .send(envelope)
            .map_err(|_| WorkerError::Remote("coordinator is gone".into()))
    }
}

/// Forwards reporter calls to the coordinator by method name. Only the
/// methods taking just a task are forwarded; the rest are dropped.
pub struct ProxyReporter<'a, O: Outbox + ?Sized> {
    outbox: &'a mut O,
    error: Option<WorkerError>,
}

impl<'a, O: Outbox + ?Sized> ProxyReporter<'a, O> {
    pub fn new(outbox: &'a mut O) -> Self {
        Self { outbox, error: None }
    }

    /// The first error hit while forwarding, if any.
    pub fn finish(self) -> Result<(), WorkerError> {
        self.error.map_or(Ok(()), Err)
    }

    fn forward(&mut self, method: ReportMethod, task: &Task) {
        if self.error.is_some() {
            return;
        }
        let message = Message::Report {
            name: task.name.clone(),
            method: method.as_str().to_string(),
        };
        if let Err(err) = self.outbox.send(message) {
            self.error = Some(err);
        }
    }
}

impl<O: Outbox + ?Sized> Reporter for ProxyReporter<'_, O> {
    fn get_status(&mut self, task: &Task) {
        self.forward(ReportMethod::GetStatus, task);
    }

    fn execute_task(&mut self, task: &Task) {
        self.forward(ReportMethod::ExecuteTask, task);
    }

    fn add_success(&mut self, task: &Task) {
        self.forward(ReportMethod::AddSuccess, task);
    }

    fn skip_uptodate(&mut self, task: &Task) {
        self.forward(ReportMethod::SkipUptodate, task);
    }

    fn skip_ignore(&mut self, task: &Task) {
        self.forward(ReportMethod::SkipIgnore, task);
    }

    fn teardown_task(&mut self, task: &Task) {
        self.forward(ReportMethod::TeardownTask, task);
    }
}

/// Reads one CBOR value, `None` at a clean end of stream.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>, WorkerError> {
    match ciborium::from_reader(reader) {
        Ok(value) => Ok(Some(value)),
        Err(ciborium::de::Error::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Executes orders until told to shut down or the inbox runs dry.
pub fn serve(
    tasks: &TaskMap,
    mut inbox: impl FnMut() -> Result<Option<Order>, WorkerError>,
    outbox: &mut dyn Outbox,
) -> Result<(), WorkerError> {
    while let Some(order) = inbox()? {
        let state = match order {
            Order::Run(state) => state,
            Order::Hold => continue,
            Order::Shutdown => break,
        };

        let Some(task) = tasks.get(&state.name) else {
            let message = format!("task '{}' is not known to the worker", state.name);
            outbox.send(Message::Fatal {
                message: message.clone(),
            })?;
            return Err(WorkerError::Remote(message));
        };

        let mut task = task.clone();
        task.apply_state(state);

        let mut reporter = ProxyReporter::new(outbox);
        reporter.execute_task(&task);
        reporter.finish()?;

        match task.execute() {
            Ok(failure) => outbox.send(Message::Done {
                name: task.name.clone(),
                failure,
                output: task.output(),
            })?,
            Err(ExitRequest(code)) => {
                outbox.send(Message::Exit {
                    name: task.name.clone(),
                    code,
                })?;
                break;
            }
        }
    }

    Ok(())
}

/// Serves orders arriving on stdin, answering on stdout.
pub fn serve_stdio(tasks: &TaskMap) -> Result<(), WorkerError> {
    let mut stdin = BufReader::new(std::io::stdin().lock());
    let mut outbox = CborOutbox(BufWriter::new(std::io::stdout().lock()));
    tracing::debug!("worker {} ready", std::process::id());
    serve(tasks, || read_frame(&mut stdin), &mut outbox)
}

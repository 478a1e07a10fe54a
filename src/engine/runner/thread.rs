use std::sync::mpsc::channel;

use petgraph::graph::NodeIndex;
use tracing::Level;

use super::{Job, RunOptions, RunResult, Runner, Strategy};
use crate::engine::dispatcher::TaskDispatcher;
use crate::error::{ExitRequest, Failure, RunError};
use crate::report::Reporter;
use crate::store::DependencyStore;
use crate::task::TaskOutput;

type Finished = (NodeIndex, Result<Option<Failure>, ExitRequest>, TaskOutput);

/// Executes actions on a pool of worker threads.
///
/// Everything except the actions themselves stays on the calling thread:
/// the dispatcher, the store and the reporter are never shared. Workers get
/// a clone of the task and send back what executing it produced.
pub struct ThreadRunner<D, R> {
    base: Runner<D, R>,
    num_threads: usize,
}

impl<D: DependencyStore, R: Reporter> ThreadRunner<D, R> {
    pub fn new(store: D, reporter: R, options: RunOptions, num_threads: usize) -> Self {
        Self {
            base: Runner::new(store, reporter, options),
            num_threads: num_threads.max(1),
        }
    }
}

impl<D: DependencyStore, R: Reporter> Strategy for ThreadRunner<D, R> {
    fn run_tasks(&mut self, dispatcher: &mut TaskDispatcher) -> Result<(), RunError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .thread_name(|i| format!("tasuki-{i}"))
            .build()?;

        let limit = self.num_threads;
        let base = &mut self.base;
        let (sender, receiver) = channel::<Finished>();

        let mut exit = None;
        let mut error = None;

        pool.in_place_scope(|s| {
            let mut in_flight = 0;
            let mut completed = None;

            loop {
                while exit.is_none() && error.is_none() && in_flight < limit {
                    let ix = match base.next_job(dispatcher, completed.take()) {
                        Ok(Some(Job::Run(ix))) => ix,
                        Ok(Some(Job::Hold)) => {
                            if in_flight == 0 {
                                error = Some(RunError::Stalled);
                            }
                            break;
                        }
                        Ok(None) => break,
                        Err(err) => {
                            base.stop();
                            error = Some(err);
                            break;
                        }
                    };

                    let mut task = dispatcher.node(ix).task.clone();
                    base.prepare_execute(&task);

                    let sender = sender.clone();
                    s.spawn(move |_| {
                        let span = tracing::span!(Level::INFO, "task", name = %task.name);
                        let _enter = span.enter();

                        let outcome = task.execute();
                        // the receiver outlives the scope
                        let _ = sender.send((ix, outcome, task.output()));
                    });
                    in_flight += 1;
                }

                if in_flight == 0 {
                    break;
                }

                let Ok((ix, outcome, output)) = receiver.recv() else {
                    break;
                };
                in_flight -= 1;

                let node = dispatcher.node_mut(ix);
                node.task.apply_output(output);
                match outcome {
                    Ok(failure) => {
                        base.process_task_result(node, failure);
                        completed = Some(ix);
                    }
                    Err(request) => {
                        tracing::info!("task '{}': requested exit {}", node.name(), request.0);
                        base.stop();
                        exit.get_or_insert(request);
                    }
                }
            }
        });

        match (exit, error) {
            (Some(request), _) => Err(request.into()),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(()),
        }
    }

    fn finish(&mut self) -> RunResult {
        self.base.finish_run()
    }

    fn abort(&mut self, error: &RunError) {
        self.base.abort_run(error);
    }
}

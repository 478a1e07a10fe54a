//! Observers of a run.
use std::io::Write;
use std::str::FromStr;

use console::style;

use crate::error::Failure;
use crate::task::Task;

/// Receives a notification at every transition of every task. All methods
/// default to doing nothing.
pub trait Reporter {
    /// A task is considered for execution.
    fn get_status(&mut self, _task: &Task) {}
    fn execute_task(&mut self, _task: &Task) {}
    fn add_success(&mut self, _task: &Task) {}
    fn add_failure(&mut self, _task: &Task, _failure: &Failure) {}
    fn skip_uptodate(&mut self, _task: &Task) {}
    fn skip_ignore(&mut self, _task: &Task) {}
    /// A teardown action failed.
    fn cleanup_error(&mut self, _task: &Task, _failure: &Failure) {}
    /// Something outside of any task went wrong.
    fn runtime_error(&mut self, _message: &str) {}
    fn teardown_task(&mut self, _task: &Task) {}
    fn complete_run(&mut self) {}
}

/// Reporter methods that take only a task, and so can be forwarded from a
/// worker by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMethod {
    GetStatus,
    ExecuteTask,
    AddSuccess,
    SkipUptodate,
    SkipIgnore,
    TeardownTask,
}

impl ReportMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportMethod::GetStatus => "get_status",
            ReportMethod::ExecuteTask => "execute_task",
            ReportMethod::AddSuccess => "add_success",
            ReportMethod::SkipUptodate => "skip_uptodate",
            ReportMethod::SkipIgnore => "skip_ignore",
            ReportMethod::TeardownTask => "teardown_task",
        }
    }

    pub fn call(self, reporter: &mut dyn Reporter, task: &Task) {
        match self {
            ReportMethod::GetStatus => reporter.get_status(task),
            ReportMethod::ExecuteTask => reporter.execute_task(task),
            ReportMethod::AddSuccess => reporter.add_success(task),
            ReportMethod::SkipUptodate => reporter.skip_uptodate(task),
            ReportMethod::SkipIgnore => reporter.skip_ignore(task),
            ReportMethod::TeardownTask => reporter.teardown_task(task),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethod(pub String);

impl FromStr for ReportMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "get_status" => ReportMethod::GetStatus,
            "execute_task" => ReportMethod::ExecuteTask,
            "add_success" => ReportMethod::AddSuccess,
            "skip_uptodate" => ReportMethod::SkipUptodate,
            "skip_ignore" => ReportMethod::SkipIgnore,
            "teardown_task" => ReportMethod::TeardownTask,
            _ => return Err(UnknownMethod(s.to_string())),
        })
    }
}

struct FailureReport {
    task: String,
    failure: Failure,
    out: String,
    err: String,
}

/// Prints progress as tasks go, and the collected failures at the end.
pub struct ConsoleReporter<W: Write> {
    out: W,
    failures: Vec<FailureReport>,
    runtime_errors: Vec<String>,
}

impl ConsoleReporter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            failures: Vec::new(),
            runtime_errors: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Reporter for ConsoleReporter<W> {
    fn execute_task(&mut self, task: &Task) {
        if !task.actions.is_empty() && !task.name.starts_with('_') {
            let _ = writeln!(self.out, "{}  {}", style(".").cyan(), task.name);
        }
    }

    fn add_failure(&mut self, task: &Task, failure: &Failure) {
        self.failures.push(FailureReport {
            task: task.name.clone(),
            failure: failure.clone(),
            out: task.out(),
            err: task.err(),
        });
    }

    fn skip_uptodate(&mut self, task: &Task) {
        if !task.name.starts_with('_') {
            let _ = writeln!(self.out, "{} {}", style("--").dim(), task.name);
        }
    }

    fn skip_ignore(&mut self, task: &Task) {
        let _ = writeln!(self.out, "{} {}", style("!!").yellow(), task.name);
    }

    fn cleanup_error(&mut self, task: &Task, failure: &Failure) {
        let _ = writeln!(
            self.out,
            "{} teardown of '{}': {failure}",
            style("ERROR").red().bold(),
            task.name
        );
    }

    fn runtime_error(&mut self, message: &str) {
        self.runtime_errors.push(message.to_string());
    }

    fn complete_run(&mut self) {
        for report in &self.failures {
            let _ = writeln!(self.out, "{}", style("#".repeat(60)).red());
            let label = match report.failure.is_error() {
                true => style("ERROR").red().bold(),
                false => style("FAILED").red(),
            };
            let _ = writeln!(self.out, "{label} - {}", report.task);
            let _ = writeln!(self.out, "{}", report.failure);
            if !report.out.is_empty() {
                let _ = writeln!(self.out, "{}\n{}", style("stdout:").dim(), report.out);
            }
            if !report.err.is_empty() {
                let _ = writeln!(self.out, "{}\n{}", style("stderr:").dim(), report.err);
            }
        }

        for message in &self.runtime_errors {
            let _ = writeln!(self.out, "{}", style("#".repeat(60)).red());
            let _ = writeln!(self.out, "{} {message}", style("ERROR").red().bold());
        }
        let _ = self.out.flush();
    }
}

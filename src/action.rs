use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::Command;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::core::Values;
use crate::error::{ExitRequest, Failure};

type ActionFn = dyn Fn(&mut ActionContext<'_>) -> anyhow::Result<Outcome> + Send + Sync;

/// What a closure action produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Success without a result.
    Done,
    /// Plain failure, the task fails but nothing went wrong.
    Fail,
    /// Success with a textual result.
    Text(String),
    /// Success. The map becomes the result and is merged into the task's
    /// saved values.
    Values(Values),
}

impl From<()> for Outcome {
    fn from(_: ()) -> Self {
        Outcome::Done
    }
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok { Outcome::Done } else { Outcome::Fail }
    }
}

impl From<String> for Outcome {
    fn from(text: String) -> Self {
        Outcome::Text(text)
    }
}

impl From<&str> for Outcome {
    fn from(text: &str) -> Self {
        Outcome::Text(text.to_string())
    }
}

impl From<Values> for Outcome {
    fn from(values: Values) -> Self {
        Outcome::Values(values)
    }
}

/// Everything a closure action can see while it runs. Output written to
/// `out` and `err` is captured on the action.
pub struct ActionContext<'a> {
    pub task: &'a str,
    /// Values resolved from `getargs`.
    pub options: &'a Values,
    pub targets: &'a [Utf8PathBuf],
    pub file_dep: &'a BTreeSet<Utf8PathBuf>,
    pub out: String,
    pub err: String,
}

/// The part of a task an action runs against.
#[derive(Clone, Copy)]
pub(crate) struct ActionEnv<'a> {
    pub task: &'a str,
    pub options: &'a Values,
    pub targets: &'a [Utf8PathBuf],
    pub file_dep: &'a BTreeSet<Utf8PathBuf>,
}

#[derive(Clone)]
enum ActionKind {
    Cmd(String),
    Func(Arc<ActionFn>),
}

/// A single deferred unit of work, either a shell command or a closure,
/// together with what its last execution captured.
#[derive(Clone)]
pub struct Action {
    kind: ActionKind,
    pub out: Option<String>,
    pub err: Option<String>,
    pub result: Option<Value>,
    pub values: Values,
}

impl Action {
    fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            out: None,
            err: None,
            result: None,
            values: Values::new(),
        }
    }

    /// A shell command. `%(targets)s`, `%(dependencies)s` and
    /// `%(<option>)s` are expanded before it runs.
    pub fn cmd(cmd: impl Into<String>) -> Self {
        Self::new(ActionKind::Cmd(cmd.into()))
    }

    pub fn func<F, O>(f: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<Outcome>,
    {
        Self::new(ActionKind::Func(Arc::new(move |ctx| f(ctx).map(Into::into))))
    }

    pub(crate) fn execute(&mut self, env: ActionEnv<'_>) -> Result<Option<Failure>, ExitRequest> {
        self.out = None;
        self.err = None;
        self.result = None;
        self.values.clear();

        match self.kind.clone() {
            ActionKind::Cmd(cmd) => Ok(self.execute_cmd(&cmd, env)),
            ActionKind::Func(f) => self.execute_func(&*f, env),
        }
    }

    fn execute_cmd(&mut self, cmd: &str, env: ActionEnv<'_>) -> Option<Failure> {
        let cmd = match expand(cmd, env) {
            Ok(cmd) => cmd,
            Err(failure) => return Some(failure),
        };

        let output = match shell(&cmd).output() {
            Ok(output) => output,
            Err(err) => return Some(Failure::Error(format!("Couldn't run '{cmd}': {err}"))),
        };

        let out = String::from_utf8_lossy(&output.stdout).into_owned();
        self.err = Some(String::from_utf8_lossy(&output.stderr).into_owned());
        self.result = Some(Value::String(out.clone()));
        self.out = Some(out);

        if output.status.success() {
            return None;
        }

        Some(match output.status.code() {
            Some(code) => Failure::Failed(format!("Command failed: '{cmd}' returned {code}")),
            None => Failure::Failed(format!("Command failed: '{cmd}' was terminated by a signal")),
        })
    }

    fn execute_func(
        &mut self,
        f: &ActionFn,
        env: ActionEnv<'_>,
    ) -> Result<Option<Failure>, ExitRequest> {
        let mut ctx = ActionContext {
            task: env.task,
            options: env.options,
            targets: env.targets,
            file_dep: env.file_dep,
            out: String::new(),
            err: String::new(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| f(&mut ctx)));
        self.out = Some(ctx.out);
        self.err = Some(ctx.err);

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                if let Some(exit) = err.downcast_ref::<ExitRequest>() {
                    return Err(*exit);
                }
                return Ok(Some(Failure::Error(format!("{err:#}"))));
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Action panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Action panicked: {s}")
                } else {
                    String::from("Action panicked with unknown payload")
                };
                return Ok(Some(Failure::Error(msg)));
            }
        };

        Ok(match outcome {
            Outcome::Done => None,
            Outcome::Fail => Some(Failure::Failed(format!("{self} returned false"))),
            Outcome::Text(text) => {
                self.result = Some(Value::String(text));
                None
            }
            Outcome::Values(values) => {
                self.result = Some(Value::Object(values.clone().into_iter().collect()));
                self.values = values;
                None
            }
        })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ActionKind::Cmd(cmd) => write!(f, "Cmd: {cmd}"),
            ActionKind::Func(_) => write!(f, "Fn"),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.to_string())
            .field("out", &self.out)
            .field("err", &self.err)
            .field("result", &self.result)
            .finish()
    }
}

/// Task files describe actions as plain command strings.
impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Action::cmd)
    }
}

#[cfg(unix)]
pub(crate) fn shell(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}

#[cfg(windows)]
pub(crate) fn shell(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}

/// Substitutes `%(key)s` placeholders. Any other `%` is left alone.
fn expand(cmd: &str, env: ActionEnv<'_>) -> Result<String, Failure> {
    let mut acc = String::with_capacity(cmd.len());
    let mut rest = cmd;

    while let Some(start) = rest.find("%(") {
        acc.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find(")s") else {
            acc.push_str(&rest[start..]);
            return Ok(acc);
        };

        let key = &after[..end];
        match key {
            "targets" => acc.push_str(&join(env.targets.iter())),
            "dependencies" => acc.push_str(&join(env.file_dep.iter())),
            _ => match env.options.get(key) {
                Some(Value::String(s)) => acc.push_str(s),
                Some(value) => acc.push_str(&value.to_string()),
                None => {
                    return Err(Failure::Error(format!(
                        "Command '{cmd}' uses unknown placeholder '{key}'"
                    )));
                }
            },
        }
        rest = &after[end + 2..];
    }

    acc.push_str(rest);
    Ok(acc)
}

fn join<'a>(paths: impl Iterator<Item = &'a Utf8PathBuf>) -> String {
    paths.map(|p| p.as_str()).collect::<Vec<_>>().join(" ")
}

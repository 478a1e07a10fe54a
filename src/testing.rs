//! Shared fixtures: a recording reporter and run scenarios every execution
//! strategy has to pass with identical notifications.
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde_json::json;

use crate::action::Action;
use crate::core::Values;
use crate::engine::{Dispatch, RunOptions, RunResult, RunStatus, Strategy, TaskDispatcher};
use crate::error::{ExitRequest, Failure};
use crate::report::Reporter;
use crate::store::{DependencyStore, FileStore};
use crate::task::{Task, TaskMap, task_map};

pub(crate) type Events = Vec<(&'static str, String)>;

pub(crate) fn events(list: &[(&'static str, &str)]) -> Events {
    list.iter().map(|(k, n)| (*k, n.to_string())).collect()
}

pub(crate) fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeReporter {
    log: Arc<Mutex<Events>>,
}

impl FakeReporter {
    pub(crate) fn events(&self) -> Events {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, kind: &'static str, name: &str) {
        self.log.lock().unwrap().push((kind, name.to_string()));
    }
}

impl Reporter for FakeReporter {
    fn get_status(&mut self, task: &Task) {
        self.push("start", &task.name);
    }

    fn execute_task(&mut self, task: &Task) {
        self.push("execute", &task.name);
    }

    fn add_success(&mut self, task: &Task) {
        self.push("success", &task.name);
    }

    fn add_failure(&mut self, task: &Task, _: &Failure) {
        self.push("fail", &task.name);
    }

    fn skip_uptodate(&mut self, task: &Task) {
        self.push("up-to-date", &task.name);
    }

    fn skip_ignore(&mut self, task: &Task) {
        self.push("ignore", &task.name);
    }

    fn cleanup_error(&mut self, task: &Task, _: &Failure) {
        self.push("cleanup_error", &task.name);
    }

    fn runtime_error(&mut self, message: &str) {
        self.push("runtime_error", message);
    }

    fn teardown_task(&mut self, task: &Task) {
        self.push("teardown", &task.name);
    }
}

pub(crate) type RunOutcome = (Result<RunResult, ExitRequest>, Events, TaskMap);

/// Builds the runner under test.
pub(crate) trait MakeRunner<S>: Fn(&TaskMap, FileStore, FakeReporter, RunOptions) -> S {}

impl<S, F: Fn(&TaskMap, FileStore, FakeReporter, RunOptions) -> S> MakeRunner<S> for F {}

/// Runs `selected` with a runner made by `make` and returns the result, the
/// notifications and the tasks with their runtime state.
pub(crate) fn run<S: Strategy>(
    make: &impl MakeRunner<S>,
    tasks: Vec<Task>,
    selected: &[&str],
    store: FileStore,
    options: RunOptions,
) -> RunOutcome {
    let tasks = task_map(tasks);
    let reporter = FakeReporter::default();
    let mut runner = make(&tasks, store, reporter.clone(), options);
    let mut dispatcher = TaskDispatcher::new(tasks, selected.iter().copied());
    let result = runner.run_all(&mut dispatcher);
    (result, reporter.events(), dispatcher.into_tasks())
}

/// Like [`run`], starting from an empty store.
pub(crate) fn run_fresh<S: Strategy>(
    make: &impl MakeRunner<S>,
    tasks: Vec<Task>,
    selected: &[&str],
    options: RunOptions,
) -> RunOutcome {
    run(make, tasks, selected, FileStore::in_memory(), options)
}

fn ok() -> Action {
    Action::func(|_| Ok(()))
}

fn fail() -> Action {
    Action::func(|_| Ok(false))
}

fn error() -> Action {
    Action::func(|_| -> anyhow::Result<()> { anyhow::bail!("broken") })
}

fn returns(values: serde_json::Value) -> Action {
    Action::func(move |_| Ok(serde_json::from_value::<Values>(values.clone())?))
}

fn continue_on_error() -> RunOptions {
    RunOptions {
        continue_on_error: true,
        ..RunOptions::default()
    }
}

pub(crate) fn scenario_success<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1").action(ok()).build(),
        Task::builder("t2").action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success));
    assert_eq!(
        log,
        events(&[
            ("start", "t1"),
            ("execute", "t1"),
            ("success", "t1"),
            ("start", "t2"),
            ("execute", "t2"),
            ("success", "t2"),
        ])
    );
}

pub(crate) fn scenario_failure_halts<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1").action(fail()).build(),
        Task::builder("t2").action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Failure));
    assert_eq!(log, events(&[("start", "t1"), ("execute", "t1"), ("fail", "t1")]));
}

pub(crate) fn scenario_error<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![Task::builder("t1").action(error()).build()];
    let (result, log, _) = run_fresh(make, tasks, &["t1"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Error));
    assert_eq!(log, events(&[("start", "t1"), ("execute", "t1"), ("fail", "t1")]));
}

pub(crate) fn scenario_continue<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1").action(fail()).build(),
        Task::builder("t2").action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2"], continue_on_error());
    assert_eq!(result, Ok(RunResult::Failure));
    assert_eq!(
        log,
        events(&[
            ("start", "t1"),
            ("execute", "t1"),
            ("fail", "t1"),
            ("start", "t2"),
            ("execute", "t2"),
            ("success", "t2"),
        ])
    );
}

pub(crate) fn scenario_continue_skips_dependents<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1").action(fail()).build(),
        Task::builder("t2").task_dep(["t1"]).action(ok()).build(),
        Task::builder("t3").action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2", "t3"], continue_on_error());
    assert_eq!(result, Ok(RunResult::Error));
    assert_eq!(
        log,
        events(&[
            ("start", "t1"),
            ("execute", "t1"),
            ("fail", "t1"),
            ("start", "t2"),
            ("fail", "t2"),
            ("start", "t3"),
            ("execute", "t3"),
            ("success", "t3"),
        ])
    );
}

pub(crate) fn scenario_dependency_error<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1")
            .file_dep(["i_dont_exist.tasuki"])
            .action(ok())
            .build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Error));
    assert_eq!(log, events(&[("start", "t1"), ("fail", "t1")]));
}

pub(crate) fn scenario_ignored_dependency<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1").action(ok()).build(),
        Task::builder("t2").task_dep(["t1"]).action(ok()).build(),
    ];
    let mut store = FileStore::in_memory();
    store.ignore(&tasks[0]);

    let (result, log, _) = run(make, tasks, &["t2"], store, RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success));
    assert_eq!(
        log,
        events(&[("start", "t1"), ("ignore", "t1"), ("start", "t2"), ("ignore", "t2")])
    );
}

pub(crate) fn scenario_getargs_order<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1")
            .getarg("y", "t2", Some("y"))
            .action(Action::func(|ctx| {
                anyhow::ensure!(ctx.options["y"] == json!(5), "wrong option");
                Ok(())
            }))
            .build(),
        Task::builder("t2").action(returns(json!({"y": 5}))).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success));
    assert_eq!(
        log,
        events(&[
            ("start", "t1"),
            ("start", "t2"),
            ("execute", "t2"),
            ("success", "t2"),
            ("execute", "t1"),
            ("success", "t1"),
        ])
    );
}

pub(crate) fn scenario_getargs_group<S: Strategy>(make: &impl MakeRunner<S>) {
    let group = Task::builder("g").group(vec!["g:a".into()]).build();
    let sub = Task::builder("g:a")
        .action(returns(json!({"x": 1})))
        .subtask()
        .build();

    let tasks = vec![
        group,
        sub,
        Task::builder("t")
            .getarg("key", "g", Some("x"))
            .getarg("all", "g", None)
            .action(Action::func(|ctx| {
                let (key, all) = (&ctx.options["key"], &ctx.options["all"]);
                anyhow::ensure!(*key == json!({"a": 1}), "key {key}");
                anyhow::ensure!(*all == json!({"a": {"x": 1}}), "all {all}");
                Ok(())
            }))
            .build(),
    ];
    let (result, _, tasks) = run_fresh(make, tasks, &["t"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success), "{:?}", tasks["t"].out());
}

pub(crate) fn scenario_getargs_missing_value<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1")
            .getarg("y", "t2", Some("nope"))
            .action(ok())
            .build(),
        Task::builder("t2").action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Error));
    assert_eq!(log.last(), Some(&("fail", "t1".to_string())));
}

pub(crate) fn scenario_setup_failure<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1").setup(["s"]).action(ok()).build(),
        Task::builder("s").action(fail()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1"], continue_on_error());
    assert_eq!(result, Ok(RunResult::Error));
    assert_eq!(
        log,
        events(&[
            ("start", "t1"),
            ("start", "s"),
            ("execute", "s"),
            ("fail", "s"),
            ("fail", "t1"),
        ])
    );
}

pub(crate) fn scenario_exit_request<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1")
            .action(ok())
            .teardown(ok())
            .build(),
        Task::builder("t2")
            .action(Action::func(|_| -> anyhow::Result<()> { Err(ExitRequest(3).into()) }))
            .build(),
        Task::builder("t3").action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2", "t3"], RunOptions::default());
    assert_eq!(result, Err(ExitRequest(3)));
    assert_eq!(
        log,
        events(&[
            ("start", "t1"),
            ("execute", "t1"),
            ("success", "t1"),
            ("start", "t2"),
            ("execute", "t2"),
            ("teardown", "t1"),
        ])
    );
}

pub(crate) fn scenario_teardown<S: Strategy>(make: &impl MakeRunner<S>) {
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |name: &'static str| {
        let order = order.clone();
        Action::func(move |_| {
            order.lock().unwrap().push(name);
            Ok(())
        })
    };

    let tasks = vec![
        Task::builder("t1")
            .action(ok())
            .teardown(record("t1"))
            .build(),
        Task::builder("t2").action(ok()).teardown(error()).build(),
        Task::builder("t3")
            .action(ok())
            .teardown(record("t3"))
            .build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2", "t3"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success));
    assert_eq!(
        log[log.len() - 4..].to_vec(),
        events(&[
            ("teardown", "t3"),
            ("teardown", "t2"),
            ("cleanup_error", "t2"),
            ("teardown", "t1"),
        ])
    );
    assert_eq!(*order.lock().unwrap(), vec!["t3", "t1"]);
}

pub(crate) fn scenario_result_captured<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("t1")
            .action(Action::func(|ctx| {
                ctx.out.push_str("out here");
                ctx.err.push_str("err here");
                Ok(serde_json::from_value::<Values>(json!({"bb": 5}))?)
            }))
            .build(),
    ];
    let (result, _, tasks) = run_fresh(make, tasks, &["t1"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success));

    let task = &tasks["t1"];
    assert_eq!(task.result, Some(json!({"bb": 5})));
    assert_eq!(task.values["bb"], json!(5));
    assert_eq!(task.out(), "out here");
    assert_eq!(task.err(), "err here");
}

pub(crate) fn scenario_second_run_up_to_date<S: Strategy>(make: &impl MakeRunner<S>) {
    let (_dir, root) = tempdir();
    let dep = root.join("dep.txt");
    let db = root.join(".tasuki.db");
    std::fs::write(&dep, "content").unwrap();

    let tasks = || {
        vec![
            Task::builder("t1")
                .file_dep([dep.clone()])
                .action(returns(json!({"v": 1})))
                .build(),
            Task::builder("t2")
                .task_dep(["t1"])
                .file_dep([dep.clone()])
                .action(ok())
                .build(),
        ]
    };

    let store = FileStore::open(&db).unwrap();
    let (result, log, _) = run(make, tasks(), &["t2"], store, RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success));
    assert_eq!(log.len(), 6);

    let store = FileStore::open(&db).unwrap();
    assert_eq!(store.get_value("t1", "v"), Some(json!(1)));
    let (result, log, tasks) = run(make, tasks(), &["t2"], store, RunOptions::default());
    assert_eq!(result, Ok(RunResult::Success));
    assert_eq!(
        log,
        events(&[("start", "t1"), ("up-to-date", "t1"), ("start", "t2"), ("up-to-date", "t2")])
    );
    assert_eq!(tasks["t1"].values["v"], json!(1));
}

pub(crate) fn scenario_calc_dep<S: Strategy>(make: &impl MakeRunner<S>) {
    let (_dir, root) = tempdir();
    let header = root.join("generated.h");
    let db = root.join(".tasuki.db");
    std::fs::write(&header, "v1").unwrap();

    let tasks = || {
        vec![
            Task::builder("calc")
                .action(returns(json!({"file_dep": [header.as_str()]})))
                .build(),
            Task::builder("t1").calc_dep(["calc"]).action(ok()).build(),
        ]
    };
    let runs = |store| run(make, tasks(), &["t1"], store, RunOptions::default());

    let (result, log, tasks_after) = runs(FileStore::open(&db).unwrap());
    assert_eq!(result, Ok(RunResult::Success));
    assert_eq!(log.last(), Some(&("success", "t1".to_string())));
    assert!(tasks_after["t1"].file_dep.contains(&header));

    let (_, log, _) = runs(FileStore::open(&db).unwrap());
    assert_eq!(log.last(), Some(&("up-to-date", "t1".to_string())));

    touch(&header, "version two");
    let (_, log, _) = runs(FileStore::open(&db).unwrap());
    assert_eq!(log.last(), Some(&("success", "t1".to_string())));
}

pub(crate) fn scenario_calc_dep_invalid<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("calc")
            .action(returns(json!({"file_dep": [1]})))
            .build(),
        Task::builder("t1").calc_dep(["calc"]).action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1"], RunOptions::default());
    assert_eq!(result, Ok(RunResult::Error));
    assert!(log.iter().any(|(kind, _)| *kind == "runtime_error"));
    assert!(!log.contains(&("execute", "t1".to_string())));
}

pub(crate) fn scenario_internal_error_halts<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = vec![
        Task::builder("calc")
            .action(returns(json!({"task_dep": "calc"})))
            .build(),
        Task::builder("t1").calc_dep(["calc"]).action(ok()).build(),
        Task::builder("t2").action(ok()).build(),
    ];
    let (result, log, _) = run_fresh(make, tasks, &["t1", "t2"], continue_on_error());
    assert_eq!(result, Ok(RunResult::Error));
    assert_eq!(
        log[..3].to_vec(),
        events(&[("start", "calc"), ("execute", "calc"), ("success", "calc")])
    );
    assert_eq!(log.len(), 4);
    assert_eq!(log[3].0, "runtime_error");
}

pub(crate) fn scenario_stalled<S: Strategy>(make: &impl MakeRunner<S>) {
    let tasks = task_map(vec![
        Task::builder("t1").task_dep(["t2"]).action(ok()).build(),
        Task::builder("t2").action(ok()).build(),
    ]);
    let reporter = FakeReporter::default();
    let store = FileStore::in_memory();
    let mut runner = make(&tasks, store, reporter.clone(), RunOptions::default());
    let mut dispatcher = TaskDispatcher::new(tasks, ["t1"]);

    // t2 is handed out and never sent back
    let Some(Dispatch::Ready(t2)) = dispatcher.next(None).unwrap() else {
        panic!("t2 should be ready first");
    };
    dispatcher.node_mut(t2).run_status = RunStatus::Run;

    assert_eq!(runner.run_all(&mut dispatcher), Ok(RunResult::Error));
    assert_eq!(
        reporter.events(),
        events(&[("runtime_error", "Dispatcher is holding but nothing is running")])
    );
}

/// Rewrites a file and moves its mtime forward, so the change is seen even
/// on filesystems with coarse timestamps.
pub(crate) fn touch(path: &camino::Utf8Path, content: &str) {
    std::fs::write(path, content).unwrap();
    let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(later)
        .unwrap();
}

/// Generates the scenario tests for one runner constructor.
macro_rules! strategy_tests {
    ($make:expr) => {
        #[test]
        fn test_success() {
            $crate::testing::scenario_success(&$make);
        }

        #[test]
        fn test_failure_halts() {
            $crate::testing::scenario_failure_halts(&$make);
        }

        #[test]
        fn test_error() {
            $crate::testing::scenario_error(&$make);
        }

        #[test]
        fn test_continue() {
            $crate::testing::scenario_continue(&$make);
        }

        #[test]
        fn test_continue_skips_dependents() {
            $crate::testing::scenario_continue_skips_dependents(&$make);
        }

        #[test]
        fn test_dependency_error() {
            $crate::testing::scenario_dependency_error(&$make);
        }

        #[test]
        fn test_ignored_dependency() {
            $crate::testing::scenario_ignored_dependency(&$make);
        }

        #[test]
        fn test_getargs_order() {
            $crate::testing::scenario_getargs_order(&$make);
        }

        #[test]
        fn test_getargs_group() {
            $crate::testing::scenario_getargs_group(&$make);
        }

        #[test]
        fn test_getargs_missing_value() {
            $crate::testing::scenario_getargs_missing_value(&$make);
        }

        #[test]
        fn test_setup_failure() {
            $crate::testing::scenario_setup_failure(&$make);
        }

        #[test]
        fn test_exit_request() {
            $crate::testing::scenario_exit_request(&$make);
        }

        #[test]
        fn test_teardown() {
            $crate::testing::scenario_teardown(&$make);
        }

        #[test]
        fn test_result_captured() {
            $crate::testing::scenario_result_captured(&$make);
        }

        #[test]
        fn test_second_run_up_to_date() {
            $crate::testing::scenario_second_run_up_to_date(&$make);
        }

        #[test]
        fn test_calc_dep() {
            $crate::testing::scenario_calc_dep(&$make);
        }

        #[test]
        fn test_calc_dep_invalid() {
            $crate::testing::scenario_calc_dep_invalid(&$make);
        }

        #[test]
        fn test_internal_error_halts() {
            $crate::testing::scenario_internal_error_halts(&$make);
        }

        #[test]
        fn test_stalled() {
            $crate::testing::scenario_stalled(&$make);
        }
    };
}

pub(crate) use strategy_tests;

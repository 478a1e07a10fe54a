//! Undoing what tasks produced.
use std::collections::HashSet;
use std::io::Write;

use crate::error::{CommandError, Failure};
use crate::loader::TaskSet;
use crate::store::DependencyStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanOptions {
    /// Only print what would be done.
    pub dryrun: bool,
    /// Clean the `task_dep` of each cleaned task first.
    pub clean_dep: bool,
    /// Clean every task.
    pub clean_all: bool,
}

/// Cleans the selected tasks and forgets their recorded state.
///
/// With no selection the default tasks are cleaned together with their
/// dependencies. Group tasks always clean their subtasks first. Returns the
/// tasks whose clean failed; a failure does not stop the others.
pub fn clean(
    set: &TaskSet,
    store: &mut dyn DependencyStore,
    selected: &[String],
    default_tasks: Option<&[String]>,
    options: CleanOptions,
    out: &mut dyn Write,
) -> Result<Vec<(String, Failure)>, CommandError> {
    let (names, clean_dep) = if options.clean_all {
        (set.iter().map(|t| t.name.clone()).collect(), false)
    } else if !selected.is_empty() {
        (set.select(selected, None)?, options.clean_dep)
    } else {
        (set.select(&[], default_tasks)?, true)
    };

    let mut cleaner = Cleaner {
        set,
        store,
        out,
        dryrun: options.dryrun,
        clean_dep,
        done: HashSet::new(),
        failures: Vec::new(),
    };
    for name in &names {
        cleaner.clean(name);
    }
    Ok(cleaner.failures)
}

struct Cleaner<'a> {
    set: &'a TaskSet,
    store: &'a mut dyn DependencyStore,
    out: &'a mut dyn Write,
    dryrun: bool,
    clean_dep: bool,
    done: HashSet<String>,
    failures: Vec<(String, Failure)>,
}

impl Cleaner<'_> {
    fn clean(&mut self, name: &str) {
        if !self.done.insert(name.to_string()) {
            return;
        }
        let set = self.set;
        let Some(task) = set.get(name) else {
            return;
        };

        let prefix = format!("{name}:");
        let deps: Vec<String> = task
            .task_dep
            .iter()
            .filter(|dep| self.clean_dep || (task.has_subtask && dep.starts_with(&prefix)))
            .cloned()
            .collect();
        for dep in &deps {
            self.clean(dep);
        }

        let mut task = task.clone();
        if let Some(failure) = task.execute_clean(self.out, self.dryrun) {
            tracing::warn!("clean of '{name}': {failure}");
            let _ = writeln!(self.out, "{name} - {failure}");
            self.failures.push((name.to_string(), failure));
        }
        if !self.dryrun {
            self.store.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::action::Action;
    use crate::store::FileStore;
    use crate::task::{Clean, Task};

    struct Fixture {
        set: TaskSet,
        cleaned: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let cleaned = Arc::new(Mutex::new(Vec::new()));
        let cleaning = |name: &'static str| {
            let cleaned = cleaned.clone();
            Clean::Actions(vec![Action::func(move |_| {
                cleaned.lock().unwrap().push(name.to_string());
                Ok(())
            })])
        };

        let sub = Task::builder("t3:a")
            .clean(cleaning("t3:a"))
            .subtask()
            .build();
        let set = TaskSet::new(vec![
            Task::builder("t1")
                .task_dep(["t2"])
                .clean(cleaning("t1"))
                .build(),
            Task::builder("t2").clean(cleaning("t2")).build(),
            Task::builder("t3")
                .group(vec!["t3:a".into()])
                .clean(cleaning("t3"))
                .build(),
            sub,
        ])
        .unwrap();

        Fixture { set, cleaned }
    }

    fn run(
        selected: &[&str],
        defaults: Option<&[String]>,
        options: CleanOptions,
    ) -> Result<Vec<String>, CommandError> {
        let f = fixture();
        let selected: Vec<String> = selected.iter().map(|s| s.to_string()).collect();
        let mut store = FileStore::in_memory();
        let mut out = Vec::<u8>::new();
        clean(&f.set, &mut store, &selected, defaults, options, &mut out)?;
        let cleaned = f.cleaned.lock().unwrap().clone();
        Ok(cleaned)
    }

    fn defaults() -> Vec<String> {
        vec!["t1".to_string()]
    }

    #[test]
    fn test_clean_all() {
        let options = CleanOptions {
            clean_all: true,
            ..CleanOptions::default()
        };
        assert_eq!(run(&[], None, options).unwrap(), vec!["t1", "t2", "t3:a", "t3"]);
    }

    #[test]
    fn test_clean_default_cleans_deps() {
        let defaults = defaults();
        assert_eq!(run(&[], Some(&defaults), CleanOptions::default()).unwrap(), vec!["t2", "t1"]);
    }

    #[test]
    fn test_clean_selected() {
        let defaults = defaults();
        assert_eq!(run(&["t2"], Some(&defaults), CleanOptions::default()).unwrap(), vec!["t2"]);
    }

    #[test]
    fn test_clean_taskdep() {
        let options = CleanOptions {
            clean_dep: true,
            ..CleanOptions::default()
        };
        assert_eq!(run(&["t1"], None, options).unwrap(), vec!["t2", "t1"]);
        assert_eq!(run(&["t1", "t2"], None, options).unwrap(), vec!["t2", "t1"]);
    }

    #[test]
    fn test_clean_subtasks() {
        assert_eq!(run(&["t3"], None, CleanOptions::default()).unwrap(), vec!["t3:a", "t3"]);
    }

    #[test]
    fn test_clean_invalid_task() {
        let defaults = defaults();
        let result = run(&["xxxx"], Some(&defaults), CleanOptions::default());
        assert!(matches!(result, Err(CommandError::UnknownTask(_))));
    }

    #[test]
    fn test_clean_forgets_state_unless_dryrun() {
        let f = fixture();
        let mut store = FileStore::in_memory();
        let task = f.set.get("t2").unwrap();
        store.save_success(task).unwrap();
        store.ignore(task);

        let selected = vec!["t2".to_string()];
        let dryrun = CleanOptions {
            dryrun: true,
            ..CleanOptions::default()
        };
        let mut out = Vec::<u8>::new();
        let failures = clean(&f.set, &mut store, &selected, None, dryrun, &mut out);
        assert!(failures.unwrap().is_empty());
        assert!(store.status_is_ignore(task));
        assert!(f.cleaned.lock().unwrap().is_empty());
        assert_eq!(String::from_utf8(out).unwrap(), "t2 - executing 'Fn'\n");

        let mut out = Vec::<u8>::new();
        let options = CleanOptions::default();
        let failures = clean(&f.set, &mut store, &selected, None, options, &mut out);
        assert!(failures.unwrap().is_empty());
        assert!(!store.status_is_ignore(task));
    }
}

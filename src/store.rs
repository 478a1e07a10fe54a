//! Persisted dependency state of tasks.
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::core::{FileState, Hash32, Values};
use crate::error::StoreError;
use crate::task::Task;

const KEY_VALUES: &str = "_values_:";
const KEY_RESULT: &str = "result:";
const KEY_DEPS: &str = "deps:";
const KEY_IGNORE: &str = "ignore:";

/// Whether a task has to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    UpToDate,
    Run,
}

/// Key-value storage of what every task looked like after its last
/// successful run. Only the coordinator of a run touches the store.
pub trait DependencyStore {
    /// Raw access to a recorded key of a task.
    fn get(&self, task: &str, key: &str) -> Option<Value>;

    /// Values saved by the last successful run of a task.
    fn get_values(&self, task: &str) -> Values {
        match self.get(task, KEY_VALUES) {
            Some(Value::Object(map)) => map.into_iter().collect(),
            _ => Values::new(),
        }
    }

    fn get_value(&self, task: &str, key: &str) -> Option<Value> {
        self.get_values(task).remove(key)
    }

    /// Compares the task against its record. A missing file dependency is
    /// an error.
    fn get_status(&self, task: &Task) -> Result<Status, StoreError>;

    fn is_up_to_date(&self, task: &Task) -> Result<bool, StoreError> {
        Ok(self.get_status(task)? == Status::UpToDate)
    }

    /// Records the file signatures, result and values of a task that just
    /// succeeded.
    fn save_success(&mut self, task: &Task) -> Result<(), StoreError>;

    fn ignore(&mut self, task: &Task);

    fn status_is_ignore(&self, task: &Task) -> bool {
        matches!(self.get(&task.name, KEY_IGNORE), Some(Value::Bool(true)))
    }

    /// Forgets the last success of a task so that it runs again.
    fn remove_success(&mut self, task: &Task) {
        self.remove(&task.name);
    }

    fn remove(&mut self, task: &str);

    fn remove_all(&mut self);

    /// Flushes pending state.
    fn close(&mut self) -> Result<(), StoreError>;
}

type Record = BTreeMap<String, Value>;

/// Dependency store kept in memory and dumped into a CBOR file on close.
#[derive(Debug, Default)]
pub struct FileStore {
    path: Option<Utf8PathBuf>,
    db: BTreeMap<String, Record>,
}

impl FileStore {
    /// Loads the store from `path`, starting empty when the file does not
    /// exist yet.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let db = match fs::File::open(&path) {
            Ok(file) => ciborium::from_reader(BufReader::new(file))?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        tracing::debug!("Loaded {} task records from {path}", db.len());
        Ok(Self {
            path: Some(path),
            db,
        })
    }

    /// A store that is never written anywhere.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    fn set(&mut self, task: &str, key: &str, value: Value) {
        self.db
            .entry(task.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn file_changed(&self, task: &str, dep: &Utf8Path) -> Result<bool, StoreError> {
        let Some(saved) = self.get(task, dep.as_str()) else {
            return Ok(true);
        };
        let Ok(state) = serde_json::from_value::<FileState>(saved) else {
            return Ok(true);
        };
        state.is_changed(dep).map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::MissingFile(dep.to_owned()),
            _ => err.into(),
        })
    }
}

impl DependencyStore for FileStore {
    fn get(&self, task: &str, key: &str) -> Option<Value> {
        self.db.get(task)?.get(key).cloned()
    }

    fn get_status(&self, task: &Task) -> Result<Status, StoreError> {
        let saved = self.get_values(&task.name);
        if task.uptodate.iter().any(|cond| !cond.holds(task, &saved)) {
            return Ok(Status::Run);
        }

        // nothing to compare against
        if task.file_dep.is_empty() && task.uptodate.is_empty() {
            return Ok(Status::Run);
        }

        if task.targets.iter().any(|target| !target.exists()) {
            return Ok(Status::Run);
        }

        if let Some(missing) = task.file_dep.iter().find(|dep| !dep.exists()) {
            return Err(StoreError::MissingFile(missing.clone()));
        }

        let deps: Vec<Value> = task
            .file_dep
            .iter()
            .map(|d| Value::from(d.as_str()))
            .collect();
        if !task.file_dep.is_empty() && self.get(&task.name, KEY_DEPS) != Some(Value::Array(deps)) {
            return Ok(Status::Run);
        }

        for dep in &task.file_dep {
            if self.file_changed(&task.name, dep)? {
                return Ok(Status::Run);
            }
        }

        Ok(Status::UpToDate)
    }

    fn save_success(&mut self, task: &Task) -> Result<(), StoreError> {
        let mut states = Vec::with_capacity(task.file_dep.len());
        for dep in &task.file_dep {
            let state = FileState::read(dep).map_err(|err| match err.kind() {
                ErrorKind::NotFound => StoreError::MissingFile(dep.clone()),
                _ => err.into(),
            })?;
            states.push((dep, state));
        }

        let name = &task.name;
        let values = task.values.iter().map(|(k, v)| (k.clone(), v.clone()));
        self.set(name, KEY_VALUES, Value::Object(values.collect()));

        if let Some(result) = &task.result {
            let hash = Hash32::hash(result.to_string()).to_hex();
            self.set(name, KEY_RESULT, Value::String(hash));
        }

        for (dep, state) in states {
            let state = serde_json::to_value(state).unwrap_or(Value::Null);
            self.set(name, dep.as_str(), state);
        }

        let deps = task
            .file_dep
            .iter()
            .map(|d| Value::from(d.as_str()))
            .collect();
        self.set(name, KEY_DEPS, Value::Array(deps));

        if let Some(record) = self.db.get_mut(name) {
            record.remove(KEY_IGNORE);
        }
        Ok(())
    }

    fn ignore(&mut self, task: &Task) {
        self.set(&task.name, KEY_IGNORE, Value::Bool(true));
    }

    fn remove(&mut self, task: &str) {
        self.db.remove(task);
    }

    fn remove_all(&mut self) {
        self.db.clear();
    }

    fn close(&mut self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let temp = path.with_extension("tmp");
        let mut writer = BufWriter::new(fs::File::create(&temp)?);
        ciborium::into_writer(&self.db, &mut writer)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&temp, path)?;

        tracing::debug!("Saved {} task records to {path}", self.db.len());
        Ok(())
    }
}

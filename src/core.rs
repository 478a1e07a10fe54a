use std::collections::BTreeMap;
use std::time::UNIX_EPOCH;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

/// Values saved by a task, readable by other tasks through `getargs` and
/// persisted in the dependency store.
pub type Values = BTreeMap<String, serde_json::Value>;

/// A 32-byte BLAKE3 hash used as the content signature of files and task
/// results.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Recorded signature of a file dependency.
///
/// A file whose modification time matches the recorded one is taken as
/// unchanged without reading it. Otherwise the size is compared, and only
/// files of equal size are hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FileState {
    pub mtime: f64,
    pub size: u64,
    pub hash: String,
}

impl FileState {
    pub(crate) fn read(path: &Utf8Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(FileState {
            mtime: mtime(&meta),
            size: meta.len(),
            hash: Hash32::hash_file(path)?.to_hex(),
        })
    }

    /// Returns `Ok(true)` when the file no longer matches this signature.
    pub(crate) fn is_changed(&self, path: &Utf8Path) -> std::io::Result<bool> {
        let meta = std::fs::metadata(path)?;
        if mtime(&meta) == self.mtime {
            return Ok(false);
        }
        if meta.len() != self.size {
            return Ok(true);
        }
        Ok(Hash32::hash_file(path)?.to_hex() != self.hash)
    }
}

fn mtime(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

//! Underlying store primitives
//!
//! `StorageBackend` is the four-operation surface every layer above talks to.
//! Implementations here:
//! - `MemoryBackend`: in-process map with fault injection for tests
//! - `FileBackend`: one JSON document on disk, replaced atomically per write

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::BackendError;
use crate::security::{create_secure_dir, write_private_file};

/// Mapping of storage key to stored value
pub type Entries = Map<String, Value>;

/// Fallible key-value primitive.
///
/// Missing keys are absent from the returned mapping, never errors.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, keys: &[String]) -> Result<Entries, BackendError>;

    async fn get_all(&self) -> Result<Entries, BackendError>;

    async fn set(&self, items: Entries) -> Result<(), BackendError>;

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError>;
}

#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    async fn get(&self, keys: &[String]) -> Result<Entries, BackendError> {
        (**self).get(keys).await
    }

    async fn get_all(&self) -> Result<Entries, BackendError> {
        (**self).get_all().await
    }

    async fn set(&self, items: Entries) -> Result<(), BackendError> {
        (**self).set(items).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
        (**self).remove(keys).await
    }
}

fn pick(source: &Entries, keys: &[String]) -> Entries {
    keys.iter()
        .filter_map(|k| source.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

#[derive(Default)]
struct Faults {
    fail_writes: u32,
    fail_reads: u32,
    fail_removes: u32,
    /// Remaining failures for writes that touch a given key
    fail_key_writes: HashMap<String, u32>,
    /// Remaining failures for reads that include a given key
    fail_key_reads: HashMap<String, u32>,
    /// Read failures that become active once a write to the key is accepted
    armed_key_reads: HashMap<String, u32>,
    /// Accept writes but store this instead of the real value
    replace_writes_with: Option<Value>,
}

#[derive(Default)]
struct MemoryState {
    entries: Entries,
    faults: Faults,
    write_counts: HashMap<String, usize>,
    write_history: HashMap<String, Vec<Value>>,
}

/// In-process backend.
///
/// Fault injection lets tests fail a number of upcoming operations or make
/// writes land a different value than requested.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend without going through any wrapping layer
    pub fn with_entries(entries: Entries) -> Self {
        let backend = Self::default();
        backend.state.lock().entries = entries;
        backend
    }

    /// Fail the next `n` `set` calls
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().faults.fail_writes = n;
    }

    /// Fail the next `n` `set` calls whose items include `key`
    pub fn fail_next_writes_to(&self, key: &str, n: u32) {
        self.state
            .lock()
            .faults
            .fail_key_writes
            .insert(key.to_string(), n);
    }

    /// Fail the next `n` `get`/`get_all` calls
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().faults.fail_reads = n;
    }

    /// Fail the next `n` reads that include `key`
    pub fn fail_next_reads_of(&self, key: &str, n: u32) {
        self.state
            .lock()
            .faults
            .fail_key_reads
            .insert(key.to_string(), n);
    }

    /// Like `fail_next_reads_of`, but only from the next accepted write to `key`
    pub fn fail_reads_of_once_written(&self, key: &str, n: u32) {
        self.state
            .lock()
            .faults
            .armed_key_reads
            .insert(key.to_string(), n);
    }

    /// Fail the next `n` `remove` calls
    pub fn fail_next_removes(&self, n: u32) {
        self.state.lock().faults.fail_removes = n;
    }

    /// Accept every write but persist `value` for each key instead
    pub fn corrupt_writes_with(&self, value: Value) {
        self.state.lock().faults.replace_writes_with = Some(value);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Overwrite a stored value directly
    pub fn insert_raw(&self, key: &str, value: Value) {
        self.state.lock().entries.insert(key.to_string(), value);
    }

    pub fn raw(&self, key: &str) -> Option<Value> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn snapshot(&self) -> Entries {
        self.state.lock().entries.clone()
    }

    /// Number of accepted writes that touched `key`
    pub fn write_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .write_counts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Values written to `key`, oldest first
    pub fn write_history(&self, key: &str) -> Vec<Value> {
        self.state
            .lock()
            .write_history
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

fn take_fault(counter: &mut u32, what: &str) -> Result<(), BackendError> {
    if *counter > 0 {
        *counter -= 1;
        return Err(BackendError::Injected(format!("{} failure", what)));
    }
    Ok(())
}

fn take_key_read_faults<'a>(
    faults: &mut Faults,
    keys: impl IntoIterator<Item = &'a String>,
) -> Result<(), BackendError> {
    for key in keys {
        if let Some(remaining) = faults.fail_key_reads.get_mut(key) {
            take_fault(remaining, "read")?;
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, keys: &[String]) -> Result<Entries, BackendError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        take_fault(&mut state.faults.fail_reads, "read")?;
        take_key_read_faults(&mut state.faults, keys)?;
        Ok(pick(&state.entries, keys))
    }

    async fn get_all(&self) -> Result<Entries, BackendError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        take_fault(&mut state.faults.fail_reads, "read")?;
        take_key_read_faults(&mut state.faults, state.entries.keys())?;
        Ok(state.entries.clone())
    }

    async fn set(&self, items: Entries) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        take_fault(&mut state.faults.fail_writes, "write")?;
        for key in items.keys() {
            if let Some(remaining) = state.faults.fail_key_writes.get_mut(key) {
                take_fault(remaining, "write")?;
            }
        }
        let replacement = state.faults.replace_writes_with.clone();
        for key in items.keys() {
            if let Some(n) = state.faults.armed_key_reads.remove(key) {
                state.faults.fail_key_reads.insert(key.clone(), n);
            }
        }
        for (key, value) in items {
            *state.write_counts.entry(key.clone()).or_insert(0) += 1;
            state
                .write_history
                .entry(key.clone())
                .or_default()
                .push(value.clone());
            let stored = replacement.clone().unwrap_or(value);
            state.entries.insert(key, stored);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        take_fault(&mut state.faults.fail_removes, "remove")?;
        for key in keys {
            state.entries.remove(key);
        }
        Ok(())
    }
}

/// Single JSON document on disk.
///
/// Every mutation rewrites the whole document through an fsynced temp file
/// renamed over the target. A missing file reads as an empty store.
pub struct FileBackend {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileBackend {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                create_secure_dir(parent)?;
            }
        }
        Ok(Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Entries, BackendError> {
        let path = self.path.clone();
        run_blocking(move || read_document(&path)).await
    }

    async fn store(&self, entries: Entries) -> Result<(), BackendError> {
        let path = self.path.clone();
        run_blocking(move || {
            let bytes = serde_json::to_vec_pretty(&Value::Object(entries))?;
            write_private_file(&path, &bytes)?;
            Ok(())
        })
        .await
    }
}

fn read_document(path: &Path) -> Result<Entries, BackendError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Entries::new());
    }
    match serde_json::from_slice::<Value>(&bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(BackendError::Unavailable(format!(
            "store document is not an object (found {})",
            json_type_name(&other)
        ))),
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Unavailable(format!("blocking task failed: {}", e)))?
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, keys: &[String]) -> Result<Entries, BackendError> {
        let _guard = self.lock.lock().await;
        let entries = self.load().await?;
        Ok(pick(&entries, keys))
    }

    async fn get_all(&self) -> Result<Entries, BackendError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn set(&self, items: Entries) -> Result<(), BackendError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        for (key, value) in items {
            entries.insert(key, value);
        }
        self.store(entries).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), BackendError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        for key in keys {
            entries.remove(key);
        }
        if entries.len() == before {
            return Ok(());
        }
        self.store(entries).await
    }
}

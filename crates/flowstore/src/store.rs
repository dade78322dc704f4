//! In-memory state bound to persistent storage
//!
//! `PersistedStore` holds the live mapping a UI edits. `save_to_storage`
//! schedules a coalesced write of the current value; `load_from_storage`
//! reads through the manager and repairs known collections on the way in.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use crate::backend::{Entries, StorageBackend};
use crate::coalescer::{SaveCoalescer, SaveHandle};
use crate::error::StoreError;
use crate::manager::{ResilientStorageManager, SetOptions};
use crate::repair::CorruptionRepair;

pub struct PersistedStore<B> {
    store_id: String,
    state: Arc<RwLock<Entries>>,
    manager: Arc<ResilientStorageManager<B>>,
    coalescer: SaveCoalescer<B>,
    repair: Arc<CorruptionRepair>,
}

impl<B: StorageBackend + 'static> PersistedStore<B> {
    pub fn new(
        store_id: impl Into<String>,
        manager: Arc<ResilientStorageManager<B>>,
        coalescer: SaveCoalescer<B>,
        repair: Arc<CorruptionRepair>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            state: Arc::new(RwLock::new(Entries::new())),
            manager,
            coalescer,
            repair,
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Snapshot of the in-memory state
    pub fn state(&self) -> Entries {
        self.state.read().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    /// Replace the in-memory value of `key`; nothing is written
    pub fn set(&self, key: &str, value: Value) {
        self.state.write().insert(key.to_string(), value);
    }

    /// Mutate the in-memory value of `key` (null when absent); nothing is written
    pub fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.state.write();
        let value = state.entry(key.to_string()).or_insert(Value::Null);
        f(value);
    }

    /// Schedule a debounced write of `key`.
    ///
    /// The value is read from the in-memory state when the window elapses,
    /// not now.
    pub fn save_to_storage(&self, key: &str) -> SaveHandle {
        let state = Arc::clone(&self.state);
        let lookup = key.to_string();
        self.coalescer.schedule_save(self.store_id.clone(), key, move || {
            state.read().get(&lookup).cloned().unwrap_or(Value::Null)
        })
    }

    /// Read `key` into the in-memory state.
    ///
    /// Collections guarded by the repair routine are normalized first; a
    /// repaired value is written back immediately as a critical write. A key
    /// that is absent or fails verification is dropped from the state too.
    pub async fn load_from_storage(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let Some(stored) = self.manager.get_one(key).await? else {
            self.state.write().remove(key);
            return Ok(None);
        };

        if !self.repair.applies_to(key) {
            self.set(key, stored.clone());
            return Ok(Some(stored));
        }

        let outcome = self.repair.inspect(key, stored)?;
        let value = Value::Object(outcome.collection);
        self.set(key, value.clone());
        if outcome.repaired {
            let mut items = Entries::new();
            items.insert(key.to_string(), value.clone());
            self.manager.set(items, SetOptions::critical()).await?;
        }
        Ok(Some(value))
    }

    /// Load every key in `keys`, stopping at the first error
    pub async fn load_keys(&self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            self.load_from_storage(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditSink};
    use crate::backend::MemoryBackend;
    use crate::config::StoreConfig;
    use crate::repair::MAX_NESTING_DEPTH;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: PersistedStore<Arc<MemoryBackend>>,
        backend: Arc<MemoryBackend>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Result<Fixture, StoreError> {
        let backend = Arc::new(MemoryBackend::new());
        let audit = Arc::new(MemoryAuditSink::default());
        let manager = Arc::new(ResilientStorageManager::new(
            Arc::clone(&backend),
            StoreConfig::default(),
            audit.clone(),
        )?);
        let coalescer = SaveCoalescer::from_manager(Arc::clone(&manager));
        let repair = Arc::new(CorruptionRepair::new(MAX_NESTING_DEPTH, audit.clone()));
        Ok(Fixture {
            store: PersistedStore::new("workflow", manager, coalescer, repair),
            backend,
            audit,
        })
    }

    #[tokio::test]
    async fn test_load_repairs_and_persists() -> Result<(), StoreError> {
        let f = fixture()?;
        f.backend.insert_raw(
            "workflows",
            json!({"workflows": {"a": {"id": "a"}}, "c": {"id": "c"}}),
        );

        let loaded = f.store.load_from_storage("workflows").await?;
        let expected = json!({"a": {"id": "a"}, "c": {"id": "c"}});
        assert_eq!(loaded, Some(expected.clone()));
        assert_eq!(f.store.get("workflows"), Some(expected.clone()));
        assert_eq!(f.backend.raw("workflows"), Some(expected));
        assert_eq!(f.audit.count(&AuditEventType::CorruptionRepaired), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_clean_load_does_not_write() -> Result<(), StoreError> {
        let f = fixture()?;
        f.backend.insert_raw("workflows", json!({"a": {"id": "a"}}));
        f.backend.insert_raw("settings", json!({"theme": "dark"}));

        f.store.load_keys(&["workflows", "settings", "missing"]).await?;
        assert_eq!(f.backend.write_count("workflows"), 0);
        assert_eq!(f.store.state().len(), 2);
        assert_eq!(f.store.get("missing"), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_key_clears_stale_state() -> Result<(), StoreError> {
        let f = fixture()?;
        f.backend.insert_raw("settings", json!({"theme": "dark"}));
        f.store.load_from_storage("settings").await?;
        assert!(f.store.get("settings").is_some());

        f.backend.remove(&["settings".to_string()]).await?;
        assert_eq!(f.store.load_from_storage("settings").await?, None);
        assert_eq!(f.store.get("settings"), None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_uses_state_at_fire_time() -> Result<(), StoreError> {
        let f = fixture()?;
        f.store.set("settings", json!({"theme": "light"}));
        let first = f.store.save_to_storage("settings");
        f.store.update("settings", |v| v["theme"] = json!("dark"));
        let second = f.store.save_to_storage("settings");

        assert!(matches!(first.await, Err(StoreError::Superseded { .. })));
        second.await?;
        assert_eq!(f.backend.raw("settings"), Some(json!({"theme": "dark"})));
        assert_eq!(f.backend.write_count("settings"), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.backend.write_count("settings"), 1);
        Ok(())
    }
}

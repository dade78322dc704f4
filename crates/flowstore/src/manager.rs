//! Resilient storage manager
//!
//! Every primitive call goes through the `BackoffExecutor`. Protected writes
//! back up the previous value of high-value keys first; critical writes are
//! read back and compared. A write that cannot be made durable is rolled back
//! from the backup records it just wrote (read back, not deleted), an alert
//! is broadcast, and the original error is returned.
//!
//! Reserved key namespaces:
//! - `__backup__:<key>:<timestamp_ms>`: backup records
//! - `__meta__:migrationVersion`: last applied migration label
//! - `__health__:probe`: throwaway key used by `health_check`

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::audit::{AuditEntry, AuditEventType, AuditSeverity, AuditSink};
use crate::backend::{Entries, StorageBackend};
use crate::backoff::BackoffExecutor;
use crate::config::StoreConfig;
use crate::error::{StorageAlert, StoreError};
use crate::migration::{builtin_plan, diff_entries, MigrationOutcome, MigrationPlan};
use crate::validation::{self, ValidationReport};

pub const BACKUP_PREFIX: &str = "__backup__:";
pub const META_PREFIX: &str = "__meta__:";
pub const MIGRATION_VERSION_KEY: &str = "__meta__:migrationVersion";
pub const HEALTH_PROBE_KEY: &str = "__health__:probe";
const HEALTH_PREFIX: &str = "__health__:";

const ALERT_CHANNEL_CAPACITY: usize = 32;

/// Whether `key` belongs to a namespace only the manager writes
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(BACKUP_PREFIX) || key.starts_with(META_PREFIX) || key.starts_with(HEALTH_PREFIX)
}

pub fn backup_key(key: &str, timestamp_ms: i64) -> String {
    format!("{BACKUP_PREFIX}{key}:{timestamp_ms}")
}

/// Split a backup key into the live key and its timestamp
pub fn parse_backup_key(storage_key: &str) -> Option<(&str, i64)> {
    let rest = storage_key.strip_prefix(BACKUP_PREFIX)?;
    let (key, ts) = rest.rsplit_once(':')?;
    Some((key, ts.parse().ok()?))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Back up high-value keys before writing
    pub backup: bool,
    /// Back up every written key and verify the write by reading it back
    pub critical: bool,
}

impl SetOptions {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn backed_up() -> Self {
        Self {
            backup: true,
            critical: false,
        }
    }

    pub fn critical() -> Self {
        Self {
            backup: true,
            critical: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub key: String,
    pub data: Value,
    /// Milliseconds since the Unix epoch; unique per manager
    pub timestamp: i64,
    /// Migration version current when the backup was taken
    pub version: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    failed_writes: AtomicU64,
    verification_failures: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
    backups_created: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub reads: u64,
    pub writes: u64,
    pub removes: u64,
    pub retries: u64,
    pub failed_writes: u64,
    pub verification_failures: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub backups_created: u64,
    pub live_keys: usize,
    pub backup_count: usize,
    /// Size of the stored JSON, keys included
    pub approx_bytes: usize,
    pub migration_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pre-write state of one key captured before a protected write
#[derive(Debug)]
struct RestorePoint {
    key: String,
    /// Storage key of the backup record; `None` when the key did not exist
    backup: Option<String>,
    /// Same value as the backup record, used if the record cannot be read back
    previous: Option<Value>,
}

pub struct ResilientStorageManager<B> {
    backend: B,
    config: StoreConfig,
    executor: BackoffExecutor,
    plan: MigrationPlan,
    audit: Arc<dyn AuditSink>,
    alerts: broadcast::Sender<StorageAlert>,
    counters: Counters,
    last_backup_ts: Mutex<i64>,
    current_version: Mutex<Option<String>>,
    initialized: tokio::sync::Mutex<Option<MigrationOutcome>>,
}

impl<B: StorageBackend> ResilientStorageManager<B> {
    /// Manager with the built-in migration plan
    pub fn new(
        backend: B,
        config: StoreConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Ok(Self {
            backend,
            executor: config.backoff(),
            config,
            plan: builtin_plan()?,
            audit,
            alerts,
            counters: Counters::default(),
            last_backup_ts: Mutex::new(0),
            current_version: Mutex::new(None),
            initialized: tokio::sync::Mutex::new(None),
        })
    }

    /// Replace the migration plan; call before `initialize`
    pub fn with_plan(mut self, plan: MigrationPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn executor(&self) -> &BackoffExecutor {
        &self.executor
    }

    /// Receiver for alerts raised when a write could not be made durable
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<StorageAlert> {
        self.alerts.subscribe()
    }

    /// Write options derived from the key's classification
    pub fn options_for(&self, key: &str) -> SetOptions {
        if self.config.is_critical(key) {
            SetOptions::critical()
        } else {
            SetOptions::plain()
        }
    }

    pub async fn get(&self, keys: &[String]) -> Result<Entries, StoreError> {
        let found = self.executor.run("read", || self.backend.get(keys)).await?;
        bump(&self.counters.reads);
        Ok(found)
    }

    pub async fn get_one(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut found = self.get(&[key.to_string()]).await?;
        Ok(found.remove(key))
    }

    /// Every entry outside the reserved namespaces
    pub async fn get_live(&self) -> Result<Entries, StoreError> {
        let all = self.read_all().await?;
        Ok(all.into_iter().filter(|(k, _)| !is_reserved(k)).collect())
    }

    async fn read_all(&self) -> Result<Entries, StoreError> {
        let all = self.executor.run("read", || self.backend.get_all()).await?;
        bump(&self.counters.reads);
        Ok(all)
    }

    /// Write `items`, backing up and verifying according to `opts`.
    ///
    /// High-value keys are the configured critical keys, or every written
    /// key when `opts.critical` is set.
    pub async fn set(&self, items: Entries, opts: SetOptions) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        if let Some(key) = items.keys().find(|k| is_reserved(k)) {
            return Err(StoreError::Config(format!("key '{key}' is reserved")));
        }
        let keys: Vec<String> = items.keys().cloned().collect();

        let restore_points = if opts.backup || opts.critical {
            let high_value: Vec<String> = keys
                .iter()
                .filter(|k| opts.critical || self.config.is_critical(k))
                .cloned()
                .collect();
            match self.capture_backups(&high_value).await {
                Ok(points) => points,
                Err(e) => {
                    bump(&self.counters.failed_writes);
                    self.raise_write_alert(&e, keys);
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        let result = match self
            .executor
            .run("write", || self.backend.set(items.clone()))
            .await
        {
            Ok(()) => {
                bump(&self.counters.writes);
                if opts.critical {
                    self.verify_written(&items).await
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            bump(&self.counters.failed_writes);
            self.rollback(&restore_points).await;
            self.raise_write_alert(&e, keys);
            return Err(e);
        }
        Ok(())
    }

    /// Write one backup record per existing key; returns the pre-write values
    async fn capture_backups(&self, keys: &[String]) -> Result<Vec<RestorePoint>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let prior = self.get(keys).await?;
        let version = self.current_version.lock().clone();

        let mut records = Entries::new();
        let mut points = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(previous) = prior.get(key) else {
                points.push(RestorePoint {
                    key: key.clone(),
                    backup: None,
                    previous: None,
                });
                continue;
            };
            let timestamp = self.next_backup_timestamp();
            let record = BackupRecord {
                key: key.clone(),
                data: previous.clone(),
                timestamp,
                version: version.clone(),
            };
            let encoded =
                serde_json::to_value(&record).map_err(|e| StoreError::SerializationFailure {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            let storage_key = backup_key(key, timestamp);
            records.insert(storage_key.clone(), encoded);
            points.push(RestorePoint {
                key: key.clone(),
                backup: Some(storage_key),
                previous: Some(previous.clone()),
            });
        }

        if !records.is_empty() {
            let count = records.len() as u64;
            self.executor
                .run("backup", || self.backend.set(records.clone()))
                .await?;
            self.counters
                .backups_created
                .fetch_add(count, Ordering::Relaxed);
            tracing::debug!(backups = count, "Backups written before write");
        }
        Ok(points)
    }

    fn next_backup_timestamp(&self) -> i64 {
        let mut last = self.last_backup_ts.lock();
        let now = Utc::now().timestamp_millis();
        let ts = now.max(*last + 1);
        *last = ts;
        ts
    }

    /// Read the keys back and compare structurally with what was written.
    ///
    /// The read-back has its own retry budget; if every attempt fails the
    /// write counts as unverified.
    async fn verify_written(&self, items: &Entries) -> Result<(), StoreError> {
        let keys: Vec<String> = items.keys().cloned().collect();
        let mismatched = match self
            .executor
            .run("verify", || self.backend.get(&keys))
            .await
        {
            Ok(found) => keys
                .iter()
                .filter(|k| found.get(k.as_str()) != items.get(k.as_str()))
                .cloned()
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::error!("Read-back after critical write failed: {}", e);
                keys.clone()
            }
        };
        if mismatched.is_empty() {
            return Ok(());
        }

        bump(&self.counters.verification_failures);
        tracing::warn!(keys = ?mismatched, "Read-back did not match written value");
        self.audit.record(
            AuditEntry::new(
                AuditEventType::VerificationFailed,
                AuditSeverity::Error,
                format!("Write verification failed for {}", mismatched.join(", ")),
            )
            .with_context(json!({ "keys": mismatched })),
        );
        Err(StoreError::VerificationFailure { keys: mismatched })
    }

    /// Backup records written for `points`, decoded; unreadable ones are left out
    async fn read_backups(&self, points: &[RestorePoint]) -> BTreeMap<String, Value> {
        let storage_keys: Vec<String> = points.iter().filter_map(|p| p.backup.clone()).collect();
        if storage_keys.is_empty() {
            return BTreeMap::new();
        }
        let found = match self
            .executor
            .run("rollback-read", || self.backend.get(&storage_keys))
            .await
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Could not read backups for rollback: {}", e);
                return BTreeMap::new();
            }
        };
        found
            .into_iter()
            .filter_map(|(storage_key, raw)| {
                let record: BackupRecord = serde_json::from_value(raw).ok()?;
                let matches = parse_backup_key(&storage_key).is_some_and(|(key, _)| key == record.key);
                matches.then_some((storage_key, record.data))
            })
            .collect()
    }

    /// Restore each key from the backup record written for this call.
    ///
    /// A record that cannot be read back falls back to the value captured
    /// with it. Keys that had no prior value are removed. Failures are
    /// logged and alerted, never returned.
    async fn rollback(&self, points: &[RestorePoint]) {
        if points.is_empty() {
            return;
        }
        let mut backups = self.read_backups(points).await;

        let mut restore = Entries::new();
        let mut absent = Vec::new();
        for point in points {
            let from_backup = point.backup.as_ref().and_then(|k| backups.remove(k));
            match (from_backup, &point.previous) {
                (Some(value), _) => {
                    restore.insert(point.key.clone(), value);
                }
                (None, Some(previous)) => {
                    tracing::warn!(key = %point.key, "Backup unreadable, restoring captured value");
                    restore.insert(point.key.clone(), previous.clone());
                }
                (None, None) => absent.push(point.key.clone()),
            }
        }
        let keys: Vec<String> = points.iter().map(|p| p.key.clone()).collect();

        let mut failure = None;
        if !restore.is_empty() {
            if let Err(e) = self
                .executor
                .run("rollback", || self.backend.set(restore.clone()))
                .await
            {
                failure = Some(e);
            }
        }
        if !absent.is_empty() {
            if let Err(e) = self
                .executor
                .run("rollback", || self.backend.remove(&absent))
                .await
            {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        match failure {
            None => {
                bump(&self.counters.rollbacks);
                tracing::warn!(keys = ?keys, "Write rolled back to previous values");
                self.audit.record(
                    AuditEntry::new(
                        AuditEventType::WriteRolledBack,
                        AuditSeverity::Warning,
                        format!("Rolled back {}", keys.join(", ")),
                    )
                    .with_context(json!({ "keys": keys })),
                );
            }
            Some(e) => {
                bump(&self.counters.rollback_failures);
                tracing::error!(keys = ?keys, "Rollback failed: {}", e);
                self.audit.record(
                    AuditEntry::new(
                        AuditEventType::RollbackFailed,
                        AuditSeverity::Critical,
                        format!("Rollback failed for {}", keys.join(", ")),
                    )
                    .with_context(json!({ "keys": keys, "error": e.to_string() })),
                );
                self.raise_alert(StorageAlert::rollback_failed(e.to_string()).with_keys(keys));
            }
        }
    }

    fn raise_write_alert(&self, error: &StoreError, keys: Vec<String>) {
        let mut alert = StorageAlert::from(error);
        if alert.keys.is_empty() {
            alert.keys = keys;
        }
        self.raise_alert(alert);
    }

    fn raise_alert(&self, alert: StorageAlert) {
        tracing::warn!(code = %alert.code, "{}", alert.message);
        // no subscribers is fine
        let _ = self.alerts.send(alert);
    }

    pub async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        if let Some(key) = keys.iter().find(|k| is_reserved(k)) {
            return Err(StoreError::Config(format!("key '{key}' is reserved")));
        }
        self.executor
            .run("remove", || self.backend.remove(keys))
            .await?;
        bump(&self.counters.removes);
        Ok(())
    }

    pub fn validate(&self, key: &str, data: &Value) -> ValidationReport {
        validation::validate(key, data)
    }

    /// Write, read back, and remove a throwaway probe value
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let checked_at = Utc::now();
        let probe = json!({
            "nonce": uuid::Uuid::new_v4().to_string(),
            "at": checked_at.timestamp_millis(),
        });
        let error = self.probe_round_trip(&probe).await.err();
        if let Some(e) = &error {
            tracing::warn!("Storage health check failed: {}", e);
        }
        HealthReport {
            healthy: error.is_none(),
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            checked_at,
            error,
        }
    }

    async fn probe_round_trip(&self, probe: &Value) -> Result<(), String> {
        let keys = vec![HEALTH_PROBE_KEY.to_string()];
        let mut items = Entries::new();
        items.insert(HEALTH_PROBE_KEY.to_string(), probe.clone());

        self.executor
            .run("health-write", || self.backend.set(items.clone()))
            .await
            .map_err(|e| e.to_string())?;
        let read = self
            .executor
            .run("health-read", || self.backend.get(&keys))
            .await
            .map_err(|e| e.to_string());
        let cleanup = self
            .executor
            .run("health-remove", || self.backend.remove(&keys))
            .await;
        if let Err(e) = cleanup {
            tracing::debug!("Health probe cleanup failed: {}", e);
        }

        match read?.get(HEALTH_PROBE_KEY) {
            Some(value) if value == probe => Ok(()),
            Some(_) => Err("probe read back a different value".to_string()),
            None => Err("probe value missing after write".to_string()),
        }
    }

    pub async fn get_stats(&self) -> Result<StorageStats, StoreError> {
        let all = self.read_all().await?;
        let mut live_keys = 0;
        let mut backup_count = 0;
        let mut approx_bytes = 0;
        for (key, value) in &all {
            approx_bytes += key.len() + value.to_string().len();
            if key.starts_with(BACKUP_PREFIX) {
                backup_count += 1;
            } else if !is_reserved(key) {
                live_keys += 1;
            }
        }
        let migration_version = all
            .get(MIGRATION_VERSION_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);

        let c = &self.counters;
        Ok(StorageStats {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            removes: c.removes.load(Ordering::Relaxed),
            retries: self.executor.retries(),
            failed_writes: c.failed_writes.load(Ordering::Relaxed),
            verification_failures: c.verification_failures.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
            rollback_failures: c.rollback_failures.load(Ordering::Relaxed),
            backups_created: c.backups_created.load(Ordering::Relaxed),
            live_keys,
            backup_count,
            approx_bytes,
            migration_version,
        })
    }

    pub async fn migration_version(&self) -> Result<Option<String>, StoreError> {
        let stored = self.get_one(MIGRATION_VERSION_KEY).await?;
        match stored {
            None => Ok(None),
            Some(Value::String(v)) => Ok(Some(v)),
            Some(other) => Err(StoreError::MigrationFailure {
                version: other.to_string(),
                reason: "persisted migration version is not a string".to_string(),
            }),
        }
    }

    /// Apply pending migrations. Runs once; later calls return the first outcome.
    pub async fn initialize(&self) -> Result<MigrationOutcome, StoreError> {
        let mut initialized = self.initialized.lock().await;
        if let Some(outcome) = initialized.as_ref() {
            return Ok(outcome.clone());
        }
        let outcome = self.run_migrations().await?;
        *initialized = Some(outcome.clone());
        Ok(outcome)
    }

    async fn run_migrations(&self) -> Result<MigrationOutcome, StoreError> {
        let from = self.migration_version().await?;
        *self.current_version.lock() = from.clone();
        let pending = self.plan.pending(from.as_deref())?;

        let mut outcome = MigrationOutcome {
            from: from.clone(),
            to: from,
            applied: Vec::new(),
        };
        if pending.is_empty() {
            tracing::debug!(version = ?outcome.to, "No pending migrations");
            return Ok(outcome);
        }

        let mut live = self.get_live().await?;
        for step in pending {
            let before = live.clone();
            if let Err(e) = step.apply(&mut live) {
                tracing::error!(version = step.version(), "Migration failed: {}", e);
                return Err(e);
            }

            let (mut changed, removed) = diff_entries(&before, &live);
            let touched: Vec<String> = changed
                .keys()
                .chain(removed.iter())
                .filter(|k| before.contains_key(k.as_str()))
                .cloned()
                .collect();
            let as_failure = |e: StoreError| StoreError::MigrationFailure {
                version: step.version().to_string(),
                reason: e.to_string(),
            };

            self.capture_backups(&touched).await.map_err(as_failure)?;
            if !removed.is_empty() {
                self.executor
                    .run("migrate", || self.backend.remove(&removed))
                    .await
                    .map_err(as_failure)?;
            }
            changed.insert(
                MIGRATION_VERSION_KEY.to_string(),
                Value::String(step.version().to_string()),
            );
            self.executor
                .run("migrate", || self.backend.set(changed.clone()))
                .await
                .map_err(as_failure)?;

            *self.current_version.lock() = Some(step.version().to_string());
            outcome.to = Some(step.version().to_string());
            outcome.applied.push(step.version().to_string());

            tracing::info!(
                version = step.version(),
                description = step.description(),
                changed = changed.len() - 1,
                removed = removed.len(),
                "Migration applied"
            );
            self.audit.record(
                AuditEntry::new(
                    AuditEventType::MigrationApplied,
                    AuditSeverity::Info,
                    format!("Applied migration {}", step.version()),
                )
                .with_context(json!({
                    "version": step.version(),
                    "description": step.description(),
                    "changedKeys": touched,
                })),
            );
        }
        Ok(outcome)
    }

    /// Backups of `key`, oldest first
    pub async fn list_backups(&self, key: &str) -> Result<Vec<BackupRecord>, StoreError> {
        let all = self.read_all().await?;
        let mut records: Vec<BackupRecord> = all
            .into_iter()
            .filter(|(storage_key, _)| {
                parse_backup_key(storage_key).is_some_and(|(k, _)| k == key)
            })
            .filter_map(|(storage_key, value)| match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(key = %storage_key, "Skipping unreadable backup: {}", e);
                    None
                }
            })
            .collect();
        records.sort_by_key(|r: &BackupRecord| r.timestamp);
        Ok(records)
    }

    pub async fn latest_backup(&self, key: &str) -> Result<Option<BackupRecord>, StoreError> {
        Ok(self.list_backups(key).await?.pop())
    }

    /// Write the most recent backup of `key` back as the live value
    pub async fn restore_from_backup(&self, key: &str) -> Result<Option<BackupRecord>, StoreError> {
        let Some(record) = self.latest_backup(key).await? else {
            return Ok(None);
        };
        let mut items = Entries::new();
        items.insert(key.to_string(), record.data.clone());
        self.executor
            .run("restore", || self.backend.set(items.clone()))
            .await?;
        bump(&self.counters.writes);
        tracing::info!(key, timestamp = record.timestamp, "Restored key from backup");
        Ok(Some(record))
    }

    /// Delete all but the newest `keep` backups per key.
    ///
    /// `key` limits purging to one live key; `keep` falls back to the
    /// configured retention, then zero. Returns the number removed.
    pub async fn purge_backups(
        &self,
        key: Option<&str>,
        keep: Option<usize>,
    ) -> Result<usize, StoreError> {
        let keep = keep.or(self.config.backup_retention).unwrap_or(0);
        let all = self.read_all().await?;

        let mut groups: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();
        for storage_key in all.keys() {
            let Some((live_key, ts)) = parse_backup_key(storage_key) else {
                continue;
            };
            if key.is_some_and(|k| k != live_key) {
                continue;
            }
            groups
                .entry(live_key.to_string())
                .or_default()
                .push((ts, storage_key.clone()));
        }

        let mut doomed = Vec::new();
        for backups in groups.values_mut() {
            backups.sort();
            let excess = backups.len().saturating_sub(keep);
            doomed.extend(backups.drain(..excess).map(|(_, k)| k));
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        self.executor
            .run("purge", || self.backend.remove(&doomed))
            .await?;
        tracing::info!(removed = doomed.len(), keep, "Backups purged");
        self.audit.record(
            AuditEntry::new(
                AuditEventType::BackupsPurged,
                AuditSeverity::Info,
                format!("Purged {} backups", doomed.len()),
            )
            .with_context(json!({ "removed": doomed.len(), "keep": keep, "key": key })),
        );
        Ok(doomed.len())
    }
}

//! Wiring for a complete store
//!
//! ```text
//! PersistedStore ─┬─ SaveCoalescer ─┐
//!                 └─ CorruptionRepair
//!                                   ResilientStorageManager ── IntegrityStore ── backend
//! ```

use serde::Serialize;
use std::sync::Arc;

use crate::audit::{AuditSink, JsonlAuditLog, TracingAuditSink};
use crate::backend::StorageBackend;
use crate::coalescer::SaveCoalescer;
use crate::config::StoreConfig;
use crate::error::{StorageAlert, StoreError};
use crate::integrity::{IntegrityStore, LegacyMigrationReport};
use crate::manager::ResilientStorageManager;
use crate::migration::{MigrationOutcome, MigrationPlan};
use crate::repair::CorruptionRepair;
use crate::security::{MacSecret, SecretProvider};
use crate::store::PersistedStore;

/// Backend the manager sees: `B` behind integrity wrapping
pub type Protected<B> = Arc<IntegrityStore<B>>;

/// What `start` did to bring the store up to date
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub legacy: LegacyMigrationReport,
    pub migrations: MigrationOutcome,
}

pub struct Flowstore<B> {
    config: StoreConfig,
    integrity: Protected<B>,
    manager: Arc<ResilientStorageManager<Protected<B>>>,
    coalescer: SaveCoalescer<Protected<B>>,
    repair: Arc<CorruptionRepair>,
}

/// Audit sink named by the configuration: a JSON-lines file when
/// `audit_log_path` is set, tracing otherwise
pub fn audit_sink_for(config: &StoreConfig) -> Result<Arc<dyn AuditSink>, StoreError> {
    match &config.audit_log_path {
        Some(path) => {
            let log = JsonlAuditLog::open(path)
                .map_err(|e| StoreError::Config(format!("audit log: {e}")))?;
            Ok(Arc::new(log))
        }
        None => Ok(Arc::new(TracingAuditSink)),
    }
}

impl<B: StorageBackend + 'static> Flowstore<B> {
    /// Assemble the layers without touching storage
    pub fn new(
        backend: B,
        secret: &MacSecret,
        config: StoreConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, StoreError> {
        Self::build(backend, secret, config, audit, None)
    }

    /// Like `new`, with a migration plan replacing the built-in one
    pub fn with_plan(
        backend: B,
        secret: &MacSecret,
        config: StoreConfig,
        audit: Arc<dyn AuditSink>,
        plan: MigrationPlan,
    ) -> Result<Self, StoreError> {
        Self::build(backend, secret, config, audit, Some(plan))
    }

    fn build(
        backend: B,
        secret: &MacSecret,
        config: StoreConfig,
        audit: Arc<dyn AuditSink>,
        plan: Option<MigrationPlan>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let integrity = Arc::new(IntegrityStore::new(
            backend,
            secret,
            config.store_name.clone(),
            Arc::clone(&audit),
        )
        .with_executor(config.backoff()));
        let mut manager =
            ResilientStorageManager::new(Arc::clone(&integrity), config.clone(), Arc::clone(&audit))?;
        if let Some(plan) = plan {
            manager = manager.with_plan(plan);
        }
        let manager = Arc::new(manager);
        let coalescer = SaveCoalescer::from_manager(Arc::clone(&manager));
        let repair = Arc::new(CorruptionRepair::new(config.max_nesting_depth, audit));

        Ok(Self {
            config,
            integrity,
            manager,
            coalescer,
            repair,
        })
    }

    /// Assemble with a secret loaded from `provider`
    pub fn with_provider(
        backend: B,
        provider: &dyn SecretProvider,
        config: StoreConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, StoreError> {
        let secret = provider.load_secret()?;
        Self::new(backend, &secret, config, audit)
    }

    /// Assemble and bring storage up to date
    pub async fn open(
        backend: B,
        secret: &MacSecret,
        config: StoreConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<(Self, StartupReport), StoreError> {
        let store = Self::new(backend, secret, config, audit)?;
        let report = store.start().await?;
        Ok((store, report))
    }

    /// Wrap legacy entries, then apply pending migrations
    pub async fn start(&self) -> Result<StartupReport, StoreError> {
        let legacy = self.integrity.migrate_all().await?;
        let migrations = self.manager.initialize().await?;
        tracing::info!(
            store = %self.config.store_name,
            wrapped = legacy.migrated,
            version = ?migrations.to,
            "Store ready"
        );
        Ok(StartupReport { legacy, migrations })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn integrity(&self) -> &IntegrityStore<B> {
        &self.integrity
    }

    pub fn manager(&self) -> &Arc<ResilientStorageManager<Protected<B>>> {
        &self.manager
    }

    pub fn coalescer(&self) -> &SaveCoalescer<Protected<B>> {
        &self.coalescer
    }

    pub fn repair(&self) -> &Arc<CorruptionRepair> {
        &self.repair
    }

    pub fn subscribe_alerts(&self) -> tokio::sync::broadcast::Receiver<StorageAlert> {
        self.manager.subscribe_alerts()
    }

    /// State facade for one logical store; saves share this instance's queue
    pub fn store(&self, store_id: impl Into<String>) -> PersistedStore<Protected<B>> {
        PersistedStore::new(
            store_id,
            Arc::clone(&self.manager),
            self.coalescer.clone(),
            Arc::clone(&self.repair),
        )
    }

    /// Write every pending save now
    pub async fn flush(&self) {
        self.coalescer.flush_all().await;
    }
}

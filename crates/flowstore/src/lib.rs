//! Tamper-evident, self-healing key-value persistence for desktop automation
//! workflows.
//!
//! Layers, bottom up:
//! - [`backend`]: the store primitive (`get`, `get_all`, `set`, `remove`)
//! - [`integrity`]: HMAC wrapping and verification of every value
//! - [`backoff`]: retry with exponential backoff
//! - [`manager`]: backups, read-back verification, rollback, migrations
//! - [`coalescer`]: debounced per-key save queue
//! - [`repair`]: load-time repair of collections nested inside themselves
//! - [`store`] and [`runtime`]: the pieces wired together

pub mod audit;
pub mod backend;
pub mod backoff;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod integrity;
pub mod manager;
pub mod migration;
pub mod repair;
pub mod runtime;
pub mod security;
pub mod store;
pub mod validation;

pub use audit::{
    AuditEntry, AuditEventType, AuditSeverity, AuditSink, JsonlAuditLog, MemoryAuditSink,
    SecurityIncident, TracingAuditSink,
};
pub use backend::{Entries, FileBackend, MemoryBackend, StorageBackend};
pub use backoff::BackoffExecutor;
pub use coalescer::{SaveCoalescer, SaveHandle};
pub use config::StoreConfig;
pub use error::{AlertCategory, AlertCode, BackendError, StorageAlert, StoreError};
pub use integrity::{IntegrityStore, LegacyMigrationReport, StoredEntry, VerifyReport};
pub use manager::{
    BackupRecord, HealthReport, ResilientStorageManager, SetOptions, StorageStats,
};
pub use migration::{Migration, MigrationOutcome, MigrationPlan};
pub use repair::{normalize_collection, CollectionShape, CorruptionRepair, RepairOutcome};
pub use runtime::{audit_sink_for, Flowstore, Protected, StartupReport};
pub use security::{FileSecret, KeyringSecret, MacSecret, SecretProvider, StaticSecret};
pub use store::PersistedStore;
pub use validation::ValidationReport;

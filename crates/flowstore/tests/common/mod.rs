//! Shared fixtures for flowstore integration tests

use flowstore::{
    Flowstore, MacSecret, MemoryAuditSink, MemoryBackend, StoreConfig, StoreError,
};
use std::sync::Arc;

pub const TEST_SECRET: &[u8] = b"integration-test-secret";

/// Store over an in-memory backend with a captured audit trail
#[allow(dead_code)]
pub struct TestContext {
    pub backend: Arc<MemoryBackend>,
    pub audit: Arc<MemoryAuditSink>,
    pub flowstore: Flowstore<Arc<MemoryBackend>>,
}

#[allow(dead_code)]
impl TestContext {
    /// Assembled but not started
    pub fn new() -> Result<Self, StoreError> {
        Self::with_backend(Arc::new(MemoryBackend::new()), fast_config())
    }

    pub fn with_backend(backend: Arc<MemoryBackend>, config: StoreConfig) -> Result<Self, StoreError> {
        let audit = Arc::new(MemoryAuditSink::default());
        let secret = secret()?;
        let flowstore = Flowstore::new(Arc::clone(&backend), &secret, config, audit.clone())?;
        Ok(Self {
            backend,
            audit,
            flowstore,
        })
    }

    /// Assembled and started
    pub async fn started() -> Result<Self, StoreError> {
        let ctx = Self::new()?;
        ctx.flowstore.start().await?;
        Ok(ctx)
    }
}

#[allow(dead_code)]
pub fn secret() -> Result<MacSecret, StoreError> {
    Ok(MacSecret::from_bytes(TEST_SECRET.to_vec())?)
}

/// Default configuration with a 1ms backoff base
#[allow(dead_code)]
pub fn fast_config() -> StoreConfig {
    StoreConfig {
        base_delay_ms: 1,
        ..StoreConfig::default()
    }
}

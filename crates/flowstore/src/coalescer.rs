//! Debounced save coalescing
//!
//! One pending save per `(store_id, key)`. A new request rejects the previous
//! one with `Superseded`, cancels its timer, and arms a fresh quiet window.
//! When the window elapses the value is fetched from the provider, copied
//! into a `serde_json::Value`, and written through the storage manager.
//!
//! Writes for the same pair never overlap; different pairs are independent.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backend::{Entries, StorageBackend};
use crate::error::StoreError;
use crate::manager::ResilientStorageManager;

type ValueProvider = Box<dyn FnOnce() -> Result<Value, StoreError> + Send>;
type SaveReply = oneshot::Sender<Result<(), StoreError>>;
type Pair = (String, String);

struct PendingSave {
    generation: u64,
    timer: JoinHandle<()>,
    reply: SaveReply,
    provider: ValueProvider,
}

struct Inner<B> {
    manager: Arc<ResilientStorageManager<B>>,
    window: Duration,
    pending: Mutex<HashMap<Pair, PendingSave>>,
    write_locks: Mutex<HashMap<Pair, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
}

pub struct SaveCoalescer<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for SaveCoalescer<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Resolves once the save is durable, or with the reason it never will be
#[must_use = "a save handle does nothing unless awaited"]
pub struct SaveHandle {
    rx: oneshot::Receiver<Result<(), StoreError>>,
    store_id: String,
    key: String,
}

impl SaveHandle {
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Future for SaveHandle {
    type Output = Result<(), StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // sender dropped without replying: the coalescer went away
            Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::Cancelled {
                store_id: self.store_id.clone(),
                key: self.key.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<B: StorageBackend + 'static> SaveCoalescer<B> {
    pub fn new(manager: Arc<ResilientStorageManager<B>>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                window,
                pending: Mutex::new(HashMap::new()),
                write_locks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Coalescer using the manager's configured debounce window
    pub fn from_manager(manager: Arc<ResilientStorageManager<B>>) -> Self {
        let window = manager.config().debounce();
        Self::new(manager, window)
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    pub fn manager(&self) -> &Arc<ResilientStorageManager<B>> {
        &self.inner.manager
    }

    /// Schedule a save of whatever `provider` returns when the window elapses.
    ///
    /// Any pending save for the same pair is rejected with `Superseded`
    /// before this returns. Must be called from within a tokio runtime.
    pub fn schedule_save<T, F>(
        &self,
        store_id: impl Into<String>,
        key: impl Into<String>,
        provider: F,
    ) -> SaveHandle
    where
        F: FnOnce() -> T + Send + 'static,
        T: Serialize,
    {
        let pair: Pair = (store_id.into(), key.into());
        let provider_key = pair.1.clone();
        let provider: ValueProvider = Box::new(move || {
            serde_json::to_value(provider()).map_err(|e| StoreError::SerializationFailure {
                key: provider_key,
                reason: e.to_string(),
            })
        });

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        let mut pending = self.inner.pending.lock();
        if let Some(previous) = pending.remove(&pair) {
            previous.timer.abort();
            tracing::debug!(store = %pair.0, key = %pair.1, "Superseding pending save");
            let _ = previous.reply.send(Err(StoreError::Superseded {
                store_id: pair.0.clone(),
                key: pair.1.clone(),
            }));
        }

        let inner = Arc::clone(&self.inner);
        let timer_pair = pair.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            if let Some(save) = inner.take(&timer_pair, Some(generation)) {
                inner.execute(timer_pair, save).await;
            }
        });

        let handle = SaveHandle {
            rx,
            store_id: pair.0.clone(),
            key: pair.1.clone(),
        };
        pending.insert(
            pair,
            PendingSave {
                generation,
                timer,
                reply,
                provider,
            },
        );
        handle
    }

    /// Drop the pending save for a pair, rejecting it with `Cancelled`
    pub fn cancel(&self, store_id: &str, key: &str) -> bool {
        let pair = (store_id.to_string(), key.to_string());
        let Some(save) = self.inner.take(&pair, None) else {
            return false;
        };
        save.timer.abort();
        let _ = save.reply.send(Err(StoreError::Cancelled {
            store_id: pair.0,
            key: pair.1,
        }));
        true
    }

    /// Run every pending save now instead of waiting for its window
    pub async fn flush_all(&self) {
        let saves: Vec<(Pair, PendingSave)> = self.inner.pending.lock().drain().collect();
        if saves.is_empty() {
            return;
        }
        tracing::debug!(count = saves.len(), "Flushing pending saves");

        let runs = saves.into_iter().map(|(pair, save)| {
            save.timer.abort();
            let inner = Arc::clone(&self.inner);
            async move { inner.execute(pair, save).await }
        });
        futures::future::join_all(runs).await;
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl<B: StorageBackend + 'static> Inner<B> {
    /// Remove the pending save for `pair`, optionally only if it is still
    /// the given generation
    fn take(&self, pair: &Pair, generation: Option<u64>) -> Option<PendingSave> {
        let mut pending = self.pending.lock();
        let current = pending.get(pair)?;
        if generation.is_some_and(|g| g != current.generation) {
            return None;
        }
        pending.remove(pair)
    }

    fn write_lock(&self, pair: &Pair) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock();
        Arc::clone(locks.entry(pair.clone()).or_default())
    }

    /// Forget the lock for `pair` once no save holds or waits on it
    fn release_write_lock(&self, pair: &Pair) {
        let mut locks = self.write_locks.lock();
        if locks.get(pair).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(pair);
        }
    }

    async fn execute(&self, pair: Pair, save: PendingSave) {
        let PendingSave {
            reply, provider, ..
        } = save;

        let lock = self.write_lock(&pair);
        let guard = lock.lock().await;
        let result = self.persist(&pair, provider).await;
        drop(guard);
        drop(lock);
        self.release_write_lock(&pair);

        match &result {
            Ok(()) => tracing::debug!(store = %pair.0, key = %pair.1, "Coalesced save persisted"),
            Err(e) => tracing::warn!(store = %pair.0, key = %pair.1, "Coalesced save failed: {}", e),
        }
        let _ = reply.send(result);
    }

    async fn persist(&self, pair: &Pair, provider: ValueProvider) -> Result<(), StoreError> {
        let value = provider()?;
        let key = &pair.1;
        let mut items = Entries::new();
        items.insert(key.clone(), value);
        self.manager.set(items, self.manager.options_for(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::backend::MemoryBackend;
    use crate::config::StoreConfig;
    use serde_json::json;
    use tokio::time::{sleep, Instant};

    type Fixture = (SaveCoalescer<Arc<MemoryBackend>>, Arc<MemoryBackend>);

    fn coalescer() -> Result<Fixture, StoreError> {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ResilientStorageManager::new(
            Arc::clone(&backend),
            StoreConfig::default(),
            Arc::new(MemoryAuditSink::default()),
        )?;
        Ok((SaveCoalescer::from_manager(Arc::new(manager)), backend))
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_requests_one_write() -> Result<(), StoreError> {
        let (coalescer, backend) = coalescer()?;
        let state = Arc::new(Mutex::new(json!({"a": {"id": "a"}})));
        let provider = |state: &Arc<Mutex<Value>>| {
            let state = Arc::clone(state);
            move || state.lock().clone()
        };

        let first = coalescer.schedule_save("workflow", "workflows", provider(&state));
        sleep(Duration::from_millis(100)).await;
        let second = coalescer.schedule_save("workflow", "workflows", provider(&state));
        sleep(Duration::from_millis(100)).await;
        let third = coalescer.schedule_save("workflow", "workflows", provider(&state));
        assert_eq!(coalescer.pending_count(), 1);

        // changed during the last window; the write must see it
        *state.lock() = json!({"a": {"id": "a"}, "b": {"id": "b"}});

        assert!(matches!(first.await, Err(StoreError::Superseded { .. })));
        assert!(matches!(second.await, Err(StoreError::Superseded { .. })));
        assert_eq!(backend.write_count("workflows"), 0);

        let started = Instant::now();
        third.await?;
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(backend.write_count("workflows"), 1);
        assert_eq!(
            backend.raw("workflows"),
            Some(json!({"a": {"id": "a"}, "b": {"id": "b"}}))
        );
        assert_eq!(coalescer.pending_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairs_are_independent() -> Result<(), StoreError> {
        let (coalescer, backend) = coalescer()?;
        let a = coalescer.schedule_save("workflow", "workflows", || json!({}));
        let b = coalescer.schedule_save("folder", "folders", || json!([]));
        let c = coalescer.schedule_save("other", "workflows", || json!({"x": {"id": "x"}}));
        assert_eq!(coalescer.pending_count(), 3);

        a.await?;
        b.await?;
        c.await?;
        assert_eq!(backend.write_count("workflows"), 2);
        assert_eq!(backend.write_count("folders"), 1);
        assert!(coalescer.inner.write_locks.lock().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_locks_do_not_accumulate() -> Result<(), StoreError> {
        let (coalescer, _) = coalescer()?;
        for i in 0..20 {
            coalescer
                .schedule_save("workflow", format!("draft-{i}"), move || json!(i))
                .await?;
        }
        let last = coalescer.schedule_save("workflow", "last", || json!(0));
        coalescer.flush_all().await;
        last.await?;
        assert!(coalescer.inner.write_locks.lock().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialization_failure_skips_io() -> Result<(), StoreError> {
        let (coalescer, backend) = coalescer()?;
        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys cannot be JSON object keys");
        let handle = coalescer.schedule_save("workflow", "settings", move || bad);

        assert!(matches!(
            handle.await,
            Err(StoreError::SerializationFailure { ref key, .. }) if key == "settings"
        ));
        assert!(backend.snapshot().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_rejects_handle() -> Result<(), StoreError> {
        let (coalescer, backend) = coalescer()?;
        backend.fail_next_writes(3);
        let handle = coalescer.schedule_save("workflow", "lastOpened", || json!("a"));
        assert!(matches!(
            handle.await,
            Err(StoreError::ExhaustedRetries { .. })
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_skips_the_window() -> Result<(), StoreError> {
        let (coalescer, backend) = coalescer()?;
        let handle = coalescer.schedule_save("workflow", "settings", || json!({"theme": "dark"}));
        let started = Instant::now();
        coalescer.flush_all().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(backend.raw("settings"), Some(json!({"theme": "dark"})));
        handle.await?;

        // the aborted timer must not write again
        sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.write_count("settings"), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() -> Result<(), StoreError> {
        let (coalescer, backend) = coalescer()?;
        let handle = coalescer.schedule_save("workflow", "settings", || json!({}));
        assert!(coalescer.cancel("workflow", "settings"));
        assert!(!coalescer.cancel("workflow", "settings"));
        assert!(matches!(handle.await, Err(StoreError::Cancelled { .. })));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.write_count("settings"), 0);
        Ok(())
    }
}

//! Single-flight, time-bounded cache for thread scans
//!
//! Concurrent lookups of the same key share one computation and receive the
//! same `Arc`. Successful results live for a fixed TTL; failures are shared
//! with the callers already waiting but are not kept afterwards. The whole
//! cache is dropped whenever settings change, since cached results embed
//! proxy-dependent URLs.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ripper::error::{RipperError, RipperResult};
use crate::ripper::event_bus::{Event, EventSubscription};

/// Lifetime of a cached scan
pub const DEFAULT_SCAN_TTL: Duration = Duration::from_secs(5 * 60);

const DEFAULT_CAPACITY: usize = 100;

type Settled<V> = (Instant, Result<Arc<V>, String>);

struct Slot<V> {
    cell: OnceCell<Settled<V>>,
}

pub struct ScanCache<V> {
    ttl: Duration,
    slots: Mutex<LruCache<String, Arc<Slot<V>>>>,
}

impl<V: Send + Sync + 'static> ScanCache<V> {
    pub fn new(ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Slot to use for `key`: the live one, or a fresh one if missing or expired
    fn slot(&self, key: &str) -> Arc<Slot<V>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            let expired = matches!(slot.cell.get(), Some((at, _)) if at.elapsed() >= self.ttl);
            if !expired {
                return slot.clone();
            }
            debug!(key, "Cached scan expired");
        }
        let slot = Arc::new(Slot { cell: OnceCell::new() });
        slots.put(key.to_string(), slot.clone());
        slot
    }

    /// Return the cached value for `key`, computing it at most once across concurrent callers
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> RipperResult<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RipperResult<V>>,
    {
        let slot = self.slot(key);
        let (_, result) = slot
            .cell
            .get_or_init(|| async {
                let result = compute().await.map(Arc::new).map_err(|e| e.to_string());
                (Instant::now(), result)
            })
            .await;

        match result {
            Ok(value) => Ok(value.clone()),
            Err(message) => {
                let mut slots = self.slots.lock();
                if slots.peek(key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    slots.pop(key);
                }
                Err(RipperError::Scan(message.clone()))
            }
        }
    }

    /// Drop every cached entry; in-flight computations finish for their current waiters
    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock();
        let count = slots.len();
        slots.clear();
        info!(entries = count, "Scan cache invalidated");
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Invalidate `cache` on every settings change until `shutdown` fires
pub fn spawn_invalidation<V: Send + Sync + 'static>(
    cache: Arc<ScanCache<V>>,
    events: EventSubscription,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv_async() => match event {
                    Ok(Event::SettingsUpdate) => cache.invalidate_all(),
                    Ok(_) => {}
                    Err(_) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::event_bus::EventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    async fn slow_value(counter: Arc<AtomicUsize>, value: u32) -> RipperResult<u32> {
        counter.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        Ok(value)
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_computation() {
        let cache = ScanCache::new(DEFAULT_SCAN_TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let (first, second) = tokio::join!(
            cache.get_or_compute("thread-1", || slow_value(calls.clone(), 7)),
            cache.get_or_compute("thread-1", || slow_value(calls.clone(), 8)),
        );

        let first = first.unwrap();
        let second = second.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_recomputed() {
        let cache = ScanCache::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_compute("t", || slow_value(calls.clone(), 1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        cache.get_or_compute("t", || slow_value(calls.clone(), 2)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = cache.get_or_compute("t", || slow_value(calls.clone(), 3)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*fresh, 3);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: ScanCache<u32> = ScanCache::new(DEFAULT_SCAN_TTL);
        let err = cache
            .get_or_compute("t", || async { Err(RipperError::Scan("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, RipperError::Scan(_)));
        assert!(cache.is_empty());

        let value = cache.get_or_compute("t", || async { Ok(5) }).await.unwrap();
        assert_eq!(*value, 5);
    }

    #[tokio::test]
    async fn test_settings_update_invalidates_everything() {
        let bus = EventBus::new();
        let cache = Arc::new(ScanCache::new(DEFAULT_SCAN_TTL));
        let shutdown = CancellationToken::new();
        let handle = spawn_invalidation(cache.clone(), bus.subscribe(), shutdown.clone());

        cache.get_or_compute("a", || async { Ok(1u32) }).await.unwrap();
        cache.get_or_compute("b", || async { Ok(2u32) }).await.unwrap();
        assert_eq!(cache.len(), 2);

        bus.publish(Event::SettingsUpdate);
        for _ in 0..50 {
            if cache.is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}

//! In-memory result cache keyed by request fingerprint.
//!
//! Entries are immutable once stored and handed out as `Arc`s, so eviction
//! only drops the cache's own reference. Capacity eviction is oldest-first
//! by insertion; TTL expiry is checked lazily on lookup.
//!
//! [`ResultCache::get_or_compute`] keeps at most one computation in flight
//! per fingerprint: concurrent callers queue on a per-fingerprint gate and
//! pick up the first caller's result once it lands.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use genroute_core::fingerprint::Fingerprint;
use genroute_core::types::{ProviderId, Timestamp};
use tokio::sync::Mutex;

use crate::provider::GenerationResult;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: Arc<GenerationResult>,
    pub provider_id: ProviderId,
    pub created_at: Timestamp,
    inserted: Instant,
}

#[derive(Default)]
struct Store {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<Fingerprint>,
}

impl Store {
    fn remove(&mut self, fingerprint: &Fingerprint) {
        if self.entries.remove(fingerprint).is_some() {
            self.order.retain(|fp| fp != fingerprint);
        }
    }
}

pub struct ResultCache {
    capacity: usize,
    ttl: Option<Duration>,
    store: Mutex<Store>,
    inflight: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl ResultCache {
    /// A `capacity` of zero disables storage.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity,
            ttl,
            store: Mutex::new(Store::default()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<GenerationResult>> {
        self.entry(fingerprint).await.map(|entry| entry.result)
    }

    /// Entry metadata plus result, if present and not expired.
    pub async fn entry(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut store = self.store.lock().await;
        let expired = match store.entries.get(fingerprint) {
            None => return None,
            Some(entry) => self.ttl.is_some_and(|ttl| entry.inserted.elapsed() >= ttl),
        };
        if expired {
            tracing::debug!(fingerprint = %fingerprint, "Cache entry expired");
            store.remove(fingerprint);
            return None;
        }
        store.entries.get(fingerprint).cloned()
    }

    /// Store `result`, replacing any entry for the same fingerprint.
    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        result: GenerationResult,
    ) -> Arc<GenerationResult> {
        let result = Arc::new(result);
        if self.capacity == 0 {
            return result;
        }

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            provider_id: result.provider_id.clone(),
            result: Arc::clone(&result),
            created_at: Utc::now(),
            inserted: Instant::now(),
        };

        let mut store = self.store.lock().await;
        store.remove(&fingerprint);
        store.entries.insert(fingerprint.clone(), entry);
        store.order.push_back(fingerprint.clone());
        while store.entries.len() > self.capacity {
            let Some(oldest) = store.order.pop_front() else {
                break;
            };
            store.entries.remove(&oldest);
            tracing::debug!(fingerprint = %oldest, "Cache entry evicted");
        }
        tracing::info!(
            fingerprint = %fingerprint,
            provider = %result.provider_id,
            entries = store.entries.len(),
            "Result cached"
        );
        result
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cached result for `fingerprint`, or the result of `compute` stored
    /// under it. The flag is `true` when the result came from the cache,
    /// including results produced by a concurrent caller.
    ///
    /// Failed computations are not cached; the next waiter computes anew.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> Result<(Arc<GenerationResult>, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GenerationResult, E>>,
    {
        if let Some(hit) = self.get(fingerprint).await {
            return Ok((hit, true));
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(fingerprint.clone()).or_default())
        };
        let guard = gate.lock().await;

        let outcome = match self.get(fingerprint).await {
            Some(hit) => {
                tracing::debug!(fingerprint = %fingerprint, "Joined in-flight computation");
                Ok((hit, true))
            }
            None => match compute().await {
                Ok(result) => Ok((self.put(fingerprint.clone(), result).await, false)),
                Err(e) => Err(e),
            },
        };

        {
            let mut inflight = self.inflight.lock().await;
            if inflight
                .get(fingerprint)
                .is_some_and(|current| Arc::ptr_eq(current, &gate))
            {
                inflight.remove(fingerprint);
            }
        }
        drop(guard);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genroute_core::request::GenerationRequest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fp(prompt: &str) -> Fingerprint {
        Fingerprint::of(&GenerationRequest::new(prompt))
    }

    fn result(provider: &str) -> GenerationResult {
        GenerationResult {
            provider_id: provider.to_string(),
            images: Vec::new(),
            seed: Some(1),
            job_id: None,
            elapsed: Duration::ZERO,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_then_get() {
        let cache = ResultCache::new(4, None);
        assert!(cache.get(&fp("a")).await.is_none());

        cache.put(fp("a"), result("comfyui")).await;
        let entry = cache.entry(&fp("a")).await.unwrap();
        assert_eq!(entry.provider_id, "comfyui");
        assert_eq!(entry.fingerprint, fp("a"));
    }

    #[tokio::test]
    async fn evicts_oldest_over_capacity() {
        let cache = ResultCache::new(2, None);
        cache.put(fp("a"), result("x")).await;
        cache.put(fp("b"), result("x")).await;
        let held = cache.get(&fp("a")).await.unwrap();
        cache.put(fp("c"), result("x")).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&fp("a")).await.is_none());
        assert!(cache.get(&fp("c")).await.is_some());
        // A reference handed out before eviction stays valid.
        assert_eq!(held.provider_id, "x");
    }

    #[tokio::test]
    async fn overwrite_refreshes_position() {
        let cache = ResultCache::new(2, None);
        cache.put(fp("a"), result("old")).await;
        cache.put(fp("b"), result("x")).await;
        cache.put(fp("a"), result("new")).await;
        cache.put(fp("c"), result("x")).await;

        assert!(cache.get(&fp("b")).await.is_none());
        assert_eq!(cache.get(&fp("a")).await.unwrap().provider_id, "new");
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache = ResultCache::new(4, Some(Duration::from_millis(20)));
        cache.put(fp("a"), result("x")).await;
        assert!(cache.get(&fp("a")).await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&fp("a")).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn zero_capacity_stores_nothing() {
        let cache = ResultCache::new(0, None);
        cache.put(fp("a"), result("x")).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(ResultCache::new(4, None));
        let calls = Arc::new(AtomicU32::new(0));

        let run = || {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute(&fp("same"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, ()>(result("comfyui"))
                    })
                    .await
            })
        };
        let (first, second) = tokio::join!(run(), run());
        let (first, second) = (first.unwrap().unwrap(), second.unwrap().unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.0, &second.0));
        assert_ne!(first.1, second.1);
        assert!(cache.inflight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = ResultCache::new(4, None);
        let err = cache
            .get_or_compute(&fp("a"), || async { Err::<GenerationResult, _>("boom") })
            .await;
        assert_eq!(err.unwrap_err(), "boom");
        assert!(cache.is_empty().await);

        let (_, hit) = cache
            .get_or_compute(&fp("a"), || async { Ok::<_, &str>(result("x")) })
            .await
            .unwrap();
        assert!(!hit);
    }
}

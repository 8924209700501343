//! Cache lifecycle engine.
//!
//! # Responsibilities
//! - Classify lookups into hit / miss / hit-for-pass
//! - Store fetched objects according to their admission
//! - Collapse concurrent fetches: at most one origin fetch per key
//! - Run background revalidation for stale hits
//!
//! # Flights
//! ```text
//! fetch(key) ──► flights[key] vacant? ──yes──► spawn fetch task, wait on it
//!                     │ no
//!                     └──────────────────────► wait on the existing task
//!
//! fetch task: run fetch (bounded by fetch_deadline)
//!     → apply admission to the store
//!     → remove flights[key]
//!     → publish result to every waiter
//! ```
//! The fetch runs on its own task. A requester that goes away only drops its
//! own receiver; the shared fetch keeps running for the others.
//!
//! Only the requester that started a flight receives an object that was not
//! admitted to the cache (hit-for-pass or uncacheable). Everyone who joined
//! gets `Diversion::Pass` instead, so a private response never leaves the
//! request it was fetched for.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::cache::entry::{CacheEntry, CachedResponse, Freshness};
use crate::cache::key::CacheKey;
use crate::cache::policy::{Admission, StoragePolicy};
use crate::cache::store::{CacheStore, Slot};
use crate::config::CacheConfig;
use crate::error::BackendError;
use crate::observability::metrics;

/// Result of a lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Fresh or stale object; check `freshness` to decide on revalidation.
    Hit(Arc<CacheEntry>),
    /// Nothing usable. Carries an expired object that may still back a
    /// stale-if-error fallback.
    Miss(Option<Arc<CacheEntry>>),
    /// Key is marked uncacheable.
    HitForPass,
}

/// Object produced by a completed fetch.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub response: CachedResponse,
    pub admission: Admission,
    /// Backend that produced the response.
    pub backend: String,
}

/// Ways a fetch can end without producing an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diversion {
    Restart,
    Error(StatusCode),
    DeliverStale,
    /// The shared object was not admitted to the cache; fetch on your own.
    Pass,
}

/// What every participant of a flight receives.
#[derive(Debug, Clone)]
pub enum FlightResult {
    Object(Arc<FetchedObject>),
    Failed(BackendError),
    Diverted(Diversion),
}

type FlightRx = watch::Receiver<Option<FlightResult>>;

struct EngineInner {
    store: CacheStore,
    flights: DashMap<CacheKey, FlightRx>,
    collapse_wait: Duration,
    fetch_deadline: Duration,
}

/// Shared cache engine. Cheap to clone.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

/// Removes the flight marker even if the fetch task panics.
struct FlightGuard {
    engine: CacheEngine,
    key: CacheKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.engine.inner.flights.remove(&self.key);
    }
}

impl CacheEngine {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_timeouts(
            Duration::from_millis(config.collapse_wait_ms),
            Duration::from_millis(config.fetch_deadline_ms),
        )
    }

    pub fn with_timeouts(collapse_wait: Duration, fetch_deadline: Duration) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store: CacheStore::new(),
                flights: DashMap::new(),
                collapse_wait,
                fetch_deadline,
            }),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let now = Instant::now();
        let lookup = match self.inner.store.get(key) {
            None => Lookup::Miss(None),
            Some(Slot::HitForPass { created_at, ttl }) => {
                if now.saturating_duration_since(created_at) < ttl {
                    Lookup::HitForPass
                } else {
                    Lookup::Miss(None)
                }
            }
            Some(Slot::Object(entry)) => match entry.freshness(now) {
                Freshness::Fresh | Freshness::Stale => {
                    entry.record_hit();
                    Lookup::Hit(entry)
                }
                Freshness::Expired => Lookup::Miss(Some(entry)),
            },
        };

        metrics::record_cache_lookup(match &lookup {
            Lookup::Hit(_) => "hit",
            Lookup::Miss(_) => "miss",
            Lookup::HitForPass => "hit_for_pass",
        });
        lookup
    }

    /// Insert or replace the object for `key`.
    ///
    /// Returns `None` when the effective TTL is zero; the previous entry is
    /// then left untouched.
    pub fn store(&self, key: &CacheKey, response: CachedResponse, policy: &StoragePolicy) -> Option<Arc<CacheEntry>> {
        let ttl = policy.effective_ttl(response.status);
        if ttl.is_zero() {
            tracing::debug!(key = ?key, status = %response.status, "Not storing zero TTL object");
            return None;
        }

        let policy = StoragePolicy { ttl, ..policy.clone() };
        let entry = Arc::new(CacheEntry::new(*key, response, &policy, Instant::now()));
        self.inner.store.insert(*key, Slot::Object(entry.clone()));
        metrics::record_cache_size(self.inner.store.len());
        Some(entry)
    }

    pub fn mark_hit_for_pass(&self, key: &CacheKey, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.inner.store.insert(
            *key,
            Slot::HitForPass {
                created_at: Instant::now(),
                ttl,
            },
        );
        metrics::record_cache_size(self.inner.store.len());
    }

    pub fn purge(&self, key: &CacheKey) -> bool {
        let removed = self.inner.store.remove(key);
        metrics::record_cache_size(self.inner.store.len());
        removed
    }

    /// True while a fetch for `key` is running.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inner.flights.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Fetch `key` through the shared flight, starting one if none is running.
    ///
    /// `make_fetch` is only called when this caller starts the flight.
    pub async fn fetch<M, F>(&self, key: &CacheKey, make_fetch: M) -> FlightResult
    where
        M: FnOnce() -> F,
        F: Future<Output = FlightResult> + Send + 'static,
    {
        let (rx, started) = self.start_flight(key, make_fetch);
        if started {
            return wait_for_flight(rx, self.inner.fetch_deadline).await;
        }

        metrics::record_collapsed_waiter();
        tracing::debug!(key = ?key, "Joining in-flight fetch");
        match wait_for_flight(rx, self.inner.collapse_wait).await {
            FlightResult::Object(object) if !matches!(object.admission, Admission::Cache(_)) => {
                tracing::debug!(key = ?key, "Shared object is not cacheable, passing");
                FlightResult::Diverted(Diversion::Pass)
            }
            other => other,
        }
    }

    /// Start a background refresh unless one is already running.
    ///
    /// Returns true if this call started it.
    pub fn revalidate<M, F>(&self, key: &CacheKey, make_fetch: M) -> bool
    where
        M: FnOnce() -> F,
        F: Future<Output = FlightResult> + Send + 'static,
    {
        let (_, started) = self.start_flight(key, make_fetch);
        if started {
            metrics::record_revalidation();
            tracing::debug!(key = ?key, "Background revalidation started");
        }
        started
    }

    fn start_flight<M, F>(&self, key: &CacheKey, make_fetch: M) -> (FlightRx, bool)
    where
        M: FnOnce() -> F,
        F: Future<Output = FlightResult> + Send + 'static,
    {
        match self.inner.flights.entry(*key) {
            Entry::Occupied(flight) => (flight.get().clone(), false),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());

                let fetch = make_fetch();
                let guard = FlightGuard {
                    engine: self.clone(),
                    key: *key,
                };
                let deadline = self.inner.fetch_deadline;
                tokio::spawn(async move {
                    let result = match time::timeout(deadline, fetch).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!(key = ?guard.key, ?deadline, "Shared fetch exceeded its deadline");
                            FlightResult::Failed(BackendError::Deadline)
                        }
                    };
                    guard.engine.admit(&guard.key, &result);
                    // Marker goes before waiters wake so late arrivals see the new object.
                    drop(guard);
                    let _ = tx.send(Some(result));
                });
                (rx, true)
            }
        }
    }

    fn admit(&self, key: &CacheKey, result: &FlightResult) {
        let FlightResult::Object(object) = result else {
            return;
        };
        match &object.admission {
            Admission::Cache(policy) => {
                self.store(key, object.response.clone(), policy);
            }
            Admission::HitForPass(ttl) => self.mark_hit_for_pass(key, *ttl),
            Admission::Uncacheable => {}
        }
    }

    /// Remove dead slots. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let removed = self.inner.store.sweep(Instant::now());
        metrics::record_cache_size(self.inner.store.len());
        removed
    }

    /// Sweep periodically until shutdown.
    pub fn spawn_sweeper(&self, every: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = engine.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept dead cache slots");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

async fn wait_for_flight(mut rx: FlightRx, deadline: Duration) -> FlightResult {
    match time::timeout(deadline, rx.wait_for(Option::is_some)).await {
        Ok(Ok(result)) => (*result).clone().unwrap_or(FlightResult::Failed(BackendError::Deadline)),
        Ok(Err(_)) => FlightResult::Failed(BackendError::Transport("fetch task ended without a result".into())),
        Err(_) => FlightResult::Failed(BackendError::Deadline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn engine() -> CacheEngine {
        CacheEngine::with_timeouts(secs(5), secs(30))
    }

    fn response(body: &'static str) -> CachedResponse {
        CachedResponse::new(StatusCode::OK, HeaderMap::new(), body)
    }

    fn object(body: &'static str, admission: Admission) -> FlightResult {
        FlightResult::Object(Arc::new(FetchedObject {
            response: response(body),
            admission,
            backend: "origin".into(),
        }))
    }

    fn not_called() -> std::future::Ready<FlightResult> {
        panic!("a joining requester must not start a fetch")
    }

    fn body_of(result: &FlightResult) -> String {
        match result {
            FlightResult::Object(o) => String::from_utf8(o.response.body.to_vec()).unwrap(),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_stale_expired_scenario() {
        let engine = engine();
        let key = CacheKey::from_parts(["k"]);
        let policy = StoragePolicy::new(secs(60)).with_grace(secs(3600));
        engine.store(&key, response("v1"), &policy).unwrap();

        assert!(matches!(engine.lookup(&key), Lookup::Hit(e) if e.freshness(Instant::now()) == Freshness::Fresh));

        time::advance(secs(61)).await;
        let entry = match engine.lookup(&key) {
            Lookup::Hit(entry) => entry,
            other => panic!("expected stale hit, got {other:?}"),
        };
        assert_eq!(entry.freshness(Instant::now()), Freshness::Stale);

        let fetches = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let fetches = fetches.clone();
            engine.revalidate(&key, move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                time::sleep(Duration::from_millis(100)).await;
                object("v2", Admission::Cache(StoragePolicy::new(secs(60)).with_grace(secs(3600))))
            });
        }
        // Stale body is still served while the refresh runs.
        assert!(engine.is_fetching(&key));
        assert!(matches!(engine.lookup(&key), Lookup::Hit(e) if e.response.body == "v1"));

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(!engine.is_fetching(&key));
        assert!(matches!(engine.lookup(&key), Lookup::Hit(e) if e.response.body == "v2"));

        time::advance(secs(3700)).await;
        assert!(matches!(engine.lookup(&key), Lookup::Miss(Some(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_collapse_into_one_fetch() {
        let engine = engine();
        let key = CacheKey::from_parts(["/hot"]);
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let engine = engine.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .fetch(&key, move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        time::sleep(Duration::from_millis(200)).await;
                        object("shared", Admission::Cache(StoragePolicy::new(secs(60))))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(body_of(&handle.await.unwrap()), "shared");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(matches!(engine.lookup(&key), Lookup::Hit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_requester_does_not_cancel_shared_fetch() {
        let engine = engine();
        let key = CacheKey::from_parts(["/slow"]);

        let leader = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .fetch(&key, || async {
                        time::sleep(secs(1)).await;
                        object("done", Admission::Cache(StoragePolicy::new(secs(60))))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(engine.is_fetching(&key));

        let follower = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.fetch(&key, not_called).await })
        };
        tokio::task::yield_now().await;

        leader.abort();
        assert_eq!(body_of(&follower.await.unwrap()), "done");
        assert!(matches!(engine.lookup(&key), Lookup::Hit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_deadline_releases_waiters() {
        let engine = CacheEngine::with_timeouts(secs(60), secs(2));
        let key = CacheKey::from_parts(["/hang"]);

        let result = engine
            .fetch(&key, || async {
                time::sleep(secs(3600)).await;
                object("never", Admission::Uncacheable)
            })
            .await;
        assert!(matches!(result, FlightResult::Failed(BackendError::Deadline)));
        time::sleep(Duration::from_millis(10)).await;
        assert!(!engine.is_fetching(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_deadline_is_per_requester() {
        let engine = CacheEngine::with_timeouts(secs(1), secs(30));
        let key = CacheKey::from_parts(["/slow"]);

        let leader = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .fetch(&key, || async {
                        time::sleep(secs(5)).await;
                        object("late", Admission::Cache(StoragePolicy::new(secs(60))))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = engine.fetch(&key, not_called).await;
        assert!(matches!(waiter, FlightResult::Failed(BackendError::Deadline)));
        assert_eq!(body_of(&leader.await.unwrap()), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_without_sie_is_not_stored() {
        let engine = engine();
        let key = CacheKey::from_parts(["/err"]);
        let failing = CachedResponse::new(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), "down");

        assert!(engine.store(&key, failing.clone(), &StoragePolicy::new(secs(60))).is_none());
        assert!(matches!(engine.lookup(&key), Lookup::Miss(None)));

        let stored = engine.store(&key, failing, &StoragePolicy::new(secs(60)).with_sie(secs(300)));
        assert!(stored.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_keeps_previous_entry() {
        let engine = engine();
        let key = CacheKey::from_parts(["/page"]);
        let policy = StoragePolicy::new(secs(10)).with_sie(secs(600));
        engine.store(&key, response("old"), &policy).unwrap();

        time::advance(secs(20)).await;
        let expired = match engine.lookup(&key) {
            Lookup::Miss(Some(entry)) => entry,
            other => panic!("expected expired miss, got {other:?}"),
        };

        let result = engine
            .fetch(&key, || async { FlightResult::Failed(BackendError::Connect("a".into())) })
            .await;
        assert!(matches!(result, FlightResult::Failed(BackendError::Connect(_))));
        assert!(expired.within_stale_if_error(Instant::now()));
        assert!(matches!(engine.lookup(&key), Lookup::Miss(Some(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_for_pass_marker() {
        let engine = engine();
        let key = CacheKey::from_parts(["/private"]);
        let result = engine
            .fetch(&key, || async { object("private", Admission::HitForPass(secs(120))) })
            .await;
        assert_eq!(body_of(&result), "private");
        assert!(matches!(engine.lookup(&key), Lookup::HitForPass));

        time::advance(secs(121)).await;
        assert!(matches!(engine.lookup(&key), Lookup::Miss(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiners_of_uncached_flight_are_sent_to_pass() {
        let engine = engine();
        let key = CacheKey::from_parts(["/me"]);

        let leader = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .fetch(&key, || async {
                        time::sleep(secs(1)).await;
                        object("user-a", Admission::HitForPass(secs(120)))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let joiners: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.fetch(&key, not_called).await })
            })
            .collect();

        assert_eq!(body_of(&leader.await.unwrap()), "user-a");
        for joiner in joiners {
            let result = joiner.await.unwrap();
            assert!(matches!(result, FlightResult::Diverted(Diversion::Pass)), "got {result:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_and_sweep() {
        let engine = engine();
        let a = CacheKey::from_parts(["a"]);
        let b = CacheKey::from_parts(["b"]);
        engine.store(&a, response("a"), &StoragePolicy::new(secs(10)));
        engine.store(&b, response("b"), &StoragePolicy::new(secs(1000)));
        assert_eq!(engine.len(), 2);

        assert!(engine.purge(&b));
        assert!(!engine.purge(&b));

        time::advance(secs(11)).await;
        assert_eq!(engine.sweep(), 1);
        assert!(engine.is_empty());
    }
}

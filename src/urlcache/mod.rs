//! # Coalescing URL Cache
//!
//! In-process memoization of HTTP GET bodies keyed by URL, with:
//!
//! - **TTL-bounded entries**: a cached body is served only while fresh;
//!   stale entries are removed lazily on the next lookup
//! - **Request coalescing**: concurrent misses for the same URL produce at
//!   most one outbound request; the leader broadcasts its outcome to every
//!   waiter through single-shot channels
//! - **Bounded retry**: failures are retried up to a budget, by one task at
//!   a time, so a failing origin never sees a thundering herd
//!
//! The entry table and the in-flight table are guarded by separate locks so
//! fetch progress never blocks cache hits. Locks are never held across
//! suspension points. Dropping a `fetch` future cancels it: a cancelled
//! waiter detaches silently, while a cancelled leader tears down the
//! in-flight record so waiters observe a failure and can retry themselves.
//!
//! TLS certificate verification is on by default; opting out is an explicit
//! builder choice for test rigs.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

/// Entry TTL applied when neither the call site nor the builder overrides it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default retry budget for failed fetches.
pub const DEFAULT_RETRIES: u32 = 3;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_MAX_IDLE: usize = 100;

/// URL cache errors
#[derive(Error, Debug)]
pub enum UrlCacheError {
    /// Network-level failure from the HTTP client
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The origin answered with a non-200 status
    #[error("unexpected response status: {0}")]
    Status(u16),

    /// A coalesced fetch observed the leader's failure
    #[error("coalesced fetch failed: {0}")]
    Coalesced(String),
}

pub type UrlCacheResult<T> = Result<T, UrlCacheError>;

/// Counters exposed by [`UrlCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Fresh-entry lookups served from memory
    pub hits: u64,
    /// Lookups that found no entry at all
    pub misses: u64,
    /// Entries currently stored (fresh or awaiting lazy eviction)
    pub entries: usize,
}

// Failure sentinel broadcast to waiters; distinct from an empty success body.
#[derive(Clone, Debug)]
struct FetchFailure(Arc<str>);

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type FetchOutcome = Result<Vec<u8>, FetchFailure>;

struct CacheEntry {
    body: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }
}

enum Lookup {
    Fresh(Vec<u8>),
    Stale,
    Absent,
}

/// Builder for [`UrlCache`].
pub struct UrlCacheBuilder {
    default_ttl: Duration,
    retries: u32,
    timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle: usize,
    accept_invalid_certs: bool,
}

impl UrlCacheBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle: DEFAULT_POOL_MAX_IDLE,
            accept_invalid_certs: false,
        }
    }

    /// TTL applied to entries stored without a per-call override.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Retry budget for failed fetches.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disable TLS certificate verification. Off unless explicitly enabled;
    /// intended for test rigs with self-signed origins only.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Construct the cache and its HTTP client.
    pub fn build(self) -> UrlCacheResult<UrlCache> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()?;

        Ok(UrlCache {
            default_ttl: self.default_ttl,
            retries: self.retries,
            client,
            storage: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }
}

impl Default for UrlCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// TTL cache of HTTP GET bodies with in-flight request coalescing.
pub struct UrlCache {
    default_ttl: Duration,
    retries: u32,
    client: reqwest::Client,

    // Entry table; acquired before the in-flight lock, released before any
    // fetch starts
    storage: RwLock<HashMap<String, CacheEntry>>,

    // URL -> waiter slots for fetches currently in flight
    in_flight: Mutex<HashMap<String, Vec<oneshot::Sender<FetchOutcome>>>>,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl UrlCache {
    /// Create a cache with the given default entry TTL.
    pub fn new(default_ttl: Duration) -> UrlCacheResult<Self> {
        UrlCacheBuilder::new().default_ttl(default_ttl).build()
    }

    /// Create a builder for non-default construction.
    pub fn builder() -> UrlCacheBuilder {
        UrlCacheBuilder::new()
    }

    /// Fetch `url`, serving a fresh cached body when one exists.
    ///
    /// On miss the call coalesces with any fetch already in flight for the
    /// same URL. The body is stored with `ttl_override` when given, the
    /// cache default otherwise. Dropping the returned future cancels the
    /// call without disturbing other fetchers of the same URL.
    pub async fn fetch(
        &self,
        url: &str,
        ttl_override: Option<Duration>,
    ) -> UrlCacheResult<Vec<u8>> {
        let lookup = {
            let storage = self.storage.read();
            match storage.get(url) {
                Some(entry) if entry.is_fresh() => Lookup::Fresh(entry.body.clone()),
                Some(_) => Lookup::Stale,
                None => Lookup::Absent,
            }
        };

        match lookup {
            Lookup::Fresh(body) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(body);
            }
            Lookup::Stale => {
                // Evict under the exclusive lock before the miss path runs;
                // this is not a logical miss
                self.storage.write().remove(url);
            }
            Lookup::Absent => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        let body = self.fetch_coalesced(url).await?;

        self.storage.write().insert(
            url.to_string(),
            CacheEntry {
                body: body.clone(),
                created_at: Instant::now(),
                ttl: ttl_override.unwrap_or(self.default_ttl),
            },
        );

        Ok(body)
    }

    /// Current hit/miss/entry counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.storage.read().len(),
        }
    }

    // Coalesce with any in-flight fetch of `url`, retrying observed
    // failures until the budget runs out. Whichever task finds no in-flight
    // record becomes the leader, performs the real fetch, and broadcasts the
    // outcome to every waiter registered in the meantime.
    async fn fetch_coalesced(&self, url: &str) -> UrlCacheResult<Vec<u8>> {
        let mut retries = self.retries;

        loop {
            let waiter = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get_mut(url) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        in_flight.insert(url.to_string(), Vec::new());
                        None
                    }
                }
            };

            let err = match waiter {
                Some(rx) => match rx.await {
                    Ok(Ok(body)) => return Ok(body),
                    Ok(Err(failure)) => UrlCacheError::Coalesced(failure.to_string()),
                    // The leader was cancelled before broadcasting
                    Err(_) => UrlCacheError::Coalesced("fetch leader cancelled".to_string()),
                },
                None => {
                    let mut guard = InFlightGuard {
                        in_flight: &self.in_flight,
                        url,
                        armed: true,
                    };

                    let result = self.fetch_once(url).await;

                    let broadcast: FetchOutcome = match &result {
                        Ok(body) => Ok(body.clone()),
                        Err(err) => Err(FetchFailure(Arc::from(err.to_string()))),
                    };
                    let waiters = self.in_flight.lock().remove(url).unwrap_or_default();
                    guard.armed = false;

                    // Registration order; every waiter sees the same outcome
                    for tx in waiters {
                        let _ = tx.send(broadcast.clone());
                    }

                    match result {
                        Ok(body) => return Ok(body),
                        Err(err) => err,
                    }
                }
            };

            if retries == 0 {
                return Err(err);
            }
            retries -= 1;
            tracing::debug!(%url, remaining = retries, error = %err, "retrying failed fetch");
        }
    }

    async fn fetch_once(&self, url: &str) -> UrlCacheResult<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(UrlCacheError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

// Tears down the in-flight record when a leader is dropped before it could
// broadcast, waking waiters with a closed-channel failure.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, Vec<oneshot::Sender<FetchOutcome>>>>,
    url: &'a str,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.lock().remove(self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    async fn spawn_origin(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    // Origin that counts calls, waits `delay`, then answers per `handler`
    // (which receives the zero-based call number).
    fn counting_origin(
        delay: Duration,
        handler: impl Fn(usize) -> (StatusCode, Vec<u8>) + Clone + Send + Sync + 'static,
    ) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/",
                get(move |State(calls): State<Arc<AtomicUsize>>| {
                    let handler = handler.clone();
                    async move {
                        let call = calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        handler(call)
                    }
                }),
            )
            .with_state(Arc::clone(&calls));
        (router, calls)
    }

    #[tokio::test]
    async fn test_fetch_then_hit() {
        let (router, calls) =
            counting_origin(Duration::ZERO, |_| (StatusCode::OK, b"Server reponse!".to_vec()));
        let url = spawn_origin(router).await;
        let cache = UrlCache::new(Duration::from_secs(15)).unwrap();

        let body = cache.fetch(&url, None).await.unwrap();
        assert_eq!(body, b"Server reponse!");

        let body = cache.fetch(&url, None).await.unwrap();
        assert_eq!(body, b"Server reponse!");

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_with_initial_failure() {
        // First origin call fails, later ones succeed after a delay; all ten
        // fetchers coalesce and retry to the same successful body
        let (router, _calls) = counting_origin(Duration::from_millis(25), |call| {
            if call == 0 {
                (StatusCode::INTERNAL_SERVER_ERROR, b"Simulated error".to_vec())
            } else {
                (StatusCode::OK, b"Concurrent Hello!".to_vec())
            }
        });
        let url = spawn_origin(router).await;
        let cache = Arc::new(UrlCache::new(Duration::from_secs(15)).unwrap());

        let barrier = Arc::new(Barrier::new(10));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let url = url.clone();
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                cache.fetch(&url, None).await
            }));
        }

        for task in tasks {
            let body = task.await.unwrap().unwrap();
            assert_eq!(body, b"Concurrent Hello!");
        }

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 0,
                misses: 10,
                entries: 1
            }
        );
    }

    #[tokio::test]
    async fn test_coalescing_single_origin_call() {
        let (router, calls) = counting_origin(Duration::from_millis(100), |_| {
            (StatusCode::OK, b"slow body".to_vec())
        });
        let url = spawn_origin(router).await;
        let cache = Arc::new(UrlCache::new(Duration::from_secs(15)).unwrap());

        let barrier = Arc::new(Barrier::new(10));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let url = url.clone();
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                cache.fetch(&url, None).await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), b"slow body");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "all fetchers coalesced");
    }

    #[tokio::test]
    async fn test_ttl_expiry_refetches_without_counting_a_miss() {
        let (router, calls) =
            counting_origin(Duration::ZERO, |_| (StatusCode::OK, b"Server reponse!".to_vec()));
        let url = spawn_origin(router).await;
        let cache = UrlCache::new(Duration::from_secs(5)).unwrap();

        cache
            .fetch(&url, Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(6)).await;
        cache.fetch(&url, None).await.unwrap();

        // The second fetch went to the origin, but the miss counter tracks
        // initial absence only
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 0,
                misses: 1,
                entries: 1
            }
        );
    }

    #[tokio::test]
    async fn test_retry_budget_covers_transient_failures() {
        // Three failures then success: within the default budget of three
        // retries after the initial attempt
        let (router, calls) = counting_origin(Duration::ZERO, |call| {
            if call < 3 {
                (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
            } else {
                (StatusCode::OK, b"recovered".to_vec())
            }
        });
        let url = spawn_origin(router).await;
        let cache = UrlCache::new(Duration::from_secs(15)).unwrap();

        assert_eq!(cache.fetch(&url, None).await.unwrap(), b"recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let (router, calls) =
            counting_origin(Duration::ZERO, |_| (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()));
        let url = spawn_origin(router).await;
        let cache = UrlCache::builder()
            .default_ttl(Duration::from_secs(15))
            .retries(3)
            .build()
            .unwrap();

        let result = cache.fetch(&url, None).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4, "initial attempt plus budget");
        assert_eq!(cache.stats().entries, 0, "failures are not cached");
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() {
        let (router, _calls) =
            counting_origin(Duration::ZERO, |_| (StatusCode::NOT_FOUND, Vec::new()));
        let url = spawn_origin(router).await;
        let cache = UrlCache::builder().retries(0).build().unwrap();

        match cache.fetch(&url, None).await {
            Err(UrlCacheError::Status(404)) => {}
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_waiters() {
        let (router, calls) = counting_origin(Duration::from_millis(200), |_| {
            (StatusCode::OK, b"eventually".to_vec())
        });
        let url = spawn_origin(router).await;
        let cache = Arc::new(UrlCache::new(Duration::from_secs(15)).unwrap());

        let leader = {
            let cache = Arc::clone(&cache);
            let url = url.clone();
            tokio::spawn(async move { cache.fetch(&url, None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let waiter = {
            let cache = Arc::clone(&cache);
            let url = url.clone();
            tokio::spawn(async move { cache.fetch(&url, None).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        leader.abort();

        // The waiter observes the leader's cancellation and retries on its
        // own budget
        let body = waiter.await.unwrap().unwrap();
        assert_eq!(body, b"eventually");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_body_is_a_valid_success() {
        let (router, _calls) = counting_origin(Duration::ZERO, |_| (StatusCode::OK, Vec::new()));
        let url = spawn_origin(router).await;
        let cache = UrlCache::new(Duration::from_secs(15)).unwrap();

        assert_eq!(cache.fetch(&url, None).await.unwrap(), Vec::<u8>::new());
        assert_eq!(cache.stats().entries, 1);
    }
}

//! Result cache keyed by template id and canonical parameters.
//!
//! Completed results live in an LRU bounded by entry count and bytes.
//! Queries still running live in a separate in-flight map that eviction
//! never touches. The first caller for a missing key becomes the leader and
//! runs the producer; later callers subscribe to the leader's outcome,
//! success or failure, instead of issuing their own warehouse query. The map
//! lock is only held for bookkeeping, never across the producer.
//!
//! If the leader is cancelled its flight is dropped and waiting callers
//! race once more for leadership, so exactly one of them re-runs the
//! producer. Failures are handed to joined callers but never stored.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ResultCacheConfig;
use crate::error::{GmpflowError, Result};
use crate::params::CanonicalParams;
use crate::table::ResultTable;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub template: String,
    pub params: CanonicalParams,
}

impl CacheKey {
    pub fn new(template: impl Into<String>, params: CanonicalParams) -> Self {
        Self {
            template: template.into(),
            params,
        }
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    table: Arc<ResultTable>,
    created_at: Instant,
    bytes: usize,
}

impl CacheEntry {
    fn new(table: ResultTable) -> Self {
        let bytes = table.approx_bytes();
        Self {
            table: Arc::new(table),
            created_at: Instant::now(),
            bytes,
        }
    }

    pub fn table(&self) -> &Arc<ResultTable> {
        &self.table
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// What a leader hands to the callers that joined its query.
type Outcome = std::result::Result<Arc<ResultTable>, Arc<GmpflowError>>;

struct Flight {
    id: u64,
    tx: watch::Sender<Option<Outcome>>,
}

struct Slots {
    ready: LruCache<CacheKey, CacheEntry>,
    bytes: usize,
    in_flight: HashMap<CacheKey, Flight>,
    next_flight: u64,
}

impl Slots {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.ready.pop(key) {
            self.bytes -= entry.bytes;
        }
    }
}

enum Role {
    Hit(Arc<ResultTable>),
    Lead(u64),
    Follow(watch::Receiver<Option<Outcome>>),
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ResultCache {
    slots: Mutex<Slots>,
    max_bytes: usize,
    ttl: Option<Duration>,
    counters: Counters,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_config(&ResultCacheConfig::default())
    }

    pub fn with_config(config: &ResultCacheConfig) -> Self {
        Self {
            slots: Mutex::new(Slots {
                ready: LruCache::new(
                    NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN),
                ),
                bytes: 0,
                in_flight: HashMap::new(),
                next_flight: 0,
            }),
            max_bytes: config.max_bytes,
            ttl: config.ttl(),
            counters: Counters::default(),
        }
    }

    /// Return the cached table for `key`, or run `producer` once to create it.
    ///
    /// Callers arriving while the producer runs share its outcome. An error
    /// they receive that way is wrapped in [`GmpflowError::Shared`].
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, producer: F) -> Result<Arc<ResultTable>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResultTable>>,
    {
        loop {
            match self.role_for(key) {
                Role::Hit(table) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(template = %key.template, params = %key.params, "result cache hit");
                    return Ok(table);
                }
                Role::Follow(mut rx) => {
                    let outcome = rx
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|value| (*value).clone());
                    match outcome {
                        Some(Ok(table)) => {
                            self.counters.hits.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(template = %key.template, params = %key.params, "joined in-flight query");
                            return Ok(table);
                        }
                        Some(Err(err)) => return Err(GmpflowError::Shared(err)),
                        None => {
                            tracing::debug!(template = %key.template, "in-flight query abandoned, retrying");
                        }
                    }
                }
                Role::Lead(id) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(template = %key.template, params = %key.params, "result cache miss");
                    let mut flight = FlightGuard {
                        cache: self,
                        key,
                        id,
                        settled: false,
                    };
                    let result = producer().await;
                    return flight.settle(result);
                }
            }
        }
    }

    /// Whether a completed, unexpired entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let slots = self.slots.lock();
        slots
            .ready
            .peek(key)
            .is_some_and(|entry| !self.is_expired(entry))
    }

    /// Drop the completed entry for `key`. A query already running is left alone.
    pub fn invalidate(&self, key: &CacheKey) {
        self.slots.lock().remove(key);
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.ready.clear();
        slots.bytes = 0;
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        self.slots.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a query currently running.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().in_flight.len()
    }

    /// Approximate bytes held by completed entries.
    pub fn bytes(&self) -> usize {
        self.slots.lock().bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.created_at.elapsed() >= ttl)
    }

    fn role_for(&self, key: &CacheKey) -> Role {
        let mut guard = self.slots.lock();
        let slots = &mut *guard;
        if let Some(entry) = slots.ready.get(key) {
            if !self.is_expired(entry) {
                return Role::Hit(entry.table.clone());
            }
            tracing::debug!(template = %key.template, "result cache entry expired");
            slots.remove(key);
        }
        if let Some(flight) = slots.in_flight.get(key) {
            return Role::Follow(flight.tx.subscribe());
        }
        let id = slots.next_flight;
        slots.next_flight += 1;
        let (tx, _) = watch::channel(None);
        slots.in_flight.insert(key.clone(), Flight { id, tx });
        Role::Lead(id)
    }

    /// Store a completed entry and enforce both bounds. The newest entry is never evicted.
    fn insert_ready(&self, slots: &mut Slots, key: CacheKey, entry: CacheEntry) {
        slots.bytes += entry.bytes;
        if let Some((old_key, old)) = slots.ready.push(key.clone(), entry) {
            slots.bytes -= old.bytes;
            if old_key != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(template = %old_key.template, params = %old_key.params, "evicted result over entry limit");
            }
        }

        if self.max_bytes == 0 {
            return;
        }
        while slots.bytes > self.max_bytes && slots.ready.len() > 1 {
            let Some((lru_key, old)) = slots.ready.pop_lru() else {
                break;
            };
            slots.bytes -= old.bytes;
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                template = %lru_key.template,
                params = %lru_key.params,
                cache_bytes = slots.bytes,
                "evicted result over byte budget"
            );
        }
    }
}

/// Owns the leader's flight; dropping it unsettled (cancellation) releases waiters.
struct FlightGuard<'a> {
    cache: &'a ResultCache,
    key: &'a CacheKey,
    id: u64,
    settled: bool,
}

impl FlightGuard<'_> {
    fn take_flight(&self, slots: &mut Slots) -> Option<Flight> {
        let ours = slots
            .in_flight
            .get(self.key)
            .is_some_and(|flight| flight.id == self.id);
        if ours {
            slots.in_flight.remove(self.key)
        } else {
            None
        }
    }

    fn settle(&mut self, result: Result<ResultTable>) -> Result<Arc<ResultTable>> {
        self.settled = true;
        let mut slots = self.cache.slots.lock();
        let flight = self.take_flight(&mut slots);
        match result {
            Ok(table) => {
                let entry = CacheEntry::new(table);
                let table = entry.table.clone();
                self.cache.insert_ready(&mut slots, self.key.clone(), entry);
                if let Some(flight) = flight {
                    flight.tx.send_replace(Some(Ok(table.clone())));
                }
                Ok(table)
            }
            Err(err) => match flight {
                Some(flight) if flight.tx.receiver_count() > 0 => {
                    let err = Arc::new(err);
                    flight.tx.send_replace(Some(Err(err.clone())));
                    Err(GmpflowError::Shared(err))
                }
                _ => Err(err),
            },
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let flight = self.take_flight(&mut self.cache.slots.lock());
        if flight.is_some() {
            tracing::debug!(template = %self.key.template, "leader abandoned in-flight query");
        }
    }
}

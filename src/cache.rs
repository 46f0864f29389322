//! Anonymous DNS response cache.
//!
//! Entries are keyed by a salted SHA-256 digest of the query name and type,
//! so neither the map nor anything derived from it holds a domain in
//! cleartext. The salt is random per process.
//!
//! Storage is split into LRU shards to keep lock hold times short. Concurrent
//! misses for the same key share one upstream resolution: the first caller
//! leads, later callers wait on a oneshot channel. If the leader is
//! cancelled its waiters wake up and one of them takes over.

use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::dns::{QueryType, min_ttl};
use crate::error::ResolveError;
use crate::stats::{Stats, StatsEvent};

/// Salted digest of (domain, query type).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn shard(&self, shards: usize) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        (u64::from_le_bytes(prefix) % shards as u64) as usize
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Vec<u8>,
    pub created_at: Instant,
    pub ttl: Duration,
    pub hits: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.created_at + self.ttl
    }

    /// Time left before expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        (self.created_at + self.ttl).saturating_duration_since(now)
    }
}

/// Result of [`ResponseCache::get_or_resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub payload: Vec<u8>,
    pub cached: bool,
}

type Outcome = Result<Vec<u8>, ResolveError>;

pub struct ResponseCache {
    salt: [u8; 32],
    shards: Vec<Mutex<LruCache<CacheKey, CacheEntry>>>,
    flights: DashMap<CacheKey, Vec<oneshot::Sender<Outcome>>>,
    min_ttl: Duration,
    max_ttl: Duration,
    negative_ttl: Duration,
    stats: Arc<Stats>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, stats: Arc<Stats>) -> Self {
        let capacity = config.capacity.max(1);
        let shard_count = config.shards.clamp(1, capacity);
        // Shard capacities add up to exactly `capacity`.
        let (base, extra) = (capacity / shard_count, capacity % shard_count);

        Self {
            salt: rand::random(),
            shards: (0..shard_count)
                .map(|i| {
                    let size = base + usize::from(i < extra);
                    let size = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
                    Mutex::new(LruCache::new(size))
                })
                .collect(),
            flights: DashMap::new(),
            min_ttl: config.min_ttl(),
            max_ttl: config.max_ttl(),
            negative_ttl: config.negative_ttl(),
            stats,
        }
    }

    /// Digest for a normalized domain and query type.
    pub fn key(&self, domain: &str, qtype: QueryType) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(domain.as_bytes());
        hasher.update([0u8]);
        hasher.update(qtype.code().to_be_bytes());
        CacheKey(hasher.finalize().into())
    }

    /// Fresh entry for the query, if any. Expired entries are dropped.
    pub fn get(&self, domain: &str, qtype: QueryType) -> Option<CacheEntry> {
        let found = self.lookup(&self.key(domain, qtype));
        self.stats.record(if found.is_some() {
            StatsEvent::CacheHit
        } else {
            StatsEvent::CacheMiss
        });
        found
    }

    /// Store `payload` for `ttl`, capped at the configured maximum.
    pub fn insert(&self, domain: &str, qtype: QueryType, payload: Vec<u8>, ttl: Duration) {
        self.store(self.key(domain, qtype), payload, ttl.min(self.max_ttl));
    }

    /// Store a response using the TTL of its records.
    ///
    /// Responses without records use the negative TTL. Nothing is stored
    /// when the effective TTL is zero.
    pub fn insert_response(&self, domain: &str, qtype: QueryType, payload: Vec<u8>) {
        self.store_response(self.key(domain, qtype), payload);
    }

    fn store_response(&self, key: CacheKey, payload: Vec<u8>) {
        let ttl = match min_ttl(&payload) {
            Some(ttl) => ttl.max(self.min_ttl).min(self.max_ttl),
            None => self.negative_ttl,
        };
        self.store(key, payload, ttl);
    }

    fn store(&self, key: CacheKey, payload: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let entry = CacheEntry {
            key,
            payload,
            created_at: Instant::now(),
            ttl,
            hits: 0,
        };

        let Ok(mut shard) = self.shards[key.shard(self.shards.len())].lock() else {
            return;
        };
        if let Some((evicted, _)) = shard.push(key, entry) {
            if evicted != key {
                self.stats.record(StatsEvent::CacheEviction);
            }
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let Ok(mut shard) = self.shards[key.shard(self.shards.len())].lock() else {
            return None;
        };

        let entry = shard.get_mut(key)?;
        if entry.is_expired(now) {
            shard.pop(key);
            return None;
        }
        entry.hits += 1;
        Some(entry.clone())
    }

    /// Cached payload, or the result of `resolve` shared by every
    /// concurrent caller for the same key.
    ///
    /// The whole call, including waiting on another caller's resolution,
    /// is bounded by `deadline`.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        domain: &str,
        qtype: QueryType,
        deadline: Instant,
        resolve: F,
    ) -> Result<Lookup, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let key = self.key(domain, qtype);
        let mut first = true;

        let flight = loop {
            let found = self.lookup(&key);
            if first {
                self.stats.record(if found.is_some() {
                    StatsEvent::CacheHit
                } else {
                    StatsEvent::CacheMiss
                });
                first = false;
            }
            if let Some(entry) = found {
                return Ok(Lookup {
                    payload: entry.payload,
                    cached: true,
                });
            }

            let waiter = match self.flights.entry(key) {
                Entry::Occupied(mut waiting) => {
                    let (tx, rx) = oneshot::channel();
                    waiting.get_mut().push(tx);
                    rx
                }
                Entry::Vacant(slot) => {
                    slot.insert(Vec::new());
                    break Flight {
                        flights: &self.flights,
                        key,
                        done: false,
                    };
                }
            };

            match tokio::time::timeout_at(deadline, waiter).await {
                Err(_) => return Err(ResolveError::Timeout),
                Ok(Ok(outcome)) => {
                    return outcome.map(|payload| Lookup {
                        payload,
                        cached: false,
                    });
                }
                // Leader went away without an answer.
                Ok(Err(_)) => continue,
            }
        };

        // A previous leader may have stored the answer after our lookup.
        if let Some(entry) = self.lookup(&key) {
            flight.complete(Ok(entry.payload.clone()));
            return Ok(Lookup {
                payload: entry.payload,
                cached: true,
            });
        }

        let outcome = match tokio::time::timeout_at(deadline, resolve()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ResolveError::Timeout),
        };
        if let Ok(payload) = &outcome {
            self.store_response(key, payload.clone());
        }
        flight.complete(outcome.clone());

        outcome.map(|payload| Lookup {
            payload,
            cached: false,
        })
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;

        for shard in &self.shards {
            let Ok(mut shard) = shard.lock() else {
                continue;
            };
            let expired: Vec<CacheKey> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| *key)
                .collect();
            for key in &expired {
                shard.pop(key);
            }
            purged += expired.len();
        }

        purged
    }

    /// Periodically purge expired entries until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = self.len(), "swept expired cache entries");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().map(|s| s.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolutions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Leadership of one in-flight resolution. Dropping it without completing
/// releases the waiters so they can retry.
struct Flight<'a> {
    flights: &'a DashMap<CacheKey, Vec<oneshot::Sender<Outcome>>>,
    key: CacheKey,
    done: bool,
}

impl Flight<'_> {
    fn complete(mut self, outcome: Outcome) {
        self.done = true;
        if let Some((_, waiters)) = self.flights.remove(&self.key) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.flights.remove(&self.key);
        }
    }
}

//! Query resolution pipeline.
//!
//! 1. Validate the name and query type
//! 2. Blocklist check (blocked queries stop here)
//! 3. Anonymous cache, sharing one upstream resolution per key
//! 4. Upstream servers in priority order, skipping open circuits and
//!    failing over on error or per-attempt timeout
//!
//! Nothing here logs or returns the queried name.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::config::ResolverConfig;
use crate::dns::{self, DnsQuery, QueryType, normalize_name};
use crate::error::{FailureReason, PoolError, ResolveError};
use crate::filter::{Category, MatchEngine};
use crate::pool::ConnectionPool;
use crate::stats::{Stage, Stats, StatsEvent};

/// Outcome of one resolution request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub blocked: bool,
    pub category: Option<Category>,
    /// Wire-format response with a fresh transaction id.
    pub response: Option<Vec<u8>>,
    /// Served from the cache without contacting an upstream.
    pub cached: bool,
    pub error: Option<ResolveError>,
}

impl Resolution {
    fn blocked(category: Option<Category>) -> Self {
        Self {
            blocked: true,
            category,
            ..Default::default()
        }
    }

    fn failed(error: ResolveError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn into_result(self) -> Result<Resolution, ResolveError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

pub struct Resolver {
    engine: Arc<MatchEngine>,
    cache: Arc<ResponseCache>,
    pool: Arc<ConnectionPool>,
    stats: Arc<Stats>,
    attempt_timeout: Duration,
}

impl Resolver {
    pub fn new(
        engine: Arc<MatchEngine>,
        cache: Arc<ResponseCache>,
        pool: Arc<ConnectionPool>,
        stats: Arc<Stats>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            engine,
            cache,
            pool,
            stats,
            attempt_timeout: config.attempt_timeout(),
        }
    }

    /// Resolve `domain` within `deadline`.
    pub async fn resolve(&self, domain: &str, qtype: QueryType, deadline: Duration) -> Resolution {
        let started = Instant::now();
        let deadline = started + deadline;
        self.stats.record(StatsEvent::Lookup);

        let domain = match normalize_name(domain) {
            Ok(domain) => domain,
            Err(e) => return Resolution::failed(e.into()),
        };

        let check = self.engine.check(&domain);
        self.stats
            .record(StatsEvent::Latency(Stage::Check, started.elapsed()));
        if check.blocked {
            if let Some(category) = check.category {
                self.stats.record(StatsEvent::Blocked(category));
            }
            return Resolution::blocked(check.category);
        }

        let lookup_started = Instant::now();
        let lookup = self
            .cache
            .get_or_resolve(&domain, qtype, deadline, || {
                self.query_upstream(&domain, qtype, deadline)
            })
            .await;

        match lookup {
            Ok(lookup) => {
                if lookup.cached {
                    self.stats
                        .record(StatsEvent::Latency(Stage::Cache, lookup_started.elapsed()));
                }
                Resolution {
                    response: dns::with_id(&lookup.payload, rand::random()),
                    cached: lookup.cached,
                    ..Default::default()
                }
            }
            Err(e) => {
                debug!(kind = ?e.kind(), "resolution failed");
                Resolution::failed(e)
            }
        }
    }

    /// Try each server in priority order until one answers.
    ///
    /// The returned payload has its transaction id zeroed.
    async fn query_upstream(
        &self,
        domain: &str,
        qtype: QueryType,
        deadline: Instant,
    ) -> Result<Vec<u8>, ResolveError> {
        let mut open = 0;
        let mut attempted = 0;

        for server in self.pool.servers() {
            let now = Instant::now();
            if now >= deadline {
                return Err(ResolveError::Timeout);
            }
            let attempt_deadline = deadline.min(now + self.attempt_timeout);

            let mut conn = match self.pool.acquire(server, attempt_deadline - now).await {
                Ok(conn) => conn,
                Err(PoolError::CircuitOpen(_)) => {
                    open += 1;
                    continue;
                }
                Err(e) => {
                    attempted += 1;
                    self.stats.record(StatsEvent::UpstreamError);
                    warn!(server, error = %e, "upstream connection failed");
                    continue;
                }
            };
            attempted += 1;

            let query = DnsQuery::new(rand::random(), domain, qtype);
            let started = Instant::now();
            let outcome = tokio::time::timeout_at(attempt_deadline, conn.exchange(&query.to_bytes())).await;

            match outcome {
                Ok(Ok(response)) if query.accepts(&response) => {
                    self.pool.release(conn, false);
                    self.stats
                        .record(StatsEvent::Latency(Stage::Upstream, started.elapsed()));
                    return Ok(dns::with_id(&response, 0).unwrap_or(response));
                }
                Ok(Ok(_)) => {
                    self.pool.release(conn, true);
                    warn!(server, "upstream response did not answer the query");
                }
                Ok(Err(e)) => {
                    self.pool.release(conn, true);
                    warn!(server, error = %e, "upstream exchange failed");
                }
                Err(_) => {
                    self.pool.release(conn, true);
                    warn!(server, "upstream attempt timed out");
                }
            }
            self.stats.record(StatsEvent::UpstreamError);
        }

        if attempted == 0 && open > 0 {
            Err(ResolveError::Failure(FailureReason::AllServersOpen))
        } else if Instant::now() >= deadline {
            Err(ResolveError::Timeout)
        } else {
            Err(ResolveError::Failure(FailureReason::Exhausted))
        }
    }
}

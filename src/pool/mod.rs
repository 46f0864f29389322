//! Upstream connection pool.
//!
//! Each configured server gets its own [`ServerPool`]: a semaphore bounding
//! open connections, a stack of idle transports and a circuit breaker.
//! Connections are opened lazily and returned through
//! [`ConnectionPool::release`]. A connection dropped without being released
//! (the caller was cancelled or timed out) is discarded, and if it was the
//! breaker's half-open trial the trial slot is freed.

pub mod breaker;
pub mod connector;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, PoolConfig, Protocol, ServerConfig};
use crate::error::PoolError;
use crate::stats::{Stats, StatsEvent};

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use connector::{
    Connect, Exchange, FramedExchange, HttpsConnector, TlsConnector, UpstreamConnector,
};

/// Weight of the newest sample in the latency average, in eighths.
const EWMA_NEW: u64 = 2;

/// Point-in-time view of one server.
#[derive(Debug, Clone)]
pub struct ServerHealth {
    pub name: String,
    pub protocol: Protocol,
    pub priority: i32,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_transition: Instant,
    /// Smoothed exchange latency, once at least one exchange succeeded.
    pub latency_estimate: Option<Duration>,
    pub idle: usize,
    pub in_use: usize,
}

struct IdleConnection {
    transport: Box<dyn Exchange>,
    last_used: Instant,
}

pub struct ServerPool {
    config: ServerConfig,
    max_connections: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    breaker: Mutex<CircuitBreaker>,
    latency_us: AtomicU64,
    stats: Arc<Stats>,
}

impl ServerPool {
    fn new(config: ServerConfig, pool: &PoolConfig, breaker: &BreakerConfig, stats: Arc<Stats>) -> Self {
        Self {
            config,
            max_connections: pool.max_connections,
            permits: Arc::new(Semaphore::new(pool.max_connections)),
            idle: Mutex::new(Vec::new()),
            breaker: Mutex::new(CircuitBreaker::new(breaker, Instant::now())),
            latency_us: AtomicU64::new(0),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Run `f` against the breaker, reporting any state change.
    fn with_breaker<R>(&self, f: impl FnOnce(&mut CircuitBreaker) -> R) -> Option<R> {
        let Ok(mut breaker) = self.breaker.lock() else {
            return None;
        };
        let before = breaker.state();
        let result = f(&mut breaker);
        let after = breaker.state();
        drop(breaker);

        if before != after {
            self.stats.record(StatsEvent::BreakerTransition(after));
            match after {
                BreakerState::Open => {
                    warn!(server = %self.config.name, from = before.as_str(), "circuit opened")
                }
                _ => info!(
                    server = %self.config.name,
                    from = before.as_str(),
                    to = after.as_str(),
                    "circuit state changed"
                ),
            }
        }
        Some(result)
    }

    fn record_latency(&self, elapsed: Duration) {
        let sample = (elapsed.as_micros() as u64).max(1);
        let _ = self
            .latency_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some(if old == 0 {
                    sample
                } else {
                    (old * (8 - EWMA_NEW) + sample * EWMA_NEW) / 8
                })
            });
    }

    pub fn health(&self) -> ServerHealth {
        let (state, consecutive_failures, last_transition) = self
            .breaker
            .lock()
            .map(|b| (b.state(), b.consecutive_failures(), b.last_transition()))
            .unwrap_or((BreakerState::Closed, 0, Instant::now()));
        let latency_us = self.latency_us.load(Ordering::Relaxed);

        ServerHealth {
            name: self.config.name.clone(),
            protocol: self.config.protocol,
            priority: self.config.priority,
            state,
            consecutive_failures,
            last_transition,
            latency_estimate: (latency_us > 0).then(|| Duration::from_micros(latency_us)),
            idle: self.idle.lock().map(|i| i.len()).unwrap_or(0),
            in_use: self.max_connections - self.permits.available_permits(),
        }
    }
}

/// A breaker admission that must end in a verdict or be abandoned.
struct Ticket {
    server: Arc<ServerPool>,
    admission: Admission,
    settled: bool,
}

impl Ticket {
    fn settle(&mut self, failed: bool) {
        self.settled = true;
        let now = Instant::now();
        let admission = self.admission;
        self.server.with_breaker(|b| {
            if failed {
                b.on_failure(admission, now)
            } else {
                b.on_success(admission, now)
            }
        });
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.server.with_breaker(|b| b.abandon());
        }
    }
}

/// A checked-out transport to one server.
pub struct PooledConnection {
    ticket: Ticket,
    transport: Box<dyn Exchange>,
    last_used: Instant,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn server(&self) -> &str {
        self.ticket.server.name()
    }

    pub fn protocol(&self) -> Protocol {
        self.ticket.server.config.protocol
    }

    /// Whether this connection carries the breaker's half-open trial.
    pub fn is_trial(&self) -> bool {
        self.ticket.admission == Admission::Trial
    }

    pub async fn exchange(&mut self, query: &[u8]) -> Result<Vec<u8>, PoolError> {
        let started = Instant::now();
        let response = self.transport.exchange(query).await?;
        self.last_used = Instant::now();
        self.ticket.server.record_latency(started.elapsed());
        Ok(response)
    }
}

pub struct ConnectionPool {
    servers: Vec<Arc<ServerPool>>,
    connector: Arc<dyn Connect>,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        servers: &[ServerConfig],
        pool: &PoolConfig,
        breaker: &BreakerConfig,
        connector: Arc<dyn Connect>,
        stats: Arc<Stats>,
    ) -> Self {
        let mut servers: Vec<Arc<ServerPool>> = servers
            .iter()
            .map(|s| Arc::new(ServerPool::new(s.clone(), pool, breaker, stats.clone())))
            .collect();
        // Stable: equal priorities keep configuration order.
        servers.sort_by_key(|s| std::cmp::Reverse(s.config.priority));

        Self {
            servers,
            connector,
            idle_timeout: pool.idle_timeout(),
            connect_timeout: pool.connect_timeout(),
        }
    }

    /// Server names, most preferred first.
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(|s| s.name())
    }

    /// Check out a connection to `server`, opening one if none is idle.
    ///
    /// Fails fast with [`PoolError::CircuitOpen`] when the breaker refuses
    /// admission. Waiting for a free slot and connecting are bounded by
    /// `timeout`.
    pub async fn acquire(&self, server: &str, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now() + timeout;
        let pool = self
            .servers
            .iter()
            .find(|s| s.name() == server)
            .ok_or_else(|| PoolError::UnknownServer(server.to_string()))?;

        let admission = pool
            .with_breaker(|b| b.admit(Instant::now()))
            .unwrap_or(Admission::Rejected);
        if admission == Admission::Rejected {
            return Err(PoolError::CircuitOpen(server.to_string()));
        }
        let mut ticket = Ticket {
            server: pool.clone(),
            admission,
            settled: false,
        };

        let permit = match tokio::time::timeout_at(deadline, pool.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(PoolError::Timeout(server.to_string())),
        };

        if let Some(idle) = self.take_idle(pool) {
            return Ok(PooledConnection {
                ticket,
                transport: idle.transport,
                last_used: idle.last_used,
                _permit: permit,
            });
        }

        let connect_deadline = deadline.min(Instant::now() + self.connect_timeout);
        let transport =
            match tokio::time::timeout_at(connect_deadline, self.connector.connect(&pool.config)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    ticket.settle(true);
                    return Err(e);
                }
                Err(_) => {
                    ticket.settle(true);
                    return Err(PoolError::Timeout(server.to_string()));
                }
            };
        debug!(server, protocol = pool.config.protocol.as_str(), "opened upstream connection");

        Ok(PooledConnection {
            ticket,
            transport,
            last_used: Instant::now(),
            _permit: permit,
        })
    }

    /// Return a connection. Failed connections are closed and counted
    /// against the server's breaker; healthy ones go back to the idle stack.
    pub fn release(&self, conn: PooledConnection, was_error: bool) {
        let PooledConnection {
            mut ticket,
            transport,
            last_used,
            _permit,
        } = conn;

        ticket.settle(was_error);
        if was_error {
            return;
        }

        if let Ok(mut idle) = ticket.server.idle.lock() {
            idle.push(IdleConnection {
                transport,
                last_used,
            });
        }
    }

    fn take_idle(&self, pool: &ServerPool) -> Option<IdleConnection> {
        let Ok(mut idle) = pool.idle.lock() else {
            return None;
        };
        let now = Instant::now();
        while let Some(conn) = idle.pop() {
            if now.duration_since(conn.last_used) < self.idle_timeout {
                return Some(conn);
            }
            debug!(server = %pool.config.name, "closed idle upstream connection");
        }
        None
    }

    pub fn health(&self) -> Vec<ServerHealth> {
        self.servers.iter().map(|s| s.health()).collect()
    }

    /// Whether every server currently refuses new requests.
    pub fn all_open(&self) -> bool {
        let now = Instant::now();
        self.servers.iter().all(|s| {
            s.breaker
                .lock()
                .map(|b| b.state() == BreakerState::Open && b.retry_at().is_some_and(|at| now < at))
                .unwrap_or(false)
        })
    }
}

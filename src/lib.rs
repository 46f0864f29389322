//! Hush - private domain blocklist matching with an anonymous encrypted DNS cache.
//!
//! A [`Service`] checks names against the merged blocklists in a lock-free
//! snapshot, and resolves allowed names through DNS over TLS or HTTPS
//! upstreams behind an anonymous, hashed-key response cache.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod pool;
pub mod resolver;
pub mod service;
pub mod source;
pub mod stats;

pub use config::Config;
pub use dns::QueryType;
pub use error::{ErrorKind, ResolveError};
pub use filter::{CheckResult, MatchEngine};
pub use resolver::Resolution;
pub use service::{Service, ServiceStats};

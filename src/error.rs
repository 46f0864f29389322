//! Error types.
//!
//! None of these carry the queried domain. Display strings name the failing
//! stage, the source or server involved, and nothing else.

use thiserror::Error;

/// Coarse error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    SourceFetch,
    ResolutionTimeout,
    ResolutionFailure,
    CapacityExceeded,
}

/// Malformed domain or query input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("domain is empty")]
    Empty,
    #[error("domain exceeds 253 characters")]
    TooLong,
    #[error("domain has an empty label")]
    EmptyLabel,
    #[error("domain label exceeds 63 characters")]
    LabelTooLong,
    #[error("domain contains an invalid character")]
    InvalidCharacter,
    #[error("unsupported query type")]
    QueryType,
}

/// Failure to fetch or decode one blocklist source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("origin answered with status {0}")]
    Status(u16),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("content is not valid UTF-8")]
    Decode,
}

/// Why no upstream could answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Every configured server has an open circuit.
    AllServersOpen,
    /// Every admitted server was tried and failed.
    Exhausted,
}

/// Errors surfaced by the resolution path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("invalid query: {0}")]
    Validation(#[from] ValidationError),
    #[error("resolution deadline exceeded")]
    Timeout,
    #[error("resolution failed: {0:?}")]
    Failure(FailureReason),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::Validation(_) => ErrorKind::Validation,
            ResolveError::Timeout => ErrorKind::ResolutionTimeout,
            ResolveError::Failure(_) => ErrorKind::ResolutionFailure,
        }
    }
}

/// Errors from acquiring or using a pooled upstream connection.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a connection to {0}")]
    Timeout(String),
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error("unknown server {0}")]
    UnknownServer(String),
    #[error("connect to {server} failed: {reason}")]
    Connect { server: String, reason: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("https exchange failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("upstream answered with http status {0}")]
    Status(u16),
    #[error("malformed upstream response")]
    Protocol,
}

/// Invalid core configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no upstream servers configured")]
    NoServers,
    #[error("duplicate server name {0}")]
    DuplicateServer(String),
    #[error("duplicate source name {0}")]
    DuplicateSource(String),
    #[error("source at position {0} has an empty name or origin")]
    IncompleteSource(usize),
    #[error("server {0} has an invalid address")]
    InvalidServer(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("bloom false positive rate must be within (0, 1)")]
    FalsePositiveRate,
    #[error("cache.min_ttl_secs exceeds cache.max_ttl_secs")]
    TtlRange,
}

/// Failure to assemble a [`crate::Service`].
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("upstream transport setup failed: {0}")]
    Pool(#[from] PoolError),
    #[error("source fetcher setup failed: {0}")]
    Source(#[from] SourceError),
}

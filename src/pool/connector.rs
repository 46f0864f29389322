//! Encrypted upstream transports.
//!
//! DNS over TLS (RFC 7858) frames each message with a 2-byte big-endian
//! length prefix over a TLS stream. DNS over HTTPS (RFC 8484) POSTs the raw
//! message as `application/dns-message`. There is no plaintext transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{Protocol, ServerConfig};
use crate::error::PoolError;

const DNS_MESSAGE: &str = "application/dns-message";

/// Opens transports to upstream servers.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> Result<Box<dyn Exchange>, PoolError>;
}

/// One open transport: send a query, receive its response.
#[async_trait]
pub trait Exchange: Send {
    async fn exchange(&mut self, query: &[u8]) -> Result<Vec<u8>, PoolError>;
}

/// Dispatches to the TLS or HTTPS connector by the server's protocol.
pub struct UpstreamConnector {
    tls: TlsConnector,
    https: HttpsConnector,
}

impl UpstreamConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self, PoolError> {
        Ok(Self {
            tls: TlsConnector::new()?,
            https: HttpsConnector::new(connect_timeout),
        })
    }
}

#[async_trait]
impl Connect for UpstreamConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Box<dyn Exchange>, PoolError> {
        match server.protocol {
            Protocol::Tls => self.tls.connect(server).await,
            Protocol::Https => self.https.connect(server).await,
        }
    }
}

pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Client configuration trusting the bundled web PKI roots.
    pub fn new() -> Result<Self, PoolError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| PoolError::Tls(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connect for TlsConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Box<dyn Exchange>, PoolError> {
        let name = ServerName::try_from(server.tls_name().to_string()).map_err(|_| {
            PoolError::Connect {
                server: server.name.clone(),
                reason: "invalid tls name".to_string(),
            }
        })?;

        let tcp = TcpStream::connect((server.address.as_str(), server.port())).await?;
        tcp.set_nodelay(true)?;
        let stream = self.inner.connect(name, tcp).await?;

        Ok(Box::new(FramedExchange::new(stream)))
    }
}

/// Length-prefixed DNS messages over any byte stream.
pub struct FramedExchange<S> {
    stream: S,
}

impl<S> FramedExchange<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Exchange for FramedExchange<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn exchange(&mut self, query: &[u8]) -> Result<Vec<u8>, PoolError> {
        let len = u16::try_from(query.len()).map_err(|_| PoolError::Protocol)?;
        let mut framed = Vec::with_capacity(2 + query.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(query);
        self.stream.write_all(&framed).await?;
        self.stream.flush().await?;

        let mut prefix = [0u8; 2];
        self.stream.read_exact(&mut prefix).await?;
        let msg_len = u16::from_be_bytes(prefix) as usize;
        if msg_len == 0 {
            return Err(PoolError::Protocol);
        }

        let mut response = vec![0u8; msg_len];
        self.stream.read_exact(&mut response).await?;

        Ok(response)
    }
}

pub struct HttpsConnector {
    connect_timeout: Duration,
}

impl HttpsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connect for HttpsConnector {
    async fn connect(&self, server: &ServerConfig) -> Result<Box<dyn Exchange>, PoolError> {
        let host = server.tls_name();
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(1);

        // Connect to a configured IP while validating against the TLS name.
        if let Ok(ip) = server.address.parse::<IpAddr>() {
            builder = builder.resolve(host, SocketAddr::new(ip, server.port()));
        }

        let client = builder.build()?;
        let url = format!("https://{}:{}{}", host, server.port(), server.path);

        Ok(Box::new(HttpsExchange { client, url }))
    }
}

/// A reqwest client bound to one DoH endpoint. Its internal connection is
/// reused across exchanges until the pool discards it.
struct HttpsExchange {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Exchange for HttpsExchange {
    async fn exchange(&mut self, query: &[u8]) -> Result<Vec<u8>, PoolError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE)
            .body(query.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PoolError::Status(status.as_u16()));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

//! Range feed download
//!
//! One GET over hyper's HTTP/1 connection API, TLS through rustls with the
//! webpki root store. No pooling: the feed is fetched at most once a day.

use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Request, Uri};
use rustls::ClientConfig;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Feed download errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Feed returned HTTP {0}")]
    Status(u16),

    #[error("Body read error: {0}")]
    Body(String),

    #[error("Feed download timed out")]
    Timeout,

    #[error("Feed contained no usable ranges")]
    EmptyFeed,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Anything that can produce the raw feed text
pub trait FeedSource: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Feed client configuration
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("echwk/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// hyper + tokio-rustls feed client
#[derive(Debug, Clone, Default)]
pub struct HttpsFeed {
    config: FeedClientConfig,
}

impl HttpsFeed {
    pub fn new(config: FeedClientConfig) -> Self {
        Self { config }
    }

    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| FetchError::InvalidUrl(e.to_string()))?;

        let host = uri
            .host()
            .ok_or_else(|| FetchError::InvalidUrl(format!("no host in {}", url)))?
            .to_string();
        let is_https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(FetchError::InvalidUrl(format!(
                    "unsupported scheme {:?}",
                    other
                )));
            }
        };
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });
        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let request = Request::get(target)
            .header(HOST, host.as_str())
            .header(USER_AGENT, &self.config.user_agent)
            .body(Empty::<Bytes>::new())
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        let body = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| FetchError::Tls(format!("invalid server name {}", host)))?;

            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| FetchError::Tls(e.to_string()))?;

            self.send(tls_stream, request).await?
        } else {
            self.send(stream, request).await?
        };

        debug!("GET {} -> {} bytes", url, body.len());
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn send<S>(&self, stream: S, request: Request<Empty<Bytes>>) -> Result<Bytes, FetchError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("Feed connection error: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?;

        Ok(collected.to_bytes())
    }
}

impl FeedSource for HttpsFeed {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send {
        self.get(url)
    }
}

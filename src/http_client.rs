use anyhow::{Context, Result, ensure};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::error;

use crate::tls::verified_client_config;

const USER_AGENT: &str = concat!("starttls-audit/", env!("CARGO_PKG_VERSION"));

/// A fetched HTTPS resource. The body is truncated to the client's
/// configured maximum.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// HTTPS fetching as the MTA-STS check needs it: GET only, no
/// redirects, bounded body. Injected so tests can serve policies
/// without a network.
pub trait PolicyFetch: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<HttpResponse>>;
}

pub struct HttpsClient {
    roots: Arc<RootCertStore>,
    timeout: Duration,
    max_body: usize,
}

impl HttpsClient {
    pub fn new(roots: Arc<RootCertStore>, io_timeout: Duration, max_body: usize) -> Self {
        Self {
            roots,
            timeout: io_timeout,
            max_body,
        }
    }

    /// Performs a GET request. Redirects are never followed: this is a
    /// connection-level client without redirect handling, as required
    /// for MTA-STS policy fetches.
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        // Create and parse URI
        let uri = url.parse::<Uri>().context("Failed to parse URI")?;
        ensure!(
            uri.scheme_str() == Some("https"),
            "Only HTTPS is supported"
        );

        // Get the host and the port
        let host = uri.host().context("URI has no host")?.to_string();
        let port = uri.port_u16().unwrap_or(443);

        // Open a TCP connection to the remote host
        let address = format!("{host}:{port}");
        let stream = timeout(self.timeout, TcpStream::connect(address))
            .await
            .context("TCP connect timed out")?
            .context("Failed to connect TCP stream")?;

        // Wrap the stream in TLS, verified against the trust roots
        let server_name =
            ServerName::try_from(host.clone()).context("Host is not a valid server name")?;
        let connector = TlsConnector::from(verified_client_config(self.roots.clone()));
        let stream = timeout(self.timeout, connector.connect(server_name, stream))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;

        // Create the Hyper client
        let io = TokioIo::new(stream);
        let (mut sender, conn) = timeout(self.timeout, http1::handshake(io))
            .await
            .context("HTTP handshake timed out")?
            .context("Failed to create HTTP handshake")?;

        // Spawn a task to drive the HTTP state
        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                error!("Connection failed: {err:?}");
            }
        });

        // Create and send HTTP request
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let req = Request::builder()
            .uri(path)
            .header(hyper::header::HOST, host)
            .header(hyper::header::USER_AGENT, USER_AGENT)
            .body(Empty::<Bytes>::new())
            .context("Failed to create HTTP request")?;
        let mut res = timeout(self.timeout, sender.send_request(req))
            .await
            .context("HTTP request timed out")?
            .context("Failed to send HTTP request")?;

        let status = res.status().as_u16();
        let content_type = res
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // Get response body piece by piece, up to the configured cap
        let mut body = Vec::new();
        loop {
            let next = timeout(self.timeout, res.frame())
                .await
                .context("Timeout while reading HTTP response")?;
            let Some(next) = next else {
                break;
            };
            let frame = next.context("Failed to receive next HTTP response chunk")?;
            if let Some(chunk) = frame.data_ref() {
                body.extend_from_slice(chunk);
            }
            if body.len() >= self.max_body {
                body.truncate(self.max_body);
                break;
            }
        }

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

impl PolicyFetch for HttpsClient {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(self.get(url))
    }
}

//! HTTP forwarder for the agent's local target.
//!
//! Forwards a decoded request to the locally reachable service over
//! hyper's http1 client, reusing pooled connections where possible, and
//! returns the fully buffered response.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Idle connections kept per target.
const MAX_POOL_SIZE: usize = 8;

/// Errors forwarding to the local target.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to connect to local target {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("local HTTP exchange failed: {0}")]
    Exchange(#[from] hyper::Error),

    #[error("forwarded request is unusable: {0}")]
    BadRequest(String),
}

/// Pooled http1 client for one local target.
pub struct HttpProxy {
    /// Local target as host:port.
    target: String,
    pool: Mutex<Vec<http1::SendRequest<Full<Bytes>>>>,
}

impl HttpProxy {
    pub fn new(target: String) -> Self {
        Self {
            target,
            pool: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Execute one request against the local target and buffer the full
    /// response.
    pub async fn forward(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, ProxyError> {
        let (mut parts, body) = request.into_parts();

        // The local service should see itself as the host
        let host = http::HeaderValue::from_str(&self.target)
            .map_err(|_| ProxyError::BadRequest(format!("invalid target host {}", self.target)))?;
        parts.headers.insert(http::header::HOST, host);

        let request = http::Request::from_parts(parts, Full::new(body));

        let mut sender = self.connection().await?;
        let response = sender.send_request(request).await?;

        let (parts, body) = response.into_parts();
        let bytes = body.collect().await?.to_bytes();

        self.park(sender).await;

        Ok(http::Response::from_parts(parts, bytes))
    }

    async fn connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    debug!(target = %self.target, "reusing pooled connection");
                    return Ok(sender);
                }
            }
        }

        debug!(target = %self.target, "opening connection to local target");
        let stream = TcpStream::connect(&self.target)
            .await
            .map_err(|source| ProxyError::Connect {
                address: self.target.clone(),
                source,
            })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

        // Drives the connection until it closes
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "local connection ended");
            }
        });

        Ok(sender)
    }

    async fn park(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            return;
        }
        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }
}

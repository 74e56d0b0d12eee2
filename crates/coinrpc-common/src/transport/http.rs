//! HTTP transport
//!
//! Performs one `POST` exchange per call to [`Transport::exchange`] using a
//! shared hyper client. The client's connection pool is the only pooling the
//! transport does.
//!
//! # Status mapping
//!
//! | status | error |
//! |--------|-------|
//! | 200    | body returned |
//! | 401    | `Unauthorized` |
//! | 404    | `Not found` |
//! | 500    | `Internal server error` (retried by the dispatcher) |
//! | other  | `"<reason>" is not OK.` |

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, trace};

use super::{Endpoint, Transport};
use crate::protocol::error::{CoinrpcError, HttpStatusError, Result};

/// Default timeout for a single exchange (30 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP transport bound to one endpoint.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: Endpoint,
    authorization: Option<String>,
    client: Client<HttpConnector, Full<Bytes>>,
    default_timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        let authorization = endpoint.auth().map(|auth| auth.header_value());
        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            endpoint,
            authorization,
            client,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the timeout used when [`Transport::exchange`] is given none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn build_request(&self, payload: Bytes) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(self.endpoint.uri().clone())
            .header(CONTENT_TYPE, "application/json");

        if let Some(authorization) = &self.authorization {
            builder = builder.header(AUTHORIZATION, authorization.as_str());
        }

        builder
            .body(Full::new(payload))
            .map_err(|e| CoinrpcError::Transport(format!("Failed to build request: {}", e)))
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Bytes> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| CoinrpcError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            debug!(endpoint = %self.endpoint, status = status.as_u16(), "non-OK response");
            return Err(status_error(status).into());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| CoinrpcError::Transport(format!("Failed to read response: {}", e)))?;

        let body = body.to_bytes();
        trace!(bytes = body.len(), "response received");
        Ok(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(&self, payload: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let request = self.build_request(payload)?;

        tokio::time::timeout(timeout, self.send(request))
            .await
            .map_err(|_| CoinrpcError::Timeout(timeout.as_millis() as u64))?
    }
}

fn status_error(status: StatusCode) -> HttpStatusError {
    HttpStatusError::from_status(
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown status"),
    )
}

//! coinrpc Transport Layer
//!
//! The transport performs exactly one request/response exchange per call:
//! it takes an already-serialized payload, posts it to the endpoint and hands
//! back the raw response body. It knows nothing about batches or
//! identifiers.
//!
//! # Components
//!
//! - **[`Transport`]**: the exchange boundary the client is generic over
//! - **[`HttpTransport`]**: hyper-based implementation with basic auth
//! - **[`Endpoint`]**: parsed endpoint URL with credentials split off

use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::error::Result;

pub mod endpoint;
pub mod http;

pub use endpoint::Endpoint;
pub use http::HttpTransport;
pub use hyper::body::Bytes;

/// One request/response exchange with the RPC server.
///
/// Implementations fail with:
/// - `Transport` when the connection cannot be established or the body cannot be read
/// - `Timeout` when the exchange exceeds `timeout` (or the implementation default)
/// - `HttpStatus` when the server answers with a non-200 status
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn exchange(&self, payload: Bytes, timeout: Option<Duration>) -> Result<Bytes>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn exchange(&self, payload: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        (**self).exchange(payload, timeout).await
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use coinrpc_common::protocol::error::{CoinrpcError, Result};
use coinrpc_common::protocol::jsonrpc::{RpcRequest, RpcResponse};
use coinrpc_common::transport::{Bytes, Endpoint, HttpTransport, Transport};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::scheduler::{self, PendingCall};
use crate::stats::{SchedulerStats, StatsSnapshot};

/// Method used for the direct health check
pub const PING_METHOD: &str = "getblockchaininfo";

/// Default timeout for [`RpcClient::ping`]
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Batching JSON-RPC client.
///
/// Calls submitted through any clone of the client share one FIFO queue and
/// are coalesced into batches by a background scheduling task, with at most
/// `concurrency` batches on the wire at once.
///
/// The scheduling task keeps running until the last clone is dropped and
/// every call already submitted has completed.
pub struct RpcClient<T: Transport = HttpTransport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    submissions: mpsc::UnboundedSender<PendingCall>,
    transport: Arc<T>,
    stats: Arc<SchedulerStats>,
    config: ClientConfig,
}

impl<T: Transport> Clone for RpcClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RpcClient<HttpTransport> {
    /// Create a client for `endpoint` with the default configuration.
    ///
    /// The endpoint has the form `http://[user[:pass]@]host[:port][/path]`.
    /// No connection is made until the first call.
    pub async fn new(endpoint: &str) -> Result<Self> {
        Self::with_config(endpoint, ClientConfig::default()).await
    }

    pub async fn with_config(endpoint: &str, config: ClientConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(endpoint)?;
        debug!(endpoint = %endpoint, "creating rpc client");
        let transport = HttpTransport::new(endpoint).with_default_timeout(config.request_timeout);
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> RpcClient<T> {
    /// Create a client over an arbitrary transport.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, since the scheduling task
    /// is spawned here.
    pub fn with_transport(transport: T, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(transport);
        let stats = Arc::new(SchedulerStats::new());
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            config.retry.clone(),
            config.request_timeout,
            stats.clone(),
        ));
        let submissions = scheduler::spawn(&config, dispatcher, stats.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                submissions,
                transport,
                stats,
                config,
            }),
        })
    }

    /// Queue a call and return a future for its result.
    ///
    /// The call is queued before this returns, so calls submitted back to
    /// back keep their submission order even if their futures are awaited
    /// in a different order. Dropping the future does not cancel the call;
    /// its result is discarded.
    pub fn submit(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let (call, receiver) = PendingCall::new(method, params);
        let queued = self.inner.submissions.send(call).is_ok();
        if queued {
            self.inner.stats.record_submit();
        }

        async move {
            if !queued {
                return Err(CoinrpcError::SchedulerClosed);
            }
            receiver.await.map_err(|_| CoinrpcError::SchedulerClosed)?
        }
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.submit(method, params).await
    }

    /// Like [`RpcClient::call`], deserializing the result into `R`.
    pub async fn call_as<R: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<R> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Health check that bypasses the queue.
    ///
    /// Sends a single `getblockchaininfo` with id 0 straight to the transport
    /// with its own timeout (default [`PING_TIMEOUT`]). Not retried.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Value> {
        let request = [RpcRequest::new(PING_METHOD, Vec::new(), 0)];
        let payload = Bytes::from(serde_json::to_vec(&request)?);

        let body = self
            .inner
            .transport
            .exchange(payload, Some(timeout.unwrap_or(PING_TIMEOUT)))
            .await?;

        let responses: Vec<RpcResponse> = serde_json::from_slice(&body)
            .map_err(|e| CoinrpcError::Protocol(format!("invalid health check response: {}", e)))?;

        responses
            .into_iter()
            .find(|r| r.id == Some(0))
            .ok_or_else(|| CoinrpcError::Protocol("no response for request id 0".into()))?
            .into_result()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

//! In-process transport for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use coinrpc_common::protocol::error::{CoinrpcError, Result};
use coinrpc_common::protocol::jsonrpc::RpcRequest;
use coinrpc_common::transport::{Bytes, Transport};
use serde_json::{json, Value};

type Handler = Box<dyn Fn(usize, &[RpcRequest]) -> Result<Bytes> + Send + Sync>;

/// Transport that answers each exchange with a closure.
///
/// The closure receives the zero-based exchange number and the decoded
/// batch. Every batch is recorded, and overlapping exchanges are counted so
/// tests can check the concurrency limit.
pub struct ScriptedTransport {
    handler: Handler,
    delay: Option<Duration>,
    requests: Mutex<Vec<Vec<RpcRequest>>>,
    exchanges: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    /// Handler returns a JSON document that is serialized as the body.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(usize, &[RpcRequest]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::raw(move |n, requests| {
            let value = handler(n, requests)?;
            Ok(Bytes::from(serde_json::to_vec(&value)?))
        })
    }

    /// Handler returns the raw body.
    pub fn raw<F>(handler: F) -> Self
    where
        F: Fn(usize, &[RpcRequest]) -> Result<Bytes> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            requests: Mutex::new(Vec::new()),
            exchanges: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Answers every call with `{"method": ..., "params": ...}`.
    pub fn echo() -> Self {
        Self::new(|_, requests| {
            let reply: Vec<Value> = requests
                .iter()
                .map(|r| json!({"id": r.id, "result": {"method": r.method, "params": r.params}}))
                .collect();
            Ok(json!(reply))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<Vec<RpcRequest>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exchange(&self, payload: Bytes, _timeout: Option<Duration>) -> Result<Bytes> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = serde_json::from_slice::<Vec<RpcRequest>>(&payload)
            .map_err(|e| CoinrpcError::Protocol(format!("client sent invalid batch: {}", e)))
            .and_then(|batch| {
                let result = (self.handler)(n, &batch);
                self.requests.lock().unwrap().push(batch);
                result
            });

        self.current.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

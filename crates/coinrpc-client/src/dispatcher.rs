//! Batch dispatch and response correlation.
//!
//! The dispatcher turns an admitted batch into one wire exchange and routes
//! each element of the reply back to the call it answers.
//!
//! # Identifiers
//!
//! Right before serialization every call in the batch receives a fresh id
//! from a counter shared by the whole client. A batch reserves a contiguous
//! block, so ids are unique and strictly increasing in dispatch order. A
//! resend after a transient error reserves a new block.
//!
//! # Failure handling
//!
//! - transient overload (HTTP 500): resend with backoff, at most
//!   `max_retries` times, then fail every call with `RetriesExhausted`
//! - any other transport failure, or a body that is not a JSON array:
//!   fail every call with the same error
//! - per element: `error` fails that call, a missing `result` fails that call
//!   with `MissingResult`, anything else resolves it
//! - calls the reply never mentions fail with a protocol error

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coinrpc_common::protocol::error::{CoinrpcError, Result};
use coinrpc_common::protocol::jsonrpc::{RpcRequest, RpcResponse};
use coinrpc_common::transport::{Bytes, Transport};
use serde_json::Value;
use tracing::{debug, warn};

use crate::retry::RetryConfig;
use crate::scheduler::PendingCall;
use crate::stats::SchedulerStats;

/// Longest body excerpt quoted in a malformed-response error
const MAX_EXCERPT: usize = 200;

pub struct Dispatcher<T> {
    transport: Arc<T>,
    next_id: AtomicU64,
    retry: RetryConfig,
    timeout: Duration,
    stats: Arc<SchedulerStats>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        retry: RetryConfig,
        timeout: Duration,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(0),
            retry,
            timeout,
            stats,
        }
    }

    /// Sends the batch and completes every call in it exactly once.
    pub async fn dispatch(&self, mut batch: Vec<PendingCall>) {
        let mut retries = 0;

        loop {
            let (ids, payload) = match self.encode(&mut batch) {
                Ok(encoded) => encoded,
                Err(e) => return self.fail_all(batch, e),
            };

            debug!(batch_size = batch.len(), first_id = ?ids.first(), "sending batch");

            match self.transport.exchange(payload, Some(self.timeout)).await {
                Ok(body) => return self.correlate(ids, batch, &body),
                Err(e) if e.is_retryable() => {
                    if retries >= self.retry.max_retries {
                        let e = if self.retry.max_retries == 0 {
                            e
                        } else {
                            CoinrpcError::RetriesExhausted {
                                attempts: retries + 1,
                                last: Box::new(e),
                            }
                        };
                        warn!(batch_size = batch.len(), error = %e, "giving up on batch");
                        return self.fail_all(batch, e);
                    }

                    retries += 1;
                    let backoff = self.retry.backoff(retries);
                    warn!(
                        batch_size = batch.len(),
                        attempt = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient server error, resending batch"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return self.fail_all(batch, e),
            }
        }
    }

    /// Assigns fresh ids and serializes the batch.
    fn encode(&self, batch: &mut [PendingCall]) -> Result<(Vec<u64>, Bytes)> {
        let first = self.next_id.fetch_add(batch.len() as u64, Ordering::Relaxed);

        let mut ids = Vec::with_capacity(batch.len());
        let mut requests = Vec::with_capacity(batch.len());
        for (id, call) in (first..).zip(batch.iter_mut()) {
            call.id = Some(id);
            ids.push(id);
            requests.push(RpcRequest::new(call.method.clone(), call.params.clone(), id));
        }

        let payload = serde_json::to_vec(&requests)?;
        Ok((ids, Bytes::from(payload)))
    }

    /// Routes each response element to its call.
    fn correlate(&self, ids: Vec<u64>, batch: Vec<PendingCall>, body: &[u8]) {
        let elements = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Array(elements)) => elements,
            Ok(other) => {
                let e = CoinrpcError::Protocol(excerpt(&other.to_string()));
                return self.fail_all(batch, e);
            }
            Err(e) => {
                let e = CoinrpcError::Protocol(format!("invalid JSON: {}", e));
                return self.fail_all(batch, e);
            }
        };

        let mut pending: HashMap<u64, PendingCall> = ids.into_iter().zip(batch).collect();

        for element in elements {
            let response: RpcResponse = match serde_json::from_value(element) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "ignoring malformed response element");
                    continue;
                }
            };

            let call = response.id.and_then(|id| pending.remove(&id));
            match call {
                Some(call) => self.complete(call, response.into_result()),
                None => warn!(id = ?response.id, "ignoring response for unknown request id"),
            }
        }

        for (id, call) in pending {
            let e = CoinrpcError::Protocol(format!("no response for request id {}", id));
            self.complete(call, Err(e));
        }
    }

    fn fail_all(&self, batch: Vec<PendingCall>, error: CoinrpcError) {
        for call in batch {
            self.complete(call, Err(error.clone()));
        }
    }

    fn complete(&self, call: PendingCall, result: Result<Value>) {
        self.stats.record_outcome(result.is_ok());
        let id = call.id;
        if !call.complete(result) {
            debug!(id = ?id, "caller stopped waiting, result discarded");
        }
    }
}

fn excerpt(body: &str) -> String {
    match body.char_indices().nth(MAX_EXCERPT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use coinrpc_common::protocol::error::HttpStatusError;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn dispatcher(transport: Arc<ScriptedTransport>, retry: RetryConfig) -> Dispatcher<ScriptedTransport> {
        Dispatcher::new(
            transport,
            retry,
            Duration::from_secs(5),
            Arc::new(SchedulerStats::new()),
        )
    }

    fn fast_retry(max_retries: usize) -> RetryConfig {
        RetryConfig::new(max_retries, 1, 5, 2.0).unwrap()
    }

    fn calls(methods: &[&str]) -> (Vec<PendingCall>, Vec<oneshot::Receiver<Result<Value>>>) {
        methods
            .iter()
            .enumerate()
            .map(|(i, m)| PendingCall::new(*m, vec![json!(i)]))
            .unzip()
    }

    async fn outcomes(receivers: Vec<oneshot::Receiver<Result<Value>>>) -> Vec<Result<Value>> {
        let mut out = Vec::new();
        for rx in receivers {
            out.push(rx.await.expect("call was never completed"));
        }
        out
    }

    #[tokio::test]
    async fn test_results_routed_by_id() {
        // Reply in reverse order to prove routing is by id
        let transport = Arc::new(ScriptedTransport::new(|_, requests| {
            let reply: Vec<Value> = requests
                .iter()
                .rev()
                .map(|r| json!({"id": r.id, "result": format!("{}:{}", r.method, r.params[0])}))
                .collect();
            Ok(json!(reply))
        }));
        let d = dispatcher(transport.clone(), RetryConfig::default());

        let (batch, rx) = calls(&["a", "b", "c"]);
        d.dispatch(batch).await;

        let results: Vec<Value> = outcomes(rx).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results, vec![json!("a:0"), json!("b:1"), json!("c:2")]);
        assert_eq!(transport.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_ids_strictly_increasing_across_batches() {
        let transport = Arc::new(ScriptedTransport::echo());
        let d = dispatcher(transport.clone(), RetryConfig::default());

        for size in [2, 1, 3] {
            let methods = vec!["x"; size];
            let (batch, rx) = calls(&methods);
            d.dispatch(batch).await;
            outcomes(rx).await;
        }

        let ids: Vec<u64> = transport.requests().into_iter().flatten().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_missing_result_isolated_to_one_call() {
        let transport = Arc::new(ScriptedTransport::new(|_, requests| {
            Ok(json!([
                {"id": requests[0].id},
                {"id": requests[1].id, "result": "ok"},
            ]))
        }));
        let d = dispatcher(transport, RetryConfig::default());

        let (batch, rx) = calls(&["a", "b"]);
        d.dispatch(batch).await;

        let results = outcomes(rx).await;
        assert_eq!(results[0].clone().unwrap_err(), CoinrpcError::MissingResult);
        assert_eq!(results[1].clone().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_remote_error_carries_code() {
        let transport = Arc::new(ScriptedTransport::new(|_, requests| {
            Ok(json!([
                {"id": requests[0].id, "result": null, "error": {"code": -8, "message": "Block height out of range"}},
                {"id": requests[1].id, "result": null, "error": null},
            ]))
        }));
        let d = dispatcher(transport, RetryConfig::default());

        let (batch, rx) = calls(&["getblockhash", "setban"]);
        d.dispatch(batch).await;

        let results = outcomes(rx).await;
        let err = results[0].clone().unwrap_err();
        assert_eq!(err.remote_code(), Some(-8));
        assert_eq!(err.to_string(), "Block height out of range");
        // present-but-null result is a success
        assert_eq!(results[1].clone().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_remote_error_with_null_message_keeps_code() {
        let transport = Arc::new(ScriptedTransport::new(|_, requests| {
            Ok(json!([
                {"id": requests[0].id, "result": null, "error": {"code": -5, "message": null}},
            ]))
        }));
        let d = dispatcher(transport, RetryConfig::default());

        let (batch, rx) = calls(&["getrawtransaction"]);
        d.dispatch(batch).await;

        let err = outcomes(rx).await.remove(0).unwrap_err();
        assert_eq!(err.remote_code(), Some(-5));
        assert_eq!(err.to_string(), "-5");
    }

    #[tokio::test]
    async fn test_non_array_body_fails_whole_batch() {
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Ok(json!({"result": null, "error": {"code": -32700, "message": "Parse error"}}))
        }));
        let d = dispatcher(transport, RetryConfig::default());

        let (batch, rx) = calls(&["a", "b"]);
        d.dispatch(batch).await;

        for result in outcomes(rx).await {
            let err = result.unwrap_err();
            assert!(matches!(err, CoinrpcError::Protocol(_)));
            assert!(err.to_string().contains("Parse error"));
        }
    }

    #[tokio::test]
    async fn test_invalid_json_body_fails_whole_batch() {
        let transport = Arc::new(ScriptedTransport::raw(|_, _| Ok(Bytes::from_static(b"this is not json"))));
        let d = dispatcher(transport, RetryConfig::default());

        let (batch, rx) = calls(&["a", "b"]);
        d.dispatch(batch).await;

        for result in outcomes(rx).await {
            assert!(matches!(result.unwrap_err(), CoinrpcError::Protocol(_)));
        }
    }

    #[tokio::test]
    async fn test_unanswered_calls_fail_and_unknown_ids_ignored() {
        let transport = Arc::new(ScriptedTransport::new(|_, requests| {
            Ok(json!([
                {"id": 9999, "result": "stray"},
                "not an object",
                {"id": requests[1].id, "result": "b"},
                {"id": requests[1].id, "result": "duplicate"},
            ]))
        }));
        let d = dispatcher(transport, RetryConfig::default());

        let (batch, rx) = calls(&["a", "b"]);
        d.dispatch(batch).await;

        let results = outcomes(rx).await;
        let err = results[0].clone().unwrap_err();
        assert!(matches!(err, CoinrpcError::Protocol(_)));
        assert!(err.to_string().contains("no response for request id"));
        assert_eq!(results[1].clone().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_internal_server_error_resends_with_fresh_ids() {
        let transport = Arc::new(ScriptedTransport::new(|attempt, requests| {
            if attempt == 0 {
                return Err(HttpStatusError::InternalServerError.into());
            }
            let reply: Vec<Value> = requests
                .iter()
                .map(|r| json!({"id": r.id, "result": r.params[0]}))
                .collect();
            Ok(json!(reply))
        }));
        let d = dispatcher(transport.clone(), fast_retry(3));

        let (batch, rx) = calls(&["a", "b"]);
        d.dispatch(batch).await;

        let results: Vec<Value> = outcomes(rx).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results, vec![json!(0), json!(1)]);

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        // same methods and params, new ids
        let strip = |batch: &Vec<RpcRequest>| -> Vec<(String, Vec<Value>)> {
            batch.iter().map(|r| (r.method.clone(), r.params.clone())).collect()
        };
        assert_eq!(strip(&sent[0]), strip(&sent[1]));
        assert_eq!(sent[0].iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(sent[1].iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Err(HttpStatusError::InternalServerError.into())
        }));
        let d = dispatcher(transport.clone(), fast_retry(2));

        let (batch, rx) = calls(&["a", "b"]);
        d.dispatch(batch).await;

        for result in outcomes(rx).await {
            match result.unwrap_err() {
                CoinrpcError::RetriesExhausted { attempts, last } => {
                    assert_eq!(attempts, 3);
                    assert_eq!(*last, CoinrpcError::HttpStatus(HttpStatusError::InternalServerError));
                }
                other => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(transport.exchange_count(), 3);
        assert_eq!(d.stats.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_no_retry_configured_returns_raw_error() {
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Err(HttpStatusError::InternalServerError.into())
        }));
        let d = dispatcher(transport.clone(), RetryConfig::none());

        let (batch, rx) = calls(&["a"]);
        d.dispatch(batch).await;

        let err = outcomes(rx).await.remove(0).unwrap_err();
        assert_eq!(err, CoinrpcError::HttpStatus(HttpStatusError::InternalServerError));
        assert_eq!(transport.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_other_transport_errors_not_retried() {
        for error in [
            CoinrpcError::HttpStatus(HttpStatusError::Unauthorized),
            CoinrpcError::HttpStatus(HttpStatusError::NotFound),
            CoinrpcError::Transport("connection refused".into()),
            CoinrpcError::Timeout(1000),
        ] {
            let expected = error.clone();
            let transport = Arc::new(ScriptedTransport::new(move |_, _| Err(error.clone())));
            let d = dispatcher(transport.clone(), fast_retry(3));

            let (batch, rx) = calls(&["a", "b", "c"]);
            d.dispatch(batch).await;

            for result in outcomes(rx).await {
                assert_eq!(result.unwrap_err(), expected);
            }
            assert_eq!(transport.exchange_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_block_siblings() {
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Err(CoinrpcError::Transport("connection reset".into()))
        }));
        let d = dispatcher(transport, RetryConfig::default());

        let (batch, mut rx) = calls(&["a", "b", "c"]);
        drop(rx.remove(1));
        d.dispatch(batch).await;

        for result in outcomes(rx).await {
            assert!(result.is_err());
        }
        assert_eq!(d.stats.snapshot().failed, 3);
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(500);
        let short = excerpt(&long);
        assert!(short.ends_with("..."));
        assert_eq!(short.len(), MAX_EXCERPT + 3);
        assert_eq!(excerpt("short"), "short");
    }
}

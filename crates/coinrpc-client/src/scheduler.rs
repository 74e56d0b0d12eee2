//! Call queue and batch admission.
//!
//! Every call submitted through the client lands in one FIFO queue owned by a
//! dedicated scheduling task. The task admits batches from the front of the
//! queue whenever a concurrency slot is free and hands them to the
//! [`Dispatcher`], which runs each batch in its own spawned task.
//!
//! # Admission
//!
//! Admission (the "pulse") runs after every wake-up of the scheduling task,
//! which happens when new calls arrive or when a dispatch finishes:
//!
//! 1. nothing happens while `in_flight == concurrency` or the queue is empty
//! 2. the batch length follows the isolation rule (see [`batch_len`])
//! 3. that many calls are drained from the front of the queue and dispatched
//!
//! Re-admission after a completion is just the next iteration of the task's
//! event loop, so long sessions never grow the stack.
//!
//! # Isolation rule
//!
//! Some methods (by default `getblock`) are expensive enough for the server
//! that they are always sent alone: an isolated call at the head of the queue
//! forms a batch of one, and a scan that reaches an isolated call further back
//! stops right before it.

use std::collections::VecDeque;
use std::sync::Arc;

use coinrpc_common::protocol::error::Result;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::stats::SchedulerStats;
use coinrpc_common::transport::Transport;

/// A submitted call waiting for its result.
///
/// The sending half of the completion channel lives here; the caller holds
/// the receiving half. Consuming `self` in [`PendingCall::complete`] makes a
/// second completion impossible.
#[derive(Debug)]
pub struct PendingCall {
    pub method: String,
    pub params: Vec<Value>,
    /// Assigned by the dispatcher right before serialization
    pub id: Option<u64>,
    completion: oneshot::Sender<Result<Value>>,
}

impl PendingCall {
    pub fn new(
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> (Self, oneshot::Receiver<Result<Value>>) {
        let (completion, receiver) = oneshot::channel();
        let call = Self {
            method: method.into(),
            params,
            id: None,
            completion,
        };
        (call, receiver)
    }

    /// Delivers the outcome to the caller.
    ///
    /// Returns `false` if the caller stopped waiting.
    pub fn complete(self, result: Result<Value>) -> bool {
        self.completion.send(result).is_ok()
    }
}

/// Number of calls the next batch takes from the front of the queue.
///
/// Scans at most `max` methods. An isolated method at the front yields a
/// batch of one; an isolated method further back ends the batch right before
/// it. Returns 0 only for an empty queue.
pub fn batch_len<'a, I, F>(methods: I, max: usize, is_isolated: F) -> usize
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&str) -> bool,
{
    let mut len = 0;
    for method in methods.into_iter().take(max) {
        if is_isolated(method) {
            if len == 0 {
                return 1;
            }
            break;
        }
        len += 1;
    }
    len
}

/// Queue and in-flight bookkeeping.
///
/// Only the scheduling task touches this, so it needs no locking.
pub struct SchedulerState {
    queue: VecDeque<PendingCall>,
    in_flight: usize,
    concurrency: usize,
    batch_size: usize,
    isolated_methods: Vec<String>,
}

impl SchedulerState {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: 0,
            concurrency: config.concurrency,
            batch_size: config.batch_size,
            isolated_methods: config.isolated_methods.clone(),
        }
    }

    pub fn enqueue(&mut self, call: PendingCall) {
        self.queue.push_back(call);
    }

    /// One admission step.
    ///
    /// Takes the next batch off the queue and counts it as in flight, or
    /// returns `None` when no slot is free or nothing is queued.
    pub fn next_batch(&mut self) -> Option<Vec<PendingCall>> {
        if self.in_flight >= self.concurrency || self.queue.is_empty() {
            return None;
        }

        let len = batch_len(
            self.queue.iter().map(|call| call.method.as_str()),
            self.batch_size,
            |method| self.isolated_methods.iter().any(|m| m == method),
        );

        self.in_flight += 1;
        Some(self.queue.drain(..len).collect())
    }

    /// Releases the slot held by a finished batch.
    pub fn finish_batch(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight == 0
    }
}

/// Starts the scheduling task and returns the submission channel.
///
/// The task runs until every sender is dropped and all queued and in-flight
/// calls have completed.
pub(crate) fn spawn<T: Transport>(
    config: &ClientConfig,
    dispatcher: Arc<Dispatcher<T>>,
    stats: Arc<SchedulerStats>,
) -> mpsc::UnboundedSender<PendingCall> {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = SchedulerState::new(config);
    tokio::spawn(run(state, rx, dispatcher, stats));
    tx
}

async fn run<T: Transport>(
    mut state: SchedulerState,
    mut submissions: mpsc::UnboundedReceiver<PendingCall>,
    dispatcher: Arc<Dispatcher<T>>,
    stats: Arc<SchedulerStats>,
) {
    let mut dispatches = JoinSet::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            call = submissions.recv(), if accepting => match call {
                Some(call) => {
                    state.enqueue(call);
                    // Take everything already waiting so it can share batches.
                    while let Ok(call) = submissions.try_recv() {
                        state.enqueue(call);
                    }
                }
                None => {
                    debug!(queued = state.queue_len(), "all client handles dropped, draining");
                    accepting = false;
                }
            },
            Some(joined) = dispatches.join_next(), if !dispatches.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "dispatch task ended abnormally");
                }
                state.finish_batch();
                stats.record_batch_end();
            }
            else => break,
        }

        while let Some(batch) = state.next_batch() {
            debug!(
                batch_size = batch.len(),
                in_flight = state.in_flight(),
                queued = state.queue_len(),
                "admitting batch"
            );
            stats.record_batch_start();
            let dispatcher = dispatcher.clone();
            dispatches.spawn(async move { dispatcher.dispatch(batch).await });
        }

        if !accepting && state.is_idle() {
            break;
        }
    }

    debug!("scheduler stopped");
}

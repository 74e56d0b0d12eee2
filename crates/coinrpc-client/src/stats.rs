// Copyright 2025 coinrpc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters describing scheduler activity.
///
/// Shared between the client handles, the scheduling task and the dispatch
/// tasks. All updates are single atomic operations so the hot path never
/// takes a lock.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    batches_dispatched: AtomicU64,
    retries: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Calls accepted by `submit`
    pub submitted: u64,
    /// Calls resolved with a result
    pub succeeded: u64,
    /// Calls rejected with an error
    pub failed: u64,
    /// Batches handed to the dispatcher
    pub batches_dispatched: u64,
    /// Batch resends after a transient overload error
    pub retries: u64,
    /// Batches currently being dispatched
    pub in_flight: u64,
    /// Highest `in_flight` value observed
    pub peak_in_flight: u64,
}

impl StatsSnapshot {
    /// Calls that have not reached a terminal state yet.
    pub fn pending(&self) -> u64 {
        self.submitted.saturating_sub(self.succeeded + self.failed)
    }
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_start(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn record_batch_end(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.peak_in_flight.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_are_zero() {
        assert_eq!(SchedulerStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_peak_in_flight_tracks_maximum() {
        let stats = SchedulerStats::new();
        stats.record_batch_start();
        stats.record_batch_start();
        stats.record_batch_end();
        stats.record_batch_start();
        stats.record_batch_end();
        stats.record_batch_end();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_dispatched, 3);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.peak_in_flight, 2);
    }

    #[test]
    fn test_pending_calls() {
        let stats = SchedulerStats::new();
        for _ in 0..5 {
            stats.record_submit();
        }
        stats.record_outcome(true);
        stats.record_outcome(false);
        stats.record_retry();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pending(), 3);
        assert_eq!(snapshot.retries, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(StatsSnapshot::default()).unwrap();
        assert_eq!(json["peak_in_flight"], 0);
    }
}

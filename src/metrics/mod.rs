//! Scheduler batch metrics.
//!
//! Tracks what the batch tick has been doing so an operator can spot a
//! stuck or failing orchestrator from the status endpoint:
//! - ticks run vs. ticks skipped by the reentrancy guard
//! - dispatches and their outcomes
//! - batch wall-clock duration

use crate::worker::WorkerOutcome;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Maximum batch durations kept for the rolling average.
const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub batches_started: u64,
    pub batches_completed: u64,
    pub ticks_skipped: u64,
    pub dispatched: u64,
    pub deferred: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub last_batch_ms: Option<u64>,
    pub avg_batch_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct BatchStats {
    batches_started: u64,
    batches_completed: u64,
    ticks_skipped: u64,
    dispatched: u64,
    deferred: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    durations: VecDeque<Duration>,
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&mut self, dispatched: usize, deferred: usize) {
        self.batches_started += 1;
        self.dispatched += dispatched as u64;
        self.deferred += deferred as u64;
    }

    pub fn record_skip(&mut self) {
        self.ticks_skipped += 1;
    }

    pub fn record_outcome(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Success => self.successes += 1,
            WorkerOutcome::Failure => self.failures += 1,
            WorkerOutcome::Timeout => self.timeouts += 1,
        }
    }

    pub fn record_complete(&mut self, duration: Duration) {
        self.batches_completed += 1;
        if self.durations.len() >= MAX_HISTORY {
            self.durations.pop_front();
        }
        self.durations.push_back(duration);
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let avg_batch_ms = if self.durations.is_empty() {
            None
        } else {
            let total: Duration = self.durations.iter().sum();
            Some((total / self.durations.len() as u32).as_millis() as u64)
        };
        BatchSnapshot {
            batches_started: self.batches_started,
            batches_completed: self.batches_completed,
            ticks_skipped: self.ticks_skipped,
            dispatched: self.dispatched,
            deferred: self.deferred,
            successes: self.successes,
            failures: self.failures,
            timeouts: self.timeouts,
            last_batch_ms: self.durations.back().map(|d| d.as_millis() as u64),
            avg_batch_ms,
        }
    }
}

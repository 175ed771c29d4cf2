// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-operation timing and counters.
//!
//! One monitor is built at boot and injected into every repository at
//! construction; repository methods record their elapsed time through
//! it. Cheap enough to sit on every data-access call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Accumulated stats for one named operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub total_us: u64,
    pub max_us: u64,
}

impl OperationStats {
    pub fn mean_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_us / self.count
        }
    }
}

/// Snapshot of every operation, plus the slowest ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub operations: HashMap<String, OperationStats>,
    /// Operation names ordered by max observed latency, worst first.
    pub slowest: Vec<String>,
}

/// Shared performance monitor.
#[derive(Debug, Clone, Default)]
pub struct PerfMonitor {
    inner: Arc<Mutex<HashMap<String, OperationStats>>>,
}

impl PerfMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed operation.
    pub fn record(&self, operation: &str, elapsed: Duration, ok: bool) {
        let micros = elapsed.as_micros() as u64;
        let mut inner = self.inner.lock();
        let stats = inner.entry(operation.to_owned()).or_default();
        stats.count += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.total_us += micros;
        stats.max_us = stats.max_us.max(micros);
    }

    /// Time a closure and record it under `operation`.
    pub fn time<T>(&self, operation: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(operation, start.elapsed(), true);
        out
    }

    /// Time a fallible closure, recording the error flag.
    pub fn time_result<T, E>(
        &self,
        operation: &str,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let start = Instant::now();
        let out = f();
        self.record(operation, start.elapsed(), out.is_ok());
        out
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let inner = self.inner.lock();
        let mut slowest: Vec<(String, u64)> =
            inner.iter().map(|(name, s)| (name.clone(), s.max_us)).collect();
        slowest.sort_by(|a, b| b.1.cmp(&a.1));
        MonitorSnapshot {
            operations: inner.clone(),
            slowest: slowest.into_iter().take(10).map(|(name, _)| name).collect(),
        }
    }

    pub fn stats(&self, operation: &str) -> Option<OperationStats> {
        self.inner.lock().get(operation).cloned()
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;

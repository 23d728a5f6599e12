//! Typed messages flowing from workers to the aggregation task.
//!
//! The variants carry only serializable data (counters plus base64-encoded
//! histogram payloads), so the same messages work unchanged whether the
//! transport is an in-process channel or a pipe between OS processes.

use serde::{Deserialize, Serialize};

use crate::metrics::IntervalCounters;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent roughly once per second; feeds the human progress line.
    Progress {
        worker_id: usize,
        requests_completed: u64,
        errors: u64,
        window_histogram: String,
        window_count: u64,
        ts: u64,
    },
    /// Sent at each CSV interval boundary, and once more at exit if the
    /// final partial interval carries data.
    CsvInterval {
        worker_id: usize,
        window_start_unix: u64,
        duration_s: f64,
        interval_histogram: String,
        latency_sum_us: u64,
        counters: IntervalCounters,
    },
    /// Sent exactly once when a worker exits.
    Final {
        worker_id: usize,
        requests_completed: u64,
        errors: u64,
        overall_histogram: String,
        latency_sum_us: u64,
        total_time_s: f64,
    },
}

impl WorkerMessage {
    pub fn worker_id(&self) -> usize {
        match self {
            WorkerMessage::Progress { worker_id, .. }
            | WorkerMessage::CsvInterval { worker_id, .. }
            | WorkerMessage::Final { worker_id, .. } => *worker_id,
        }
    }
}

/// Wall-clock seconds since the Unix epoch, for message and CSV timestamps.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

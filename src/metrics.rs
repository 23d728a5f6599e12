//! Latency recording and aggregation.
//!
//! Each worker owns a [`WorkerStats`] holding three HDR histograms over
//! integer microseconds: `overall` (lifetime), `window` (one-second progress
//! display) and `interval` (CSV emission). Every successful sample lands in
//! all three. Histograms are never shared between workers; they travel to the
//! aggregation task as compressed, base64-encoded snapshots produced by the
//! rotation methods.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hdrhistogram::serialization::{Deserializer, Serializer as _, V2Serializer};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest trackable latency in microseconds.
pub const LOWEST_LATENCY_US: u64 = 10;
/// Highest trackable latency in microseconds (60 seconds).
pub const HIGHEST_LATENCY_US: u64 = 60_000_000;
/// Histogram precision in significant decimal digits.
pub const SIGNIFICANT_DIGITS: u8 = 3;

/// Construct a latency histogram with the harness-wide bounds.
pub fn new_histogram() -> Histogram<u64> {
    // The bounds are compile-time constants; construction cannot fail.
    Histogram::new_with_bounds(LOWEST_LATENCY_US, HIGHEST_LATENCY_US, SIGNIFICANT_DIGITS)
        .unwrap_or_else(|e| panic!("latency histogram bounds rejected: {e:?}"))
}

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Generic,
    Moved,
    ClusterDown,
    Disconnect,
}

/// Classify an error by case-insensitive substring match against its text.
pub fn classify_error(text: &str) -> ErrorKind {
    let upper = text.to_uppercase();
    if upper.contains("MOVED") {
        ErrorKind::Moved
    } else if upper.contains("CLUSTERDOWN") {
        ErrorKind::ClusterDown
    } else {
        ErrorKind::Generic
    }
}

/// Counters reset at every CSV emission boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalCounters {
    pub requests: u64,
    pub errors: u64,
    pub moved: u64,
    pub clusterdown: u64,
    pub disconnects: u64,
}

impl IntervalCounters {
    pub fn merge(&mut self, other: &IntervalCounters) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.moved += other.moved;
        self.clusterdown += other.clusterdown;
        self.disconnects += other.disconnects;
    }
}

/// Snapshot returned by [`WorkerStats::rotate_window`].
pub struct WindowSnapshot {
    pub encoded: String,
    pub count: u64,
}

/// Snapshot returned by [`WorkerStats::rotate_interval`].
pub struct IntervalSnapshot {
    pub encoded: String,
    pub counters: IntervalCounters,
    pub latency_sum_us: u64,
}

/// Per-worker recorder. Written only by the owning worker.
pub struct WorkerStats {
    pub worker_id: usize,
    overall: Histogram<u64>,
    window: Histogram<u64>,
    interval: Histogram<u64>,
    interval_counters: IntervalCounters,
    interval_latency_sum_us: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub latency_sum_us: u64,
}

impl WorkerStats {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            overall: new_histogram(),
            window: new_histogram(),
            interval: new_histogram(),
            interval_counters: IntervalCounters::default(),
            interval_latency_sum_us: 0,
            total_requests: 0,
            total_errors: 0,
            latency_sum_us: 0,
        }
    }

    fn record_latency(&mut self, latency_us: u64) -> u64 {
        // Clamp into the trackable range so sums and buckets agree.
        let v = latency_us.clamp(LOWEST_LATENCY_US, HIGHEST_LATENCY_US);
        self.overall.saturating_record(v);
        self.window.saturating_record(v);
        self.interval.saturating_record(v);
        v
    }

    /// Record a successful request.
    pub fn record_ok(&mut self, latency_us: u64) {
        let v = self.record_latency(latency_us);
        self.interval_counters.requests += 1;
        self.interval_latency_sum_us += v;
        self.total_requests += 1;
        self.latency_sum_us += v;
    }

    /// Record a failed request. A latency sample is inserted only when the
    /// client library produced one.
    pub fn record_err(&mut self, kind: ErrorKind, latency_us: Option<u64>) {
        if let Some(latency) = latency_us {
            let v = self.record_latency(latency);
            self.interval_latency_sum_us += v;
            self.latency_sum_us += v;
        }
        self.interval_counters.errors += 1;
        self.total_errors += 1;
        match kind {
            ErrorKind::Moved => self.interval_counters.moved += 1,
            ErrorKind::ClusterDown => self.interval_counters.clusterdown += 1,
            ErrorKind::Disconnect => self.interval_counters.disconnects += 1,
            ErrorKind::Generic => {}
        }
    }

    /// Reset the window histogram and return the previous contents.
    pub fn rotate_window(&mut self) -> WindowSnapshot {
        let snapshot = WindowSnapshot {
            encoded: encode_histogram(&self.window),
            count: self.window.len(),
        };
        self.window.reset();
        snapshot
    }

    /// Reset the interval histogram and counters and return their contents.
    pub fn rotate_interval(&mut self) -> IntervalSnapshot {
        let snapshot = IntervalSnapshot {
            encoded: encode_histogram(&self.interval),
            counters: self.interval_counters,
            latency_sum_us: self.interval_latency_sum_us,
        };
        self.interval.reset();
        self.interval_counters = IntervalCounters::default();
        self.interval_latency_sum_us = 0;
        snapshot
    }

    /// True when the current interval carries any data worth emitting.
    pub fn interval_has_data(&self) -> bool {
        self.interval.len() > 0
            || self.interval_counters.errors > 0
            || self.interval_counters.disconnects > 0
    }

    /// Encode the lifetime histogram for the final message.
    pub fn encode_overall(&self) -> String {
        encode_histogram(&self.overall)
    }
}

/// Failure to decode a received histogram payload. Counted, never fatal.
#[derive(Debug, Error)]
pub enum HistogramCodecError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not a valid V2 histogram: {0}")]
    Deserialize(String),
    #[error("decoded histogram could not be merged: {0:?}")]
    Merge(hdrhistogram::errors::AdditionError),
}

/// Serialize a histogram as a base64-encoded V2 payload.
pub fn encode_histogram(histogram: &Histogram<u64>) -> String {
    let mut buf = Vec::new();
    match V2Serializer::new().serialize(histogram, &mut buf) {
        Ok(_) => BASE64.encode(&buf),
        Err(e) => {
            // An unencodable histogram loses one snapshot, not the run.
            tracing::error!("histogram serialization failed: {e:?}");
            String::new()
        }
    }
}

/// Decode a base64-encoded V2 payload back into a histogram.
pub fn decode_histogram(encoded: &str) -> Result<Histogram<u64>, HistogramCodecError> {
    let bytes = BASE64.decode(encoded)?;
    Deserializer::new()
        .deserialize(&mut &bytes[..])
        .map_err(|e| HistogramCodecError::Deserialize(format!("{e:?}")))
}

/// Decode `encoded` and add its samples into `target`.
pub fn merge_encoded(
    target: &mut Histogram<u64>,
    encoded: &str,
) -> Result<(), HistogramCodecError> {
    let decoded = decode_histogram(encoded)?;
    target.add(&decoded).map_err(HistogramCodecError::Merge)
}

/// Percentile extraction over bucket boundaries, without interpolation.
///
/// The sample index is `floor(p/100 * count)`, clamped to `count - 1`.
pub fn percentile_us(histogram: &Histogram<u64>, percentile: f64) -> u64 {
    let total = histogram.len();
    if total == 0 {
        return 0;
    }
    let mut target = ((percentile / 100.0) * total as f64).floor() as u64;
    if target >= total {
        target = total - 1;
    }
    let mut seen = 0u64;
    for value in histogram.iter_recorded() {
        seen += value.count_at_value();
        if seen > target {
            return value.value_iterated_to();
        }
    }
    histogram.max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_case_insensitive_substring() {
        assert_eq!(classify_error("MOVED 1234 10.0.0.1:6379"), ErrorKind::Moved);
        assert_eq!(classify_error("error: moved slot"), ErrorKind::Moved);
        assert_eq!(
            classify_error("ClusterDown The cluster is down"),
            ErrorKind::ClusterDown
        );
        assert_eq!(classify_error("connection refused"), ErrorKind::Generic);
    }

    #[test]
    fn record_ok_feeds_all_three_histograms_once() {
        let mut stats = WorkerStats::new(0);
        stats.record_ok(250);
        stats.record_ok(500);

        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.latency_sum_us, 750);
        assert_eq!(stats.interval_counters.requests, 2);

        let window = stats.rotate_window();
        assert_eq!(window.count, 2);
        let interval = stats.rotate_interval();
        assert_eq!(decode_histogram(&interval.encoded).unwrap().len(), 2);
        // Lifetime histogram is untouched by rotations.
        assert_eq!(decode_histogram(&stats.encode_overall()).unwrap().len(), 2);
    }

    #[test]
    fn rotations_reset_their_state() {
        let mut stats = WorkerStats::new(0);
        stats.record_ok(100);
        stats.record_err(ErrorKind::Moved, Some(300));
        stats.rotate_interval();

        assert_eq!(stats.interval_counters, IntervalCounters::default());
        let empty = stats.rotate_interval();
        assert_eq!(empty.counters.requests, 0);
        assert_eq!(decode_histogram(&empty.encoded).unwrap().len(), 0);
    }

    #[test]
    fn errors_update_classifier_counters_and_total() {
        let mut stats = WorkerStats::new(0);
        stats.record_err(ErrorKind::Moved, Some(100));
        stats.record_err(ErrorKind::ClusterDown, None);
        stats.record_err(ErrorKind::Generic, None);
        stats.record_err(ErrorKind::Disconnect, None);

        assert_eq!(stats.total_errors, 4);
        assert_eq!(stats.interval_counters.errors, 4);
        assert_eq!(stats.interval_counters.moved, 1);
        assert_eq!(stats.interval_counters.clusterdown, 1);
        assert_eq!(stats.interval_counters.disconnects, 1);
        // Only the error that carried a latency contributed a sample.
        let interval = stats.rotate_interval();
        assert_eq!(decode_histogram(&interval.encoded).unwrap().len(), 1);
    }

    #[test]
    fn samples_below_floor_are_clamped() {
        let mut stats = WorkerStats::new(0);
        stats.record_ok(1);
        let snapshot = decode_histogram(&stats.rotate_window().encoded).unwrap();
        assert!(snapshot.min() >= LOWEST_LATENCY_US);
    }

    #[test]
    fn encode_decode_preserves_every_bucket_count() {
        let mut histogram = new_histogram();
        for v in [10, 57, 99, 1_000, 12_345, 1_000_000, 59_000_000] {
            for _ in 0..7 {
                histogram.saturating_record(v);
            }
        }
        let decoded = decode_histogram(&encode_histogram(&histogram)).unwrap();
        assert_eq!(decoded.len(), histogram.len());
        for value in histogram.iter_recorded() {
            assert_eq!(
                decoded.count_at(value.value_iterated_to()),
                value.count_at_value(),
                "bucket at {} diverged",
                value.value_iterated_to()
            );
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_histogram("not base64 at all!").is_err());
        assert!(decode_histogram(&BASE64.encode(b"valid base64, bogus payload")).is_err());
    }

    #[test]
    fn merged_percentiles_match_direct_recording() {
        // Recording all samples into one histogram must agree with merging
        // two encoded halves, within bucket resolution.
        let mut left = new_histogram();
        let mut right = new_histogram();
        let mut direct = new_histogram();
        for i in 0..10_000u64 {
            let v = 10 + i * 3;
            direct.saturating_record(v);
            if i % 2 == 0 {
                left.saturating_record(v);
            } else {
                right.saturating_record(v);
            }
        }
        let mut merged = new_histogram();
        merge_encoded(&mut merged, &encode_histogram(&left)).unwrap();
        merge_encoded(&mut merged, &encode_histogram(&right)).unwrap();

        assert_eq!(merged.len(), direct.len());
        for p in [50.0, 90.0, 99.0, 99.9, 100.0] {
            assert_eq!(percentile_us(&merged, p), percentile_us(&direct, p));
        }
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut histogram = new_histogram();
        for i in 0..5_000u64 {
            histogram.saturating_record(10 + (i * i) % 800_000);
        }
        let points = [50.0, 90.0, 95.0, 99.0, 99.9, 99.99, 99.999, 100.0];
        let values: Vec<u64> = points
            .iter()
            .map(|p| percentile_us(&histogram, *p))
            .collect();
        for pair in values.windows(2) {
            assert!(pair[0] <= pair[1], "percentiles not monotonic: {values:?}");
        }
    }

    #[test]
    fn percentile_of_empty_histogram_is_zero() {
        assert_eq!(percentile_us(&new_histogram(), 99.0), 0);
    }

    #[test]
    fn percentile_uses_floor_index() {
        let mut histogram = new_histogram();
        // Four samples: index floor(0.5 * 4) = 2 -> third-smallest value.
        for v in [100u64, 200, 300, 400] {
            histogram.saturating_record(v);
        }
        let p50 = percentile_us(&histogram, 50.0);
        assert!(histogram.equivalent(p50, 300), "expected ~300, got {p50}");
        let p100 = percentile_us(&histogram, 100.0);
        assert!(histogram.equivalent(p100, 400), "expected ~400, got {p100}");
    }
}

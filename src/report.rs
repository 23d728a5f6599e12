//! Output formatting: parser-stable CSV rows and the human-facing
//! progress line and final report.
//!
//! CSV rows are pure data transformations; the print helpers are the only
//! place in the crate that writes to stdout. In CSV mode nothing else may
//! reach stdout, so the banner and progress line are callers' responsibility
//! to suppress.

use std::io::Write as _;

use hdrhistogram::Histogram;

use crate::config::{Bound, RunConfig};
use crate::metrics::{percentile_us, IntervalCounters};

/// CSV header, printed exactly once per run.
pub const CSV_HEADER: &str = "timestamp,request_sec,p50_usec,p90_usec,p95_usec,p99_usec,\
p99_9_usec,p99_99_usec,p99_999_usec,p100_usec,avg_usec,request_finished,\
requests_total_failed,requests_moved,requests_clusterdown,client_disconnects";

/// One emitted interval. All latency fields are truncated integer
/// microseconds; `request_sec` counts successful requests only.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    pub timestamp: u64,
    pub request_sec: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p99_9: u64,
    pub p99_99: u64,
    pub p99_999: u64,
    pub p100: u64,
    pub avg: u64,
    pub request_finished: u64,
    pub failed: u64,
    pub moved: u64,
    pub clusterdown: u64,
    pub disconnects: u64,
}

impl CsvRow {
    pub fn from_interval(
        timestamp: u64,
        duration_s: f64,
        histogram: &Histogram<u64>,
        latency_sum_us: u64,
        counters: &IntervalCounters,
    ) -> Self {
        let samples = histogram.len();
        let request_sec = if duration_s > 0.0 {
            counters.requests as f64 / duration_s
        } else {
            0.0
        };
        Self {
            timestamp,
            request_sec,
            p50: percentile_us(histogram, 50.0),
            p90: percentile_us(histogram, 90.0),
            p95: percentile_us(histogram, 95.0),
            p99: percentile_us(histogram, 99.0),
            p99_9: percentile_us(histogram, 99.9),
            p99_99: percentile_us(histogram, 99.99),
            p99_999: percentile_us(histogram, 99.999),
            p100: percentile_us(histogram, 100.0),
            avg: if samples > 0 { latency_sum_us / samples } else { 0 },
            request_finished: counters.requests,
            failed: counters.errors,
            moved: counters.moved,
            clusterdown: counters.clusterdown,
            disconnects: counters.disconnects,
        }
    }

    /// Render the 16 comma-separated fields, no padding, no exponent form.
    pub fn render(&self) -> String {
        format!(
            "{},{:.6},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.timestamp,
            self.request_sec,
            self.p50,
            self.p90,
            self.p95,
            self.p99,
            self.p99_9,
            self.p99_99,
            self.p99_999,
            self.p100,
            self.avg,
            self.request_finished,
            self.failed,
            self.moved,
            self.clusterdown,
            self.disconnects,
        )
    }
}

pub fn print_csv_header() {
    println!("{CSV_HEADER}");
    flush_stdout();
}

pub fn print_csv_row(row: &CsvRow) {
    println!("{}", row.render());
    flush_stdout();
}

/// Configuration banner printed in human mode before the run starts.
pub fn print_banner(config: &RunConfig) {
    println!("kvbench");
    println!("Host: {}", config.host);
    println!("Port: {}", config.port);
    println!("Threads: {}", config.workers);
    match config.bound {
        Bound::Requests(n) => println!("Total Requests: {n}"),
        Bound::Duration(d) => println!("Test Duration: {}s", d.as_secs()),
    }
    println!("Data Size: {}", config.value_size);
    println!("Command: {:?}", config.operation);
    println!("Is Cluster: {}", config.cluster);
    println!("Read from Replica: {}", config.read_from_replica);
    println!("Use TLS: {}", config.tls);
    println!("Processes: {}", config.process_count());
    println!();
}

/// One second of merged progress for the human line.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub elapsed_s: f64,
    pub completed: u64,
    pub total: Option<u64>,
    pub current_rps: f64,
    pub overall_rps: f64,
    pub errors: u64,
    pub window_count: u64,
    pub window_p50_us: u64,
    pub window_p99_us: u64,
}

pub fn print_progress(snapshot: &ProgressSnapshot) {
    let mut line = format!(
        "\r\x1b[K[{:.1}s] Progress: {} requests",
        snapshot.elapsed_s, snapshot.completed
    );
    if let Some(total) = snapshot.total {
        let pct = if total > 0 {
            snapshot.completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        line = format!(
            "\r\x1b[K[{:.1}s] Progress: {}/{} ({:.1}%)",
            snapshot.elapsed_s, snapshot.completed, total, pct
        );
    }
    line.push_str(&format!(
        ", Current RPS: {:.2}, Overall RPS: {:.2}, Errors: {}",
        snapshot.current_rps, snapshot.overall_rps, snapshot.errors
    ));
    if snapshot.window_count > 0 {
        line.push_str(&format!(
            " | Latency (ms): p50={:.2} p99={:.2}",
            snapshot.window_p50_us as f64 / 1000.0,
            snapshot.window_p99_us as f64 / 1000.0
        ));
    }
    print!("{line}");
    flush_stdout();
}

/// Final run totals for the human report.
pub struct FinalSummary {
    pub total_time_s: f64,
    pub completed: u64,
    pub errors: u64,
    pub latency_sum_us: u64,
    pub histogram: Histogram<u64>,
}

impl FinalSummary {
    pub fn overall_rps(&self) -> f64 {
        if self.total_time_s > 0.0 {
            self.completed as f64 / self.total_time_s
        } else {
            0.0
        }
    }
}

/// Cumulative distribution boundaries for the final report, in milliseconds.
const DISTRIBUTION_MS: [f64; 12] = [
    0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0,
];

pub fn print_final(summary: &FinalSummary) {
    println!("\n\nFinal Results:");
    println!("=============");
    println!("Total time: {:.2} seconds", summary.total_time_s);
    println!("Requests completed: {}", summary.completed);
    println!("Requests per second: {:.2}", summary.overall_rps());
    println!("Total errors: {}", summary.errors);

    let histogram = &summary.histogram;
    let samples = histogram.len();
    if samples == 0 {
        println!("\nNo latencies recorded.");
        return;
    }
    let avg_us = summary.latency_sum_us / samples;

    println!("\nLatency Statistics (ms):");
    println!("=====================");
    println!("Minimum: {:.3}", histogram.min() as f64 / 1000.0);
    println!("Average: {:.3}", avg_us as f64 / 1000.0);
    println!("Maximum: {:.3}", histogram.max() as f64 / 1000.0);
    println!("Median (p50): {:.3}", percentile_us(histogram, 50.0) as f64 / 1000.0);
    println!("95th percentile: {:.3}", percentile_us(histogram, 95.0) as f64 / 1000.0);
    println!("99th percentile: {:.3}", percentile_us(histogram, 99.0) as f64 / 1000.0);

    println!("\nLatency Distribution:");
    println!("====================");
    let mut already_counted = 0u64;
    for boundary_ms in DISTRIBUTION_MS {
        let boundary_us = (boundary_ms * 1000.0) as u64;
        let cumulative = histogram.count_between(0, boundary_us);
        let in_range = cumulative.saturating_sub(already_counted);
        let pct = in_range as f64 / samples as f64 * 100.0;
        println!("<= {boundary_ms:.1} ms: {pct:.2}% ({in_range} requests)");
        already_counted = cumulative;
    }
    let remaining = samples.saturating_sub(already_counted);
    if remaining > 0 {
        let pct = remaining as f64 / samples as f64 * 100.0;
        println!("> 1000.0 ms: {pct:.2}% ({remaining} requests)");
    }
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

//! kvbench — a load generator and measurement harness for Valkey/Redis-compatible
//! key-value datastores.
//!
//! The engine drives a very large volume of operations against a running
//! server while controlling the offered load precisely, bounding connection
//! growth, and recording the latency of every request with high fidelity.
//! Output is either a human progress line plus a final report, or
//! parser-stable per-interval CSV on stdout.
//!
//! # Architecture
//!
//! The components compose leaves-first:
//!
//! - [`keygen`]: deterministic and random key selection, value buffers.
//! - [`rate`]: the per-second rate controller with linear and exponential
//!   ramps. Workers call `await_slot()` before every operation.
//! - [`pool`]: a bounded client pool lending handles through a free-index
//!   queue, with optional gradual ramp-up.
//! - [`metrics`]: per-worker HDR histograms and counters, plus the encoded
//!   snapshot codec used to move them between tasks.
//! - [`worker`]: the hot loop — acquire, pace, time, record, release.
//! - [`orchestrator`]: spawns process groups and workers, aggregates their
//!   messages, and owns the run's authoritative output.
//!
//! The datastore client sits behind the [`client::KvClient`] trait; swapping
//! the backend (or injecting an in-memory one, as the tests do) touches
//! nothing in the engine.
//!
//! # Example
//!
//! ```rust,no_run
//! use kvbench::config::{Bound, RunConfig};
//! use kvbench::rate::RatePolicy;
//!
//! # async fn demo() -> Result<(), kvbench::orchestrator::RunError> {
//! let config = RunConfig::builder()
//!     .host("127.0.0.1")
//!     .workers(4)
//!     .bound(Bound::Requests(100_000))
//!     .rate(RatePolicy::Fixed(5_000))
//!     .build();
//! let summary = kvbench::orchestrator::run(config).await?;
//! println!("p99 = {}us", kvbench::metrics::percentile_us(&summary.histogram, 99.0));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod custom;
pub mod keygen;
pub mod messages;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod rate;
pub mod report;
pub mod worker;

pub use config::{Cli, RunConfig};
pub use orchestrator::{run, RunError, RunSummary};

//! Run lifecycle: spawn process groups and their workers, aggregate their
//! messages, and produce the run's authoritative output.
//!
//! `--processes P` partitions the run into `P` groups, each with its own
//! client pool and rate controller (QPS targets divided per group), exactly
//! as the OS-process rendition would. All workers send the same typed
//! messages to one aggregation task, which merges histograms by decoding the
//! encoded payloads — so the output is identical whether the workers live in
//! this process or not.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::client::{ClientError, ConnectFactory, RedisFactory};
use crate::config::{Bound, ConfigError, Operation, RunConfig};
use crate::custom;
use crate::messages::{unix_now, WorkerMessage};
use crate::metrics::{merge_encoded, new_histogram, percentile_us, IntervalCounters};
use crate::report::{self, CsvRow, FinalSummary, ProgressSnapshot};
use crate::worker::{partition_budget, run_worker, WorkerContext};
use crate::pool::ClientPool;
use crate::rate::RateController;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("connection failed: {0}")]
    Connect(#[from] ClientError),
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) | RunError::Connect(_) => 1,
            RunError::WorkerCrashed(_) => 2,
        }
    }
}

/// Authoritative totals for one run.
#[derive(Debug)]
pub struct RunSummary {
    /// Requests attempted across all workers (successes plus errors).
    pub completed: u64,
    pub errors: u64,
    pub total_time_s: f64,
    pub latency_sum_us: u64,
    pub histogram: Histogram<u64>,
    /// Histogram payloads that failed to decode during aggregation.
    pub decode_failures: u64,
    /// Final per-worker attempt counts, keyed by worker id.
    pub per_worker_completed: HashMap<usize, u64>,
    /// CSV rows emitted during the run (empty outside CSV mode).
    pub rows: Vec<CsvRow>,
}

/// Run against a real server derived from the configuration.
pub async fn run(config: RunConfig) -> Result<RunSummary, RunError> {
    let factory: Arc<dyn ConnectFactory> = Arc::new(RedisFactory {
        host: config.host.clone(),
        port: config.port,
        tls: config.tls,
        cluster: config.cluster,
        read_from_replica: config.read_from_replica,
        connection_timeout: config.connection_timeout,
        request_timeout: config.request_timeout,
    });
    run_with_factory(config, factory).await
}

/// Run with an injected client factory. This is the seam the tests (and any
/// alternative backend) drive the whole pipeline through.
pub async fn run_with_factory(
    config: RunConfig,
    factory: Arc<dyn ConnectFactory>,
) -> Result<RunSummary, RunError> {
    let config = Arc::new(config);
    let csv_mode = config.csv_mode();
    if csv_mode {
        report::print_csv_header();
    } else {
        report::print_banner(&config);
    }

    let custom_command = match config.operation {
        Operation::Custom => Some(custom::load(
            config.custom_command_file.as_deref(),
            config.custom_command_args.as_deref(),
        )
        .map_err(ConfigError::from)?),
        _ => None,
    };

    let groups = config.process_count();
    let workers_per_group = config.workers;
    let total_workers = groups * workers_per_group;
    let started = Instant::now();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let (tx, rx) = mpsc::channel::<WorkerMessage>(total_workers * 8 + 16);

    let group_budgets = match config.bound {
        Bound::Requests(n) => Some(partition_budget(n, groups)),
        Bound::Duration(_) => None,
    };
    let deadline = match config.bound {
        Bound::Duration(d) => Some(started + d),
        _ => None,
    };
    let group_rate = config.rate.divided(groups as u64);

    let mut workers = JoinSet::new();
    let mut pools = Vec::with_capacity(groups);
    for group in 0..groups {
        let pool = ClientPool::connect(factory.as_ref(), config.pool.initial()).await?;
        pool.spawn_ramp(config.pool, Arc::clone(&factory), shutdown_rx.clone());
        // Wake blocked acquires when the run is told to stop.
        {
            let pool = Arc::clone(&pool);
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                pool.close();
            });
        }
        let rate = Arc::new(RateController::new(group_rate.clone()));
        let worker_budgets = group_budgets
            .as_ref()
            .map(|budgets| partition_budget(budgets[group], workers_per_group));

        for local in 0..workers_per_group {
            let ctx = WorkerContext {
                worker_id: group * workers_per_group + local,
                config: Arc::clone(&config),
                pool: Arc::clone(&pool),
                rate: Arc::clone(&rate),
                custom: custom_command.clone(),
                budget: worker_budgets.as_ref().map(|budgets| budgets[local]),
                deadline,
                tx: tx.clone(),
                shutdown: shutdown_rx.clone(),
            };
            workers.spawn(run_worker(ctx));
        }
        pools.push(pool);
    }
    // The aggregator finishes when the last worker drops its sender.
    drop(tx);

    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping workers");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let aggregator = tokio::spawn(
        Aggregator::new(AggregateParams {
            csv_mode,
            csv_interval: config.csv_interval,
            total_workers,
            total_budget: group_budgets.as_ref().map(|b| b.iter().sum()),
            started,
            pools,
        })
        .run(rx),
    );

    let mut crash: Option<String> = None;
    while let Some(result) = workers.join_next().await {
        if let Err(join_error) = result {
            tracing::error!("worker crashed: {join_error}");
            if crash.is_none() {
                crash = Some(join_error.to_string());
                // Bring the remaining workers down before exiting.
                let _ = shutdown_tx.send(true);
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let aggregated = aggregator
        .await
        .map_err(|e| RunError::WorkerCrashed(format!("aggregation task failed: {e}")))?;
    let total_time_s = started.elapsed().as_secs_f64();

    if let Some(reason) = crash {
        return Err(RunError::WorkerCrashed(reason));
    }

    if !csv_mode {
        report::print_final(&FinalSummary {
            total_time_s,
            completed: aggregated.completed,
            errors: aggregated.errors,
            latency_sum_us: aggregated.latency_sum_us,
            histogram: aggregated.overall.clone(),
        });
    }
    if aggregated.decode_failures > 0 {
        tracing::error!(
            count = aggregated.decode_failures,
            "histogram payloads failed to decode during aggregation"
        );
    }

    Ok(RunSummary {
        completed: aggregated.completed,
        errors: aggregated.errors,
        total_time_s,
        latency_sum_us: aggregated.latency_sum_us,
        histogram: aggregated.overall,
        decode_failures: aggregated.decode_failures,
        per_worker_completed: aggregated.per_worker_final,
        rows: aggregated.rows,
    })
}

struct AggregateParams {
    csv_mode: bool,
    csv_interval: Option<Duration>,
    total_workers: usize,
    total_budget: Option<u64>,
    started: Instant,
    /// Per-group pools, read for their ramp-failure disconnect counts.
    pools: Vec<Arc<ClientPool>>,
}

struct Aggregated {
    completed: u64,
    errors: u64,
    latency_sum_us: u64,
    overall: Histogram<u64>,
    decode_failures: u64,
    per_worker_final: HashMap<usize, u64>,
    rows: Vec<CsvRow>,
}

/// One CSV interval being reconciled across workers. Emitted when every
/// worker has reported or when the interval has elapsed, whichever first.
struct PendingInterval {
    histogram: Histogram<u64>,
    counters: IntervalCounters,
    latency_sum_us: u64,
    reported: HashSet<usize>,
    duration_s: f64,
    opened: Instant,
}

impl PendingInterval {
    fn new() -> Self {
        Self {
            histogram: new_histogram(),
            counters: IntervalCounters::default(),
            latency_sum_us: 0,
            reported: HashSet::new(),
            duration_s: 0.0,
            opened: Instant::now(),
        }
    }

    fn has_data(&self) -> bool {
        self.histogram.len() > 0 || self.counters.errors > 0 || self.counters.disconnects > 0
    }

    fn into_row(self) -> CsvRow {
        CsvRow::from_interval(
            unix_now(),
            self.duration_s,
            &self.histogram,
            self.latency_sum_us,
            &self.counters,
        )
    }
}

/// The single consumer of worker messages. Owns every merged histogram.
struct Aggregator {
    params: AggregateParams,
    totals: Aggregated,
    /// Latest absolute (attempted, errors) per worker, for the progress line.
    latest: HashMap<usize, (u64, u64)>,
    window: Histogram<u64>,
    pending: Option<PendingInterval>,
    last_print: Instant,
    pool_disconnects_seen: u64,
}

impl Aggregator {
    fn new(params: AggregateParams) -> Self {
        let last_print = params.started;
        Self {
            params,
            totals: Aggregated {
                completed: 0,
                errors: 0,
                latency_sum_us: 0,
                overall: new_histogram(),
                decode_failures: 0,
                per_worker_final: HashMap::new(),
                rows: Vec::new(),
            },
            latest: HashMap::new(),
            window: new_histogram(),
            pending: None,
            last_print,
            pool_disconnects_seen: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>) -> Aggregated {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(message) = received else { break };
                    self.handle(message);
                }
                _ = tick.tick() => {
                    if self.params.csv_mode {
                        self.flush_elapsed_interval();
                    } else {
                        self.print_progress_line();
                    }
                }
            }
        }

        // Channel closed: every worker has flushed. Emit the trailing
        // partial interval if it carries any data.
        if self.pending.as_ref().is_some_and(PendingInterval::has_data) {
            self.emit_pending();
        }
        self.totals
    }

    fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress {
                worker_id,
                requests_completed,
                errors,
                window_histogram,
                window_count,
                ..
            } => {
                self.latest.insert(worker_id, (requests_completed, errors));
                if window_count > 0 {
                    if let Err(e) = merge_encoded(&mut self.window, &window_histogram) {
                        self.totals.decode_failures += 1;
                        tracing::error!("progress histogram decode failed: {e}");
                    }
                }
            }
            WorkerMessage::CsvInterval {
                worker_id,
                duration_s,
                interval_histogram,
                latency_sum_us,
                counters,
                ..
            } => {
                // A second report from the same worker means a new interval
                // has begun; close out the current one first.
                if self
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.reported.contains(&worker_id))
                {
                    self.emit_pending();
                }
                let interval = self.pending.get_or_insert_with(PendingInterval::new);
                interval.reported.insert(worker_id);
                interval.counters.merge(&counters);
                interval.latency_sum_us += latency_sum_us;
                interval.duration_s = interval.duration_s.max(duration_s);
                let decode = merge_encoded(&mut interval.histogram, &interval_histogram);
                let complete = interval.reported.len() >= self.params.total_workers;
                if let Err(e) = decode {
                    self.totals.decode_failures += 1;
                    tracing::error!("interval histogram decode failed: {e}");
                }
                if complete {
                    self.emit_pending();
                }
            }
            WorkerMessage::Final {
                worker_id,
                requests_completed,
                errors,
                overall_histogram,
                latency_sum_us,
                ..
            } => {
                self.latest.insert(worker_id, (requests_completed, errors));
                self.totals.completed += requests_completed;
                self.totals.errors += errors;
                self.totals.latency_sum_us += latency_sum_us;
                self.totals
                    .per_worker_final
                    .insert(worker_id, requests_completed);
                if let Err(e) = merge_encoded(&mut self.totals.overall, &overall_histogram) {
                    self.totals.decode_failures += 1;
                    tracing::error!("final histogram decode failed: {e}");
                }
            }
        }
    }

    /// Straggler flush: the interval elapsed without every worker reporting.
    fn flush_elapsed_interval(&mut self) {
        let elapsed = self
            .pending
            .as_ref()
            .zip(self.params.csv_interval)
            .is_some_and(|(p, i)| p.opened.elapsed() >= i);
        if elapsed {
            self.emit_pending();
        }
    }

    fn emit_pending(&mut self) {
        let Some(mut interval) = self.pending.take() else {
            return;
        };
        // Fold in connection drops observed by the pools since the last row.
        let pool_disconnects: u64 = self.params.pools.iter().map(|p| p.disconnects()).sum();
        interval.counters.disconnects +=
            pool_disconnects.saturating_sub(self.pool_disconnects_seen);
        self.pool_disconnects_seen = pool_disconnects;

        let row = interval.into_row();
        report::print_csv_row(&row);
        self.totals.rows.push(row);
    }

    fn print_progress_line(&mut self) {
        let now = Instant::now();
        let interval_s = now.duration_since(self.last_print).as_secs_f64();
        self.last_print = now;

        let completed: u64 = self.latest.values().map(|(attempted, _)| attempted).sum();
        let errors: u64 = self.latest.values().map(|(_, errs)| errs).sum();
        let elapsed_s = self.params.started.elapsed().as_secs_f64();
        let snapshot = ProgressSnapshot {
            elapsed_s,
            completed,
            total: self.params.total_budget,
            current_rps: if interval_s > 0.0 {
                self.window.len() as f64 / interval_s
            } else {
                0.0
            },
            overall_rps: if elapsed_s > 0.0 {
                completed as f64 / elapsed_s
            } else {
                0.0
            },
            errors,
            window_count: self.window.len(),
            window_p50_us: percentile_us(&self.window, 50.0),
            window_p99_us: percentile_us(&self.window, 99.0),
        };
        report::print_progress(&snapshot);
        self.window.reset();
    }
}

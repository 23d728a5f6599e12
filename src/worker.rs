//! The worker executor: the hot loop.
//!
//! Each worker acquires a pooled client, waits for a rate permit, times one
//! operation with the monotonic clock and records the outcome into its own
//! [`WorkerStats`]. Rotation snapshots leave the worker as messages; nothing
//! else is shared. A worker stops at the next loop checkpoint when its
//! request budget is spent, its deadline passes, or shutdown is signalled,
//! then flushes any partial interval and its final totals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::client::{ClientError, KvClient};
use crate::config::{Operation, RunConfig};
use crate::custom::CustomCommand;
use crate::keygen::{generate_value, KeyGen};
use crate::messages::{unix_now, WorkerMessage};
use crate::metrics::{classify_error, WorkerStats};
use crate::pool::ClientPool;
use crate::rate::RateController;

/// Base seed for the value filler; offset per worker for distinct buffers.
const VALUE_SEED: u32 = 1234;

/// Split `total` requests over `parts` workers: `floor(total/parts)` each,
/// with the first `total mod parts` workers taking one extra.
pub fn partition_budget(total: u64, parts: usize) -> Vec<u64> {
    let parts = parts.max(1);
    let base = total / parts as u64;
    let remainder = (total % parts as u64) as usize;
    (0..parts)
        .map(|i| base + u64::from(i < remainder))
        .collect()
}

/// Everything one worker needs; owned, nothing is shared except the pool,
/// the rate controller and the message channel.
pub struct WorkerContext {
    pub worker_id: usize,
    pub config: Arc<RunConfig>,
    pub pool: Arc<ClientPool>,
    pub rate: Arc<RateController>,
    pub custom: Option<Arc<dyn CustomCommand>>,
    /// Per-worker request budget; `None` for duration-bounded runs.
    pub budget: Option<u64>,
    /// Absolute deadline; `None` for count-bounded runs.
    pub deadline: Option<Instant>,
    pub tx: mpsc::Sender<WorkerMessage>,
    pub shutdown: watch::Receiver<bool>,
}

pub async fn run_worker(ctx: WorkerContext) {
    let WorkerContext {
        worker_id,
        config,
        pool,
        rate,
        custom,
        budget,
        deadline,
        tx,
        shutdown,
    } = ctx;

    let mut stats = WorkerStats::new(worker_id);
    let mut keygen = KeyGen::new(config.keys.clone(), worker_id);
    let value = generate_value(
        config.value_size,
        VALUE_SEED.wrapping_add(worker_id as u32),
    );
    let started = Instant::now();
    let mut window_started = started;
    let mut interval_started = started;
    let mut attempted: u64 = 0;

    tracing::debug!(worker_id, ?budget, "worker started");

    loop {
        if *shutdown.borrow() {
            tracing::debug!(worker_id, "worker stopping on shutdown signal");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if budget.is_some_and(|b| attempted >= b) {
            break;
        }

        let Some((index, slot)) = pool.acquire().await else {
            // Pool closed for shutdown while we were waiting.
            break;
        };
        rate.await_slot().await;

        let t0 = Instant::now();
        let outcome = {
            let mut client = slot.lock().await;
            dispatch(&config, custom.as_deref(), &mut keygen, &value, client.as_mut()).await
        };
        let latency_us = (t0.elapsed().as_secs_f64() * 1e6).round() as u64;

        match outcome {
            Ok(()) => stats.record_ok(latency_us),
            Err(e) => {
                let text = e.to_string();
                tracing::warn!(worker_id, error = %text, "request failed");
                stats.record_err(classify_error(&text), Some(latency_us));
            }
        }
        pool.release(index).await;
        attempted += 1;

        if window_started.elapsed() >= Duration::from_secs(1) {
            let snapshot = stats.rotate_window();
            let message = WorkerMessage::Progress {
                worker_id,
                requests_completed: attempted,
                errors: stats.total_errors,
                window_histogram: snapshot.encoded,
                window_count: snapshot.count,
                ts: unix_now(),
            };
            if tx.send(message).await.is_err() {
                break;
            }
            window_started = Instant::now();
        }

        if let Some(csv_interval) = config.csv_interval {
            if interval_started.elapsed() >= csv_interval {
                if send_interval(&tx, worker_id, &mut stats, &mut interval_started)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    // Flush the partial interval, then the lifetime totals.
    if config.csv_interval.is_some() && stats.interval_has_data() {
        let _ = send_interval(&tx, worker_id, &mut stats, &mut interval_started).await;
    }
    let message = WorkerMessage::Final {
        worker_id,
        requests_completed: attempted,
        errors: stats.total_errors,
        overall_histogram: stats.encode_overall(),
        latency_sum_us: stats.latency_sum_us,
        total_time_s: started.elapsed().as_secs_f64(),
    };
    let _ = tx.send(message).await;
    tracing::debug!(worker_id, attempted, "worker finished");
}

async fn send_interval(
    tx: &mpsc::Sender<WorkerMessage>,
    worker_id: usize,
    stats: &mut WorkerStats,
    interval_started: &mut Instant,
) -> Result<(), mpsc::error::SendError<WorkerMessage>> {
    let duration_s = interval_started.elapsed().as_secs_f64();
    let snapshot = stats.rotate_interval();
    let message = WorkerMessage::CsvInterval {
        worker_id,
        window_start_unix: unix_now(),
        duration_s,
        interval_histogram: snapshot.encoded,
        latency_sum_us: snapshot.latency_sum_us,
        counters: snapshot.counters,
    };
    *interval_started = Instant::now();
    tx.send(message).await
}

async fn dispatch(
    config: &RunConfig,
    custom: Option<&dyn CustomCommand>,
    keygen: &mut KeyGen,
    value: &[u8],
    client: &mut dyn KvClient,
) -> Result<(), ClientError> {
    match config.operation {
        Operation::Set => {
            let key = keygen.next_key();
            client.set(&key, value).await
        }
        Operation::Get => {
            let key = keygen.next_key();
            client.get(&key).await.map(|_| ())
        }
        Operation::Custom => match custom {
            Some(command) => command.execute(client).await,
            None => Err(ClientError::Other("no custom command loaded".to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockFactory;
    use crate::config::Bound;
    use crate::metrics::decode_histogram;
    use crate::rate::RatePolicy;
    use std::sync::atomic::Ordering;

    #[test]
    fn budget_partition_spreads_the_remainder_first() {
        assert_eq!(partition_budget(400, 4), [100, 100, 100, 100]);
        assert_eq!(partition_budget(10, 3), [4, 3, 3]);
        assert_eq!(partition_budget(2, 4), [1, 1, 0, 0]);
        assert_eq!(partition_budget(0, 3), [0, 0, 0]);
        assert_eq!(partition_budget(5, 0), [5]);
    }

    async fn spawn_one(
        config: RunConfig,
        factory: &MockFactory,
        budget: Option<u64>,
    ) -> (mpsc::Receiver<WorkerMessage>, tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let pool = ClientPool::connect(factory, 2).await.unwrap();
        let rate = Arc::new(RateController::new(config.rate.clone()));
        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = WorkerContext {
            worker_id: 0,
            config: Arc::new(config),
            pool,
            rate,
            custom: None,
            budget,
            deadline: None,
            tx,
            shutdown: stop_rx,
        };
        (rx, tokio::spawn(run_worker(ctx)), stop_tx)
    }

    #[tokio::test]
    async fn worker_exhausts_its_budget_and_reports_final_totals() {
        let factory = MockFactory::new();
        let config = RunConfig::builder().bound(Bound::Requests(10)).build();
        let (mut rx, handle, _stop) = spawn_one(config, &factory, Some(10)).await;
        handle.await.unwrap();

        let mut finals = Vec::new();
        while let Some(message) = rx.recv().await {
            if let WorkerMessage::Final {
                requests_completed,
                errors,
                overall_histogram,
                ..
            } = message
            {
                finals.push((requests_completed, errors, overall_histogram));
            }
        }
        assert_eq!(finals.len(), 1);
        let (completed, errors, encoded) = &finals[0];
        assert_eq!(*completed, 10);
        assert_eq!(*errors, 0);
        assert_eq!(decode_histogram(encoded).unwrap().len(), 10);
        // Ten set calls actually reached the backend.
        assert_eq!(factory.backend.calls.load(Ordering::Relaxed), 10);
        assert!(factory
            .backend
            .data
            .lock()
            .unwrap()
            .contains_key("key:0:0"));
    }

    #[tokio::test]
    async fn worker_classifies_failures_and_still_finishes() {
        let factory = MockFactory::new();
        factory.backend.fail_calls("MOVED 866 127.0.0.1:7001");
        let config = RunConfig::builder().bound(Bound::Requests(5)).build();
        let (mut rx, handle, _stop) = spawn_one(config, &factory, Some(5)).await;
        handle.await.unwrap();

        let mut saw_final = false;
        while let Some(message) = rx.recv().await {
            if let WorkerMessage::Final {
                requests_completed,
                errors,
                ..
            } = message
            {
                saw_final = true;
                assert_eq!(requests_completed, 5);
                assert_eq!(errors, 5);
            }
        }
        assert!(saw_final);
    }

    #[tokio::test]
    async fn worker_flushes_a_partial_csv_interval_at_exit() {
        let factory = MockFactory::new();
        let config = RunConfig::builder()
            .bound(Bound::Requests(7))
            .csv_interval(Some(Duration::from_secs(3600)))
            .build();
        let (mut rx, handle, _stop) = spawn_one(config, &factory, Some(7)).await;
        handle.await.unwrap();

        let mut interval_requests = 0;
        let mut order = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::CsvInterval { counters, .. } => {
                    order.push("interval");
                    interval_requests += counters.requests;
                }
                WorkerMessage::Final { .. } => order.push("final"),
                WorkerMessage::Progress { .. } => {}
            }
        }
        // The partial interval precedes the final message and carries
        // everything the worker did.
        assert_eq!(order, ["interval", "final"]);
        assert_eq!(interval_requests, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_stops_when_the_pool_closes_for_shutdown() {
        let factory = MockFactory::new();
        let config = RunConfig::builder()
            .bound(Bound::Duration(Duration::from_secs(3600)))
            .rate(RatePolicy::Fixed(50))
            .build();
        let pool = ClientPool::connect(&factory, 1).await.unwrap();
        let rate = Arc::new(RateController::new(RatePolicy::Fixed(50)));
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = WorkerContext {
            worker_id: 0,
            config: Arc::new(config),
            pool: Arc::clone(&pool),
            rate,
            custom: None,
            budget: None,
            deadline: None,
            tx,
            shutdown: stop_rx,
        };
        let handle = tokio::spawn(run_worker(ctx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        pool.close();
        handle.await.unwrap();

        let mut saw_final = false;
        while let Some(message) = rx.recv().await {
            if matches!(message, WorkerMessage::Final { .. }) {
                saw_final = true;
            }
        }
        assert!(saw_final, "final totals are flushed on shutdown");
    }
}

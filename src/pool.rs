//! Bounded client pool with an optional gradual ramp-up.
//!
//! The pool owns every [`KvClient`] handle and lends exactly one at a time to
//! a worker through a free-index queue: a semaphore carries availability,
//! a deque carries the indices. Workers that hold an index have exclusive use
//! of the slot behind it, so slot locks are never contended.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::sync::watch;

use crate::client::{ClientError, ConnectFactory, KvClient};

/// Sizing discipline for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSizing {
    /// Build `size` handles at start and keep the pool there.
    Fixed(usize),
    /// Start at `start` handles; every `interval`, add `step` more until
    /// `end` is reached. Runs concurrently with the workload.
    Ramp {
        start: usize,
        end: usize,
        step: usize,
        interval: Duration,
    },
}

impl PoolSizing {
    pub fn initial(&self) -> usize {
        match self {
            PoolSizing::Fixed(size) => *size,
            PoolSizing::Ramp { start, .. } => *start,
        }
    }
}

type Slot = Arc<Mutex<Box<dyn KvClient>>>;

pub struct ClientPool {
    slots: Mutex<Vec<Slot>>,
    free: Mutex<VecDeque<usize>>,
    available: Semaphore,
    size: AtomicUsize,
    disconnects: AtomicU64,
}

impl ClientPool {
    /// Connect the initial batch of handles. A failure here is fatal: the
    /// run has not started and the orchestrator reports it and exits.
    pub async fn connect(
        factory: &dyn ConnectFactory,
        initial: usize,
    ) -> Result<Arc<Self>, ClientError> {
        let pool = Arc::new(Self {
            slots: Mutex::new(Vec::with_capacity(initial)),
            free: Mutex::new(VecDeque::with_capacity(initial)),
            available: Semaphore::new(0),
            size: AtomicUsize::new(0),
            disconnects: AtomicU64::new(0),
        });
        for _ in 0..initial {
            let client = factory.connect().await?;
            pool.install(client).await;
        }
        tracing::debug!(size = initial, "client pool ready");
        Ok(pool)
    }

    async fn install(&self, client: Box<dyn KvClient>) {
        let mut slots = self.slots.lock().await;
        let index = slots.len();
        slots.push(Arc::new(Mutex::new(client)));
        drop(slots);
        self.free.lock().await.push_back(index);
        self.size.fetch_add(1, Ordering::Relaxed);
        self.available.add_permits(1);
    }

    /// Number of live handles.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Connect attempts that failed twice during ramp-up.
    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Block until a free handle is available and lend it out.
    ///
    /// Returns `None` only if the pool has been closed for shutdown.
    pub async fn acquire(&self) -> Option<(usize, Slot)> {
        let permit = self.available.acquire().await.ok()?;
        // The permit is consumed here and re-created by `release`.
        permit.forget();
        let index = {
            let mut free = self.free.lock().await;
            free.pop_front().expect("semaphore permit without a free index")
        };
        let slot = {
            let slots = self.slots.lock().await;
            Arc::clone(&slots[index])
        };
        Some((index, slot))
    }

    /// Return an index to the free set and wake one waiter.
    pub async fn release(&self, index: usize) {
        self.free.lock().await.push_back(index);
        self.available.add_permits(1);
    }

    /// Stop handing out clients; pending and future `acquire`s get `None`.
    pub fn close(&self) {
        self.available.close();
    }

    /// Grow the pool up to `target`, one handle at a time. A handle that
    /// fails to connect is retried once; a second failure drops it from the
    /// sequence and counts as a disconnect.
    pub async fn grow_to(&self, target: usize, factory: &dyn ConnectFactory) {
        while self.size() < target {
            let client = match factory.connect().await {
                Ok(client) => client,
                Err(first) => {
                    tracing::warn!("pool grow connect failed, retrying once: {first}");
                    match factory.connect().await {
                        Ok(client) => client,
                        Err(second) => {
                            tracing::warn!("pool grow retry failed, dropping handle: {second}");
                            self.disconnects.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    }
                }
            };
            self.install(client).await;
        }
    }

    /// Spawn the ramp task. It grows the pool by `step` every `interval`
    /// until `end` is reached or shutdown is signalled.
    pub fn spawn_ramp(
        self: &Arc<Self>,
        sizing: PoolSizing,
        factory: Arc<dyn ConnectFactory>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let PoolSizing::Ramp {
            end,
            step,
            interval,
            ..
        } = sizing
        else {
            return;
        };
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() || pool.size() >= end {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
                let target = (pool.size() + step).min(end);
                pool.grow_to(target, factory.as_ref()).await;
                tracing::info!(size = pool.size(), target = end, "client pool ramped");
            }
        });
    }
}

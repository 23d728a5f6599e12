//! Per-second rate control with linear and exponential ramps.
//!
//! All workers of one process group share a single [`RateController`]. A call
//! to [`RateController::await_slot`] suspends the caller until the next
//! operation is permitted under the current target, consuming one implicit
//! permit. Pacing state lives behind one mutex; critical sections are O(1)
//! and the suspension while waiting for the next second intentionally holds
//! the lock so that permits are handed out strictly in order.
//!
//! Ramp semantics: every `interval` the target moves one step (additive for
//! linear, multiplicative for exponential) and is clamped to the closed range
//! spanned by `start` and `end` — after the update, never before. After a
//! multi-second stall the second window is reset to "now"; the controller
//! never issues a catch-up burst.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Target-rate schedule for one process group.
#[derive(Debug, Clone, PartialEq)]
pub enum RatePolicy {
    /// No gating; `await_slot` returns immediately.
    None,
    /// Constant queries-per-second target.
    Fixed(u64),
    /// Additive ramp from `start` to `end` by `step` every `interval`.
    Linear {
        start: u64,
        end: u64,
        step: i64,
        interval: Duration,
    },
    /// Multiplicative ramp from `start` to `end` by `factor` every `interval`.
    Exponential {
        start: u64,
        end: u64,
        factor: f64,
        interval: Duration,
    },
}

impl RatePolicy {
    pub fn initial_qps(&self) -> u64 {
        match self {
            RatePolicy::None => 0,
            RatePolicy::Fixed(q) => *q,
            RatePolicy::Linear { start, .. } | RatePolicy::Exponential { start, .. } => *start,
        }
    }

    fn ramp_interval(&self) -> Option<Duration> {
        match self {
            RatePolicy::Linear { interval, .. } | RatePolicy::Exponential { interval, .. } => {
                Some(*interval)
            }
            _ => None,
        }
    }

    /// Derive the per-group policy for a run split into `parts` groups.
    ///
    /// QPS endpoints and the linear step are divided `floor(total/parts)`;
    /// intervals and the exponential factor are shared.
    pub fn divided(&self, parts: u64) -> RatePolicy {
        let parts = parts.max(1);
        let div = |q: u64| (q / parts).max(1);
        match self {
            RatePolicy::None => RatePolicy::None,
            RatePolicy::Fixed(q) => RatePolicy::Fixed(div(*q)),
            RatePolicy::Linear {
                start,
                end,
                step,
                interval,
            } => {
                let divided_step = *step / parts as i64;
                RatePolicy::Linear {
                    start: div(*start),
                    end: div(*end),
                    step: if *step >= 0 {
                        divided_step.max(1)
                    } else {
                        divided_step.min(-1)
                    },
                    interval: *interval,
                }
            }
            RatePolicy::Exponential {
                start,
                end,
                factor,
                interval,
            } => RatePolicy::Exponential {
                start: div(*start),
                end: div(*end),
                factor: *factor,
                interval: *interval,
            },
        }
    }
}

/// Advance the target by one ramp step. Pure so the ramp math is testable
/// in isolation; clamping happens after the update.
fn next_qps(policy: &RatePolicy, current: u64) -> u64 {
    let (lo, hi, next) = match policy {
        RatePolicy::Linear {
            start, end, step, ..
        } => (
            (*start).min(*end),
            (*start).max(*end),
            current as i64 + step,
        ),
        RatePolicy::Exponential {
            start, end, factor, ..
        } => (
            (*start).min(*end),
            (*start).max(*end),
            (current as f64 * factor).round() as i64,
        ),
        _ => return current,
    };
    (next.max(0) as u64).clamp(lo, hi)
}

struct PaceState {
    current_qps: u64,
    issued_this_second: u64,
    second_start: Instant,
    last_ramp: Instant,
}

/// Gate on the current queries-per-second target.
pub struct RateController {
    policy: RatePolicy,
    state: Mutex<PaceState>,
}

impl RateController {
    pub fn new(policy: RatePolicy) -> Self {
        let now = Instant::now();
        let state = PaceState {
            current_qps: policy.initial_qps(),
            issued_this_second: 0,
            second_start: now,
            last_ramp: now,
        };
        Self {
            policy,
            state: Mutex::new(state),
        }
    }

    /// Current target, mainly for observability and tests.
    pub async fn current_qps(&self) -> u64 {
        self.state.lock().await.current_qps
    }

    /// Suspend until the next call is permitted, consuming one permit.
    pub async fn await_slot(&self) {
        if matches!(self.policy, RatePolicy::None) {
            return;
        }
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(interval) = self.policy.ramp_interval() {
            if now.duration_since(state.last_ramp) >= interval {
                let next = next_qps(&self.policy, state.current_qps);
                if next != state.current_qps {
                    tracing::info!(qps = next, "rate target updated");
                }
                state.current_qps = next;
                state.last_ramp = now;
            }
        }

        if now.duration_since(state.second_start) >= Duration::from_secs(1) {
            state.issued_this_second = 0;
            state.second_start = now;
        }

        if state.issued_this_second >= state.current_qps {
            let next_second = state.second_start + Duration::from_secs(1);
            sleep_until(next_second).await;
            state.issued_this_second = 0;
            state.second_start = Instant::now();
        }

        state.issued_this_second += 1;
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer arms for `await`.
//!
//! The deadline is fixed when the arm is created. The first registration
//! starts a sleeper thread that fires every registration at the deadline;
//! later registrations join the same list.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::awaitable::{run_callback, Awaitable, Registration, Waker};
use crate::context::TaskContext;
use crate::error::{ConcError, Signal};
use crate::value::{Callable, Value};

/// Largest sleep accepted by default: `i32::MAX` milliseconds.
pub const MAX_SLEEP_MS: u64 = 2_147_483_647;

/// Convert a language duration in milliseconds, clamped to `[0, max_ms]`.
///
/// Floats are truncated; NaN and infinities are rejected.
pub fn sleep_duration(value: &Value, max_ms: u64) -> Result<Duration, ConcError> {
    let ms = match value {
        Value::Int(n) => (*n).clamp(0, max_ms.min(i64::MAX as u64) as i64) as u64,
        Value::Float(x) => {
            if !x.is_finite() {
                return Err(ConcError::InvalidDuration(format!(
                    "sleep_ms expects a finite number, got {}",
                    x
                )));
            }
            x.trunc().clamp(0.0, max_ms as f64) as u64
        }
        other => {
            return Err(ConcError::TypeError(format!(
                "sleep_ms expects a number, got {}",
                other.type_name()
            )))
        }
    };
    Ok(Duration::from_millis(ms))
}

#[derive(Default)]
struct TimerState {
    started: bool,
    fired: bool,
    waiters: Vec<Registration>,
}

/// Arm that becomes ready once its deadline passes.
pub struct SleepArm {
    deadline: Instant,
    callback: Option<Callable>,
    state: Arc<Mutex<TimerState>>,
}

impl SleepArm {
    pub fn new(duration: Duration, callback: Option<Callable>) -> Self {
        Self {
            deadline: Instant::now() + duration,
            callback,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Awaitable for SleepArm {
    fn is_ready(&self, _cx: &TaskContext) -> Result<bool, Signal> {
        Ok(Instant::now() >= self.deadline)
    }

    fn register(&self, cx: &TaskContext, waker: Waker) -> Result<Registration, Signal> {
        let reg = Registration::new(waker);
        let spawn_sleeper = {
            let mut state = self.state.lock();
            if state.fired || Instant::now() >= self.deadline {
                drop(state);
                reg.fire();
                return Ok(reg);
            }
            state.waiters.push(reg.clone());
            !std::mem::replace(&mut state.started, true)
        };
        if spawn_sleeper {
            let state = self.state.clone();
            let deadline = self.deadline;
            let guard = cx.executor().external_wait();
            let spawned = thread::Builder::new()
                .name("tandem-timer".to_string())
                .spawn(move || {
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                    let waiters = {
                        let mut state = state.lock();
                        state.fired = true;
                        std::mem::take(&mut state.waiters)
                    };
                    tracing::trace!(waiters = waiters.len(), "timer fired");
                    for waiter in waiters {
                        waiter.fire();
                    }
                    drop(guard);
                });
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "failed to spawn timer thread; firing early");
                reg.fire();
            }
        }
        Ok(reg)
    }

    fn commit(&self, cx: &TaskContext) -> Result<Value, Signal> {
        run_callback(cx, self.callback.as_ref(), &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CooperativeExecutor, Executor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn integer_durations_are_clamped() {
        assert_eq!(
            sleep_duration(&Value::Int(-5), MAX_SLEEP_MS).unwrap(),
            Duration::ZERO
        );
        assert_eq!(
            sleep_duration(&Value::Int(i64::MAX), MAX_SLEEP_MS).unwrap(),
            Duration::from_millis(MAX_SLEEP_MS)
        );
        assert_eq!(
            sleep_duration(&Value::Int(25), MAX_SLEEP_MS).unwrap(),
            Duration::from_millis(25)
        );
    }

    #[test]
    fn float_durations_truncate_and_reject_nan() {
        assert_eq!(
            sleep_duration(&Value::Float(2.9), MAX_SLEEP_MS).unwrap(),
            Duration::from_millis(2)
        );
        assert!(matches!(
            sleep_duration(&Value::Float(f64::NAN), MAX_SLEEP_MS),
            Err(ConcError::InvalidDuration(_))
        ));
        assert!(matches!(
            sleep_duration(&Value::Float(f64::INFINITY), MAX_SLEEP_MS),
            Err(ConcError::InvalidDuration(_))
        ));
        assert!(matches!(
            sleep_duration(&Value::str("1"), MAX_SLEEP_MS),
            Err(ConcError::TypeError(_))
        ));
    }

    #[test]
    fn zero_sleep_is_ready_immediately() {
        let exec = CooperativeExecutor::default();
        let cx = exec.root_context();
        let arm = SleepArm::new(Duration::ZERO, None);
        assert!(arm.is_ready(&cx).unwrap());
    }

    #[test]
    fn registration_fires_after_deadline() {
        let exec = CooperativeExecutor::default();
        let cx = exec.root_context();
        let arm = SleepArm::new(Duration::from_millis(15), None);
        assert!(!arm.is_ready(&cx).unwrap());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let waker = Waker::new(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let reg = arm.register(&cx, waker).unwrap();
        assert!(reg.is_armed());
        thread::sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(arm.is_ready(&cx).unwrap());
    }
}

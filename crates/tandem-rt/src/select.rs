// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The `await` evaluator: wait on several arms, take exactly one.
//!
//! Ready arms are polled on every pass; when several are ready the pick
//! rotates through them using a counter shared by the whole executor.
//! With nothing ready, the default arm wins if present; otherwise a
//! fresh trigger-once waker is registered with every arm and the caller
//! suspends. State lives in the task context keyed by `AwaitSite`, so a
//! cooperative re-invocation resumes the same arm set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::awaitable::{as_awaitable, Awaitable, Registration, Waker};
use crate::context::{PendingKey, TaskContext};
use crate::error::{ConcError, Signal};
use crate::value::Value;

static NEXT_SITE: AtomicU64 = AtomicU64::new(1);

/// Identity of one `await` expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AwaitSite(u64);

impl AwaitSite {
    /// A site distinct from every other site created in this process.
    pub fn new() -> Self {
        AwaitSite(NEXT_SITE.fetch_add(1, Ordering::Relaxed) | (1 << 63))
    }

    /// A site chosen by the caller, e.g. from a syntax node id.
    pub const fn from_raw(raw: u64) -> Self {
        AwaitSite(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Default for AwaitSite {
    fn default() -> Self {
        Self::new()
    }
}

struct AwaitState {
    arms: Vec<Arc<dyn Awaitable>>,
    default: Option<usize>,
    registrations: Vec<Option<Registration>>,
    waker: Option<Waker>,
    committing: Option<usize>,
}

impl AwaitState {
    fn new(values: Vec<Value>) -> Result<Self, ConcError> {
        if values.is_empty() {
            return Err(ConcError::EmptyAwait);
        }
        let arms = values
            .iter()
            .map(as_awaitable)
            .collect::<Result<Vec<_>, _>>()?;
        let mut default = None;
        for (i, arm) in arms.iter().enumerate() {
            if arm.is_default() {
                if default.is_some() {
                    return Err(ConcError::MultipleDefaultArms);
                }
                default = Some(i);
            }
        }
        let registrations = vec![None; arms.len()];
        Ok(Self {
            arms,
            default,
            registrations,
            waker: None,
            committing: None,
        })
    }

    /// Detach every registration except `keep`.
    fn take_registrations(&mut self, keep: Option<usize>) -> Vec<Registration> {
        self.registrations
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| Some(*i) != keep)
            .filter_map(|(_, reg)| reg.take())
            .collect()
    }
}

fn cancel_all(regs: Vec<Registration>) {
    for reg in regs {
        reg.cancel();
    }
}

/// Evaluate an `await` over the arms produced by `make_arms`.
///
/// `make_arms` runs once per site visit; re-entering the same site after a
/// cooperative suspend reuses the stored arms, and an `await` the body
/// already finished replays its result.
pub fn await_arms<F>(cx: &TaskContext, site: AwaitSite, make_arms: F) -> Result<Value, Signal>
where
    F: FnOnce() -> Result<Vec<Value>, Signal>,
{
    cx.journaled(|_| evaluate(cx, site, make_arms))
}

fn evaluate<F>(cx: &TaskContext, site: AwaitSite, make_arms: F) -> Result<Value, Signal>
where
    F: FnOnce() -> Result<Vec<Value>, Signal>,
{
    let key = PendingKey::Await(site);
    let state = match cx.stashed::<Mutex<AwaitState>>(key) {
        Some(state) => state,
        None => {
            let state = Arc::new(Mutex::new(AwaitState::new(make_arms()?)?));
            cx.stash(key, state.clone());
            state
        }
    };

    let result = run_await(cx, &state);
    if !matches!(result, Err(Signal::Yield)) {
        let regs = state.lock().take_registrations(None);
        cancel_all(regs);
        cx.unstash(key);
    }
    result
}

/// Convenience for an arm list known up front.
pub fn await_values(cx: &TaskContext, site: AwaitSite, arms: Vec<Value>) -> Result<Value, Signal> {
    await_arms(cx, site, move || Ok(arms))
}

fn run_await(cx: &TaskContext, state: &Arc<Mutex<AwaitState>>) -> Result<Value, Signal> {
    loop {
        let (committing, arms, default) = {
            let s = state.lock();
            if let Some(waker) = &s.waker {
                tracing::trace!(task_id = ?cx.task_id(), woken = waker.is_fired(), "await resumed");
            }
            (s.committing, s.arms.clone(), s.default)
        };
        if let Some(i) = committing {
            return commit(cx, state, i);
        }

        let mut ready = Vec::new();
        for (i, arm) in arms.iter().enumerate() {
            if Some(i) != default && arm.is_ready(cx)? {
                ready.push(i);
            }
        }
        if !ready.is_empty() {
            let k = cx.executor().next_fairness_index();
            return commit(cx, state, ready[k % ready.len()]);
        }
        if let Some(i) = default {
            return commit(cx, state, i);
        }
        if cx.cancel_requested() {
            return Err(Signal::Cancelled(None));
        }

        let stale = state.lock().take_registrations(None);
        cancel_all(stale);
        let waker = Waker::new(cx.resumer());
        for (i, arm) in arms.iter().enumerate() {
            if Some(i) == default {
                continue;
            }
            let reg = arm.register(cx, waker.clone())?;
            state.lock().registrations[i] = Some(reg);
        }
        state.lock().waker = Some(waker);
        tracing::trace!(task_id = ?cx.task_id(), arms = arms.len(), "await suspended");
        cx.suspend()?;
    }
}

fn commit(cx: &TaskContext, state: &Arc<Mutex<AwaitState>>, index: usize) -> Result<Value, Signal> {
    let (arm, losers) = {
        let mut s = state.lock();
        s.committing = Some(index);
        (s.arms[index].clone(), s.take_registrations(Some(index)))
    };
    cancel_all(losers);
    arm.commit(cx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::DefaultArm;
    use crate::executor::{CooperativeExecutor, Executor};
    use std::sync::atomic::AtomicUsize;

    struct Ready {
        value: i64,
        registers: Arc<AtomicUsize>,
    }

    impl Awaitable for Ready {
        fn is_ready(&self, _cx: &TaskContext) -> Result<bool, Signal> {
            Ok(true)
        }

        fn register(&self, _cx: &TaskContext, waker: Waker) -> Result<Registration, Signal> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            Ok(Registration::new(waker))
        }

        fn commit(&self, _cx: &TaskContext) -> Result<Value, Signal> {
            Ok(Value::Int(self.value))
        }
    }

    fn ready(value: i64, registers: &Arc<AtomicUsize>) -> Value {
        Value::Awaitable(Arc::new(Ready {
            value,
            registers: registers.clone(),
        }))
    }

    #[test]
    fn always_ready_arm_commits_without_registering() {
        let exec = CooperativeExecutor::default();
        let cx = exec.root_context();
        let registers = Arc::new(AtomicUsize::new(0));
        let v = await_values(&cx, AwaitSite::new(), vec![ready(5, &registers)]).unwrap();
        assert_eq!(v, Value::Int(5));
        assert_eq!(registers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_arm_alone_commits_immediately() {
        let exec = CooperativeExecutor::default();
        let cx = exec.root_context();
        let arm = Value::Awaitable(Arc::new(DefaultArm::new(None)));
        assert_eq!(
            await_values(&cx, AwaitSite::new(), vec![arm]).unwrap(),
            Value::Nil
        );
    }

    #[test]
    fn two_ready_arms_alternate() {
        let exec = CooperativeExecutor::default();
        let cx = exec.root_context();
        let registers = Arc::new(AtomicUsize::new(0));
        let picks: Vec<Value> = (0..4)
            .map(|_| {
                await_values(
                    &cx,
                    AwaitSite::new(),
                    vec![ready(1, &registers), ready(2, &registers)],
                )
                .unwrap()
            })
            .collect();
        assert_eq!(
            picks,
            vec![Value::Int(1), Value::Int(2), Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn ready_arm_beats_default() {
        let exec = CooperativeExecutor::default();
        let cx = exec.root_context();
        let registers = Arc::new(AtomicUsize::new(0));
        let arms = vec![
            Value::Awaitable(Arc::new(DefaultArm::new(None))),
            ready(7, &registers),
        ];
        assert_eq!(
            await_values(&cx, AwaitSite::new(), arms).unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn malformed_arm_lists_are_rejected() {
        let exec = CooperativeExecutor::default();
        let cx = exec.root_context();
        assert_eq!(
            await_values(&cx, AwaitSite::new(), vec![])
                .unwrap_err()
                .as_error(),
            Some(&ConcError::EmptyAwait)
        );
        let two_defaults = vec![
            Value::Awaitable(Arc::new(DefaultArm::new(None))),
            Value::Awaitable(Arc::new(DefaultArm::new(None))),
        ];
        assert_eq!(
            await_values(&cx, AwaitSite::new(), two_defaults)
                .unwrap_err()
                .as_error(),
            Some(&ConcError::MultipleDefaultArms)
        );
        assert_eq!(
            await_values(&cx, AwaitSite::new(), vec![Value::Int(3)])
                .unwrap_err()
                .as_error(),
            Some(&ConcError::NotAwaitable("i64".to_string()))
        );
    }

    #[test]
    fn sites_are_distinct() {
        assert_ne!(AwaitSite::new(), AwaitSite::new());
        assert_eq!(AwaitSite::from_raw(4).raw(), 4);
    }
}

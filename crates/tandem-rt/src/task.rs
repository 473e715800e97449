// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task handles: status, result and cancellation for one unit of work.
//!
//! A handle moves from Pending to exactly one terminal state. Result and
//! failure are write-once; awaiters registered before completion fire
//! once after the transition, awaiters registered afterwards fire
//! immediately.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::context::TaskContext;
use crate::error::{ConcError, Signal};
use crate::value::{ErrorValue, StatusValue, Value};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Kind name used for every task failure payload.
pub const PROC_ERROR: &str = "ProcError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Resolved,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Resolved => "Resolved",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a task was spawned as a proc or a future. Only affects labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Proc,
    Future,
}

impl TaskKind {
    pub fn label(self) -> &'static str {
        match self {
            TaskKind::Proc => "Proc",
            TaskKind::Future => "Future",
        }
    }
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pending,
    Resolved(Value),
    Cancelled(Value),
    Failed(Value),
}

impl Outcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Pending => TaskStatus::Pending,
            Outcome::Resolved(_) => TaskStatus::Resolved,
            Outcome::Cancelled(_) => TaskStatus::Cancelled,
            Outcome::Failed(_) => TaskStatus::Failed,
        }
    }

    /// The value a reader observes: the result, or the failure raised.
    ///
    /// `None` while still pending.
    pub fn into_result(self) -> Option<Result<Value, Signal>> {
        match self {
            Outcome::Pending => None,
            Outcome::Resolved(v) => Some(Ok(v)),
            Outcome::Cancelled(p) | Outcome::Failed(p) => Some(Err(Signal::Raise(p))),
        }
    }
}

/// Failure payload for a task that raised or panicked.
pub fn failure_value(kind: TaskKind, details: &str, cause: Option<Value>) -> Value {
    let err = ErrorValue::new(PROC_ERROR, format!("{} failed: {}", kind.label(), details));
    Value::error(match cause {
        Some(c) => err.with_cause(c),
        None => err,
    })
}

/// Failure payload for a cancelled task.
pub fn cancelled_value(kind: TaskKind) -> Value {
    Value::error(ErrorValue::new(
        PROC_ERROR,
        format!("{} cancelled", kind.label()),
    ))
}

type Awaiter = Box<dyn FnOnce() + Send>;

struct TaskState {
    status: TaskStatus,
    result: Option<Value>,
    failure: Option<Value>,
    started: bool,
    awaiters: IndexMap<u64, Awaiter>,
    next_awaiter: u64,
}

struct TaskInner {
    id: u64,
    kind: TaskKind,
    state: Mutex<TaskState>,
    done: Condvar,
    token: CancelToken,
}

/// Shared handle to one task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                state: Mutex::new(TaskState {
                    status: TaskStatus::Pending,
                    result: None,
                    failure: None,
                    started: false,
                    awaiters: IndexMap::new(),
                    next_awaiter: 0,
                }),
                done: Condvar::new(),
                token: CancelToken::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TaskStatus::Pending
    }

    pub fn snapshot(&self) -> Outcome {
        let state = self.inner.state.lock();
        match state.status {
            TaskStatus::Pending => Outcome::Pending,
            TaskStatus::Resolved => {
                Outcome::Resolved(state.result.clone().unwrap_or(Value::Nil))
            }
            TaskStatus::Cancelled => Outcome::Cancelled(
                state
                    .failure
                    .clone()
                    .unwrap_or_else(|| cancelled_value(self.inner.kind)),
            ),
            TaskStatus::Failed => Outcome::Failed(
                state
                    .failure
                    .clone()
                    .unwrap_or_else(|| failure_value(self.inner.kind, "unknown", None)),
            ),
        }
    }

    /// The `status()` value exposed to language code.
    pub fn status_value(&self) -> Value {
        let state = self.inner.state.lock();
        Value::Status(Arc::new(StatusValue {
            status: state.status,
            failure: state.failure.clone(),
        }))
    }

    pub fn resolve(&self, value: Value) -> bool {
        self.complete(TaskStatus::Resolved, value, false)
    }

    pub fn fail(&self, payload: Value) -> bool {
        self.complete(TaskStatus::Failed, payload, false)
    }

    pub fn cancel(&self, payload: Value) -> bool {
        self.complete(TaskStatus::Cancelled, payload, false)
    }

    fn complete(&self, status: TaskStatus, value: Value, only_unstarted: bool) -> bool {
        let awaiters = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() || (only_unstarted && state.started) {
                return false;
            }
            state.status = status;
            match status {
                TaskStatus::Resolved => state.result = Some(value),
                _ => state.failure = Some(value),
            }
            std::mem::take(&mut state.awaiters)
        };
        tracing::debug!(task_id = self.inner.id, kind = ?self.inner.kind, %status, "task completed");
        self.inner.done.notify_all();
        for (_, awaiter) in awaiters {
            awaiter();
        }
        true
    }

    /// Request cancellation.
    ///
    /// Advisory for a running task: it observes the flag at its next
    /// suspension point. A task that never started is cancelled on the spot
    /// and its body never runs.
    pub fn request_cancel(&self) {
        tracing::debug!(task_id = self.inner.id, "cancel requested");
        self.inner.token.cancel();
        self.complete(TaskStatus::Cancelled, cancelled_value(self.inner.kind), true);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    /// Claim the right to run the body. False if the task already finished
    /// (e.g. cancelled before it started).
    pub fn mark_started(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.started = true;
        true
    }

    pub fn has_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// Run `f` once the handle is terminal; immediately if it already is.
    ///
    /// Returns the id to pass to `remove_awaiter`, or `None` when `f` already
    /// ran.
    pub fn add_awaiter<F>(&self, f: F) -> Option<u64>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if !state.status.is_terminal() {
                let id = state.next_awaiter;
                state.next_awaiter += 1;
                state.awaiters.insert(id, Box::new(f));
                return Some(id);
            }
        }
        f();
        None
    }

    /// Drop an awaiter that has not fired yet.
    pub fn remove_awaiter(&self, id: u64) -> bool {
        self.inner.state.lock().awaiters.shift_remove(&id).is_some()
    }

    /// Awaiters still waiting for the terminal transition.
    pub fn pending_awaiters(&self) -> usize {
        self.inner.state.lock().awaiters.len()
    }

    pub(crate) fn downgrade(&self) -> WeakTaskHandle {
        WeakTaskHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Block the calling thread until the handle is terminal.
    ///
    /// Does not drive cooperative tasks; use `TaskContext::wait_for` from
    /// code that may run on the cooperative executor.
    pub fn await_blocking(&self) -> Outcome {
        {
            let mut state = self.inner.state.lock();
            while !state.status.is_terminal() {
                self.inner.done.wait(&mut state);
            }
        }
        self.snapshot()
    }

    /// Like `await_blocking` but gives up after `timeout`.
    pub fn await_timeout(&self, timeout: Duration) -> Outcome {
        {
            let mut state = self.inner.state.lock();
            if !state.status.is_terminal() {
                self.inner.done.wait_for(&mut state, timeout);
            }
        }
        self.snapshot()
    }

    /// Wait for the task (driving it when cooperative) and return its result
    /// or raise its failure.
    pub fn value(&self, cx: &TaskContext) -> Result<Value, Signal> {
        match cx.wait_for(self)?.into_result() {
            Some(result) => result,
            None => Err(ConcError::WouldBlock.into()),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// Non-owning handle, held by wake-up hooks that must not keep a task alive.
#[derive(Clone)]
pub(crate) struct WeakTaskHandle {
    inner: Weak<TaskInner>,
}

impl WeakTaskHandle {
    pub(crate) fn upgrade(&self) -> Option<TaskHandle> {
        self.inner.upgrade().map(|inner| TaskHandle { inner })
    }
}

/// A task handle whose result is computed once and shared by every reader.
#[derive(Clone, Debug)]
pub struct FutureHandle {
    handle: TaskHandle,
}

impl FutureHandle {
    pub fn new(handle: TaskHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn status(&self) -> TaskStatus {
        self.handle.status()
    }

    pub fn value(&self, cx: &TaskContext) -> Result<Value, Signal> {
        self.handle.value(cx)
    }

    pub fn request_cancel(&self) {
        self.handle.request_cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn terminal_transition_happens_once() {
        let h = TaskHandle::new(TaskKind::Proc);
        assert_eq!(h.status(), TaskStatus::Pending);
        assert!(h.resolve(Value::Int(1)));
        assert!(!h.fail(Value::str("late")));
        assert!(!h.resolve(Value::Int(2)));
        assert_eq!(h.snapshot(), Outcome::Resolved(Value::Int(1)));
    }

    #[test]
    fn cancel_before_start_skips_body() {
        let h = TaskHandle::new(TaskKind::Future);
        h.request_cancel();
        assert_eq!(h.status(), TaskStatus::Cancelled);
        assert!(!h.mark_started());
        match h.snapshot() {
            Outcome::Cancelled(p) => {
                assert_eq!(p.as_error().map(|e| e.message()), Some("Future cancelled"))
            }
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[test]
    fn cancel_after_start_is_advisory() {
        let h = TaskHandle::new(TaskKind::Proc);
        assert!(h.mark_started());
        h.request_cancel();
        assert!(h.is_cancel_requested());
        assert_eq!(h.status(), TaskStatus::Pending);
    }

    #[test]
    fn awaiters_fire_once_and_late_awaiters_fire_immediately() {
        let h = TaskHandle::new(TaskKind::Proc);
        let hits = Arc::new(AtomicUsize::new(0));
        let early = hits.clone();
        h.add_awaiter(move || {
            early.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        h.resolve(Value::Nil);
        h.resolve(Value::Nil);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let late = hits.clone();
        let id = h.add_awaiter(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(id, None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_awaiter_never_fires() {
        let h = TaskHandle::new(TaskKind::Proc);
        let hits = Arc::new(AtomicUsize::new(0));
        let kept = hits.clone();
        let dropped = hits.clone();
        h.add_awaiter(move || {
            kept.fetch_add(1, Ordering::SeqCst);
        });
        let id = h
            .add_awaiter(move || {
                dropped.fetch_add(10, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(h.pending_awaiters(), 2);
        assert!(h.remove_awaiter(id));
        assert!(!h.remove_awaiter(id));
        assert_eq!(h.pending_awaiters(), 1);
        h.resolve(Value::Nil);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(h.pending_awaiters(), 0);
    }

    #[test]
    fn await_blocking_wakes_on_other_thread() {
        let h = TaskHandle::new(TaskKind::Proc);
        let h2 = h.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            h2.fail(failure_value(TaskKind::Proc, "boom", None));
        });
        let outcome = h.await_blocking();
        t.join().unwrap();
        assert_eq!(outcome.status(), TaskStatus::Failed);
        let payload = match outcome {
            Outcome::Failed(p) => p,
            _ => unreachable!(),
        };
        let err = payload.as_error().unwrap();
        assert_eq!(err.kind(), PROC_ERROR);
        assert_eq!(err.message(), "Proc failed: boom");
    }

    #[test]
    fn status_value_carries_failure() {
        let h = TaskHandle::new(TaskKind::Proc);
        h.fail(Value::str("bad"));
        match h.status_value() {
            Value::Status(s) => {
                assert_eq!(s.status, TaskStatus::Failed);
                assert_eq!(s.failure, Some(Value::str("bad")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

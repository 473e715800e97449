// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Executors: own task threads or queues and run task bodies.
//!
//! Two strategies share one interface and the same observable semantics:
//! - `parallel`: one OS thread per task, pending/blocked accounting
//! - `cooperative`: single FIFO queue, bodies suspend by returning
//!   `Signal::Yield` and are re-invoked later
//!
//! Channels, mutexes and `await` only talk to the executor through the
//! suspend/resume hooks below.

pub mod cooperative;
pub mod parallel;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::{Resumer, TaskContext};
use crate::error::Signal;
use crate::task::{cancelled_value, failure_value, FutureHandle, TaskHandle, TaskKind};
use crate::value::Value;

pub use cooperative::CooperativeExecutor;
pub use parallel::ParallelExecutor;

/// A task body. Re-invoked from the top after it returns `Signal::Yield`.
pub type TaskBody = Box<dyn FnMut(&TaskContext) -> Result<Value, Signal> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Parallel,
    Cooperative,
}

impl ExecutorKind {
    pub fn name(self) -> &'static str {
        match self {
            ExecutorKind::Parallel => "parallel",
            ExecutorKind::Cooperative => "cooperative",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interface shared by both scheduling strategies.
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Create a handle and schedule `body` to run under it.
    fn spawn(&self, kind: TaskKind, body: TaskBody) -> TaskHandle;

    fn run_proc(&self, body: TaskBody) -> TaskHandle {
        self.spawn(TaskKind::Proc, body)
    }

    fn run_future(&self, body: TaskBody) -> FutureHandle {
        FutureHandle::new(self.spawn(TaskKind::Future, body))
    }

    /// Run until no useful work remains.
    fn flush(&self, cx: &TaskContext) -> Result<(), Signal>;

    fn pending_tasks(&self) -> usize;

    /// A context for callers outside any task.
    fn root_context(&self) -> TaskContext;

    /// Wait for a resume of `cx`. See `TaskContext::suspend`.
    fn suspend(&self, cx: &TaskContext) -> Result<(), Signal>;

    fn resumer(&self, cx: &TaskContext) -> Resumer;

    /// Give other tasks a turn. Fails with `OutsideTask` at the root.
    fn yield_now(&self, cx: &TaskContext) -> Result<(), Signal>;

    /// Make progress on `handle` from the caller's thread, if the strategy
    /// allows it.
    fn drive(&self, handle: &TaskHandle);

    /// Round-robin counter shared by every `await` on this executor.
    fn next_fairness_index(&self) -> usize;

    /// Record a wait that something outside the executor (a timer thread)
    /// will end. Held until dropped.
    fn external_wait(&self) -> ExternalWait;
}

/// Guard counting an outstanding external wake source.
#[derive(Debug)]
pub struct ExternalWait {
    counter: Option<Arc<AtomicUsize>>,
}

impl ExternalWait {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Some(counter),
        }
    }

    /// Guard for an executor that does not track external wakes.
    pub(crate) fn untracked() -> Self {
        Self { counter: None }
    }
}

impl Drop for ExternalWait {
    fn drop(&mut self) {
        if let Some(counter) = &self.counter {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Invoke `body`, turning a panic into a raised error value.
pub(crate) fn safe_invoke(body: &mut TaskBody, cx: &TaskContext) -> Result<Value, Signal> {
    match panic::catch_unwind(AssertUnwindSafe(|| body(cx))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::debug!(task_id = ?cx.task_id(), %msg, "task body panicked");
            Err(Signal::Raise(Value::str(&format!("panic: {}", msg))))
        }
    }
}

/// Record the terminal result of a body on its handle.
pub(crate) fn apply_outcome(handle: &TaskHandle, result: Result<Value, Signal>) {
    let kind = handle.kind();
    match result {
        Ok(_) if handle.is_cancel_requested() => {
            handle.cancel(cancelled_value(kind));
        }
        Ok(value) => {
            handle.resolve(value);
        }
        Err(Signal::Cancelled(payload)) => {
            handle.cancel(payload.unwrap_or_else(|| cancelled_value(kind)));
        }
        Err(Signal::Raise(value)) => {
            let details = match value.as_error() {
                Some(err) => err.message().to_string(),
                None => value.to_string(),
            };
            handle.fail(failure_value(kind, &details, Some(value)));
        }
        Err(Signal::Error(err)) => {
            handle.fail(failure_value(kind, &err.to_string(), Some(err.to_value())));
        }
        Err(Signal::Yield) => {
            // Executors re-invoke yielded bodies; reaching here means the body
            // yielded where no scheduler could resume it.
            handle.fail(failure_value(kind, "yield outside of a scheduler", None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConcError;
    use crate::task::{Outcome, TaskStatus};

    #[test]
    fn external_wait_counts_until_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = ExternalWait::new(counter.clone());
        assert_eq!(counter.load(Ordering::Acquire), 1);
        drop(guard);
        assert_eq!(counter.load(Ordering::Acquire), 0);
        drop(ExternalWait::untracked());
    }

    #[test]
    fn completed_body_after_cancel_request_ends_cancelled() {
        let h = TaskHandle::new(TaskKind::Proc);
        assert!(h.mark_started());
        h.request_cancel();
        apply_outcome(&h, Ok(Value::Int(1)));
        assert_eq!(h.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn raised_value_becomes_failure_with_cause() {
        let h = TaskHandle::new(TaskKind::Future);
        apply_outcome(&h, Err(Signal::Raise(Value::str("boom"))));
        match h.snapshot() {
            Outcome::Failed(p) => {
                let err = p.as_error().unwrap();
                assert_eq!(err.message(), "Future failed: boom");
                assert_eq!(err.cause(), Some(&Value::str("boom")));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn programming_error_becomes_failure() {
        let h = TaskHandle::new(TaskKind::Proc);
        apply_outcome(&h, Err(ConcError::MutexUnlocked.into()));
        match h.snapshot() {
            Outcome::Failed(p) => assert_eq!(
                p.as_error().map(|e| e.message()),
                Some("Proc failed: unlock of unlocked mutex")
            ),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn executor_kind_names() {
        assert_eq!(ExecutorKind::Parallel.to_string(), "parallel");
        assert_eq!(ExecutorKind::Cooperative.name(), "cooperative");
    }
}

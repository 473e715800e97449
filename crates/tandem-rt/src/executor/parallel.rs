// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread-per-task executor.
//!
//! Every task runs on its own named OS thread. `pending` counts tasks not
//! yet finished; `blocked` counts tasks parked in a genuine wait. `flush`
//! returns once every pending task is blocked, so mutually stuck tasks
//! cannot hang it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::context::{Parker, Resumer, TaskContext};
use crate::error::{ConcError, Signal};
use crate::task::{failure_value, TaskHandle, TaskKind};

use super::{apply_outcome, safe_invoke, Executor, ExecutorKind, ExternalWait, TaskBody};

struct ParallelShared {
    pending: AtomicUsize,
    blocked: AtomicUsize,
    fairness: AtomicUsize,
    thread_name_prefix: String,
    backoff_max: Duration,
}

/// Executor backed by real threads.
#[derive(Clone)]
pub struct ParallelExecutor {
    shared: Arc<ParallelShared>,
}

impl ParallelExecutor {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(ParallelShared {
                pending: AtomicUsize::new(0),
                blocked: AtomicUsize::new(0),
                fairness: AtomicUsize::new(0),
                thread_name_prefix: config.thread_name_prefix.clone(),
                backoff_max: Duration::from_micros(config.flush_backoff_max_us.max(1)),
            }),
        }
    }

    /// Tasks currently parked in a wait.
    pub fn blocked_tasks(&self) -> usize {
        self.shared.blocked.load(Ordering::Acquire)
    }

    fn mark_blocked(&self) {
        self.shared.blocked.fetch_add(1, Ordering::AcqRel);
    }

    fn mark_unblocked(&self) {
        self.shared.blocked.fetch_sub(1, Ordering::AcqRel);
    }

    fn run_task(&self, handle: &TaskHandle, cx: &TaskContext, mut body: TaskBody) {
        if handle.mark_started() {
            tracing::debug!(task_id = handle.id(), "task started");
            loop {
                match safe_invoke(&mut body, cx) {
                    Err(Signal::Yield) => thread::yield_now(),
                    result => {
                        apply_outcome(handle, result);
                        break;
                    }
                }
            }
        }
        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default())
    }
}

impl Executor for ParallelExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Parallel
    }

    fn spawn(&self, kind: TaskKind, body: TaskBody) -> TaskHandle {
        let handle = TaskHandle::new(kind);
        let cx = TaskContext::new(
            Arc::new(self.clone()),
            Some(handle.clone()),
            Arc::new(Parker::new()),
        );
        let parker = cx.parker().clone();
        handle.token().on_cancel(move || parker.unpark());

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(task_id = handle.id(), ?kind, executor = "parallel", "task spawned");

        let exec = self.clone();
        let task = handle.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.shared.thread_name_prefix, handle.id()))
            .spawn(move || exec.run_task(&task, &cx, body));
        if let Err(e) = spawned {
            tracing::warn!(task_id = handle.id(), error = %e, "failed to spawn task thread");
            handle.fail(failure_value(kind, &format!("failed to spawn thread: {}", e), None));
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        handle
    }

    fn flush(&self, cx: &TaskContext) -> Result<(), Signal> {
        tracing::trace!(pending = self.pending_tasks(), "flush begin");
        if cx.in_task() {
            self.mark_blocked();
        }
        let mut backoff = Duration::from_micros(50).min(self.shared.backoff_max);
        loop {
            let pending = self.shared.pending.load(Ordering::Acquire);
            let blocked = self.shared.blocked.load(Ordering::Acquire);
            if pending == 0 || blocked >= pending {
                break;
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(self.shared.backoff_max);
        }
        if cx.in_task() {
            self.mark_unblocked();
        }
        tracing::trace!("flush end");
        Ok(())
    }

    fn pending_tasks(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    fn root_context(&self) -> TaskContext {
        TaskContext::new(Arc::new(self.clone()), None, Arc::new(Parker::new()))
    }

    fn suspend(&self, cx: &TaskContext) -> Result<(), Signal> {
        if cx.in_task() {
            self.mark_blocked();
            cx.parker().park();
            self.mark_unblocked();
        } else {
            cx.parker().park();
        }
        Ok(())
    }

    fn resumer(&self, cx: &TaskContext) -> Resumer {
        let parker = cx.parker().clone();
        Arc::new(move || parker.unpark())
    }

    fn yield_now(&self, cx: &TaskContext) -> Result<(), Signal> {
        if !cx.in_task() {
            return Err(ConcError::OutsideTask("proc_yield").into());
        }
        thread::yield_now();
        Ok(())
    }

    fn drive(&self, _handle: &TaskHandle) {}

    fn next_fairness_index(&self) -> usize {
        self.shared.fairness.fetch_add(1, Ordering::Relaxed)
    }

    /// Timer threads unpark their waiter directly; a blocked task stays
    /// counted in `blocked`, so nothing here needs the count.
    fn external_wait(&self) -> ExternalWait {
        ExternalWait::untracked()
    }
}

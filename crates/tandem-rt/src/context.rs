// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution context threaded through every blocking operation.
//!
//! A `TaskContext` names the executor, the task being run (none for the
//! root context), and the memo of in-flight waits.
//!
//! Cooperative bodies are re-invoked from the top after a suspend. Two
//! records make that safe:
//! - the journal holds the result of every suspension point the body has
//!   already passed, in call order, and replays them on re-invocation so
//!   no completed operation runs twice;
//! - the pending memo lets the operation that suspended (a send, a lock,
//!   an await) pick up its in-flight wait instead of starting over.
//!
//! Host code with its own side effects between suspension points wraps
//! them in `TaskContext::run_once`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{ConcError, Signal};
use crate::executor::Executor;
use crate::select::AwaitSite;
use crate::task::{Outcome, TaskHandle};

/// Capability that makes a waiting context runnable again.
pub type Resumer = Arc<dyn Fn() + Send + Sync>;

/// One-permit park/unpark cell.
#[derive(Debug, Default)]
pub struct Parker {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unpark(&self) {
        *self.notified.lock() = true;
        self.cv.notify_all();
    }

    /// Block until unparked, consuming the permit.
    pub fn park(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.cv.wait(&mut notified);
        }
        *notified = false;
    }

    /// Block until unparked or `timeout` elapses. True if a permit was consumed.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let mut notified = self.notified.lock();
        if !*notified {
            self.cv.wait_for(&mut notified, timeout);
        }
        std::mem::replace(&mut *notified, false)
    }

    /// Consume a pending permit without blocking.
    pub fn try_consume(&self) -> bool {
        std::mem::replace(&mut *self.notified.lock(), false)
    }
}

/// Key of an in-flight wait remembered across re-invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKey {
    Send(u64),
    Recv(u64),
    Lock(u64),
    Join(u64),
    Await(AwaitSite),
}

type Memo = Arc<dyn Any + Send + Sync>;

enum Entry {
    /// Started in an earlier invocation and suspended before finishing.
    Open,
    Done(Memo),
}

/// Results of the suspension points a re-invoked body has already passed.
#[derive(Default)]
struct Journal {
    entries: Vec<Entry>,
    /// Position of the next suspension point in the current invocation.
    cursor: usize,
}

struct JoinMemo {
    awaiter: Option<u64>,
}

struct ContextInner {
    executor: Arc<dyn Executor>,
    task: Option<TaskHandle>,
    parker: Arc<Parker>,
    journal: Option<Mutex<Journal>>,
    pending: Mutex<HashMap<PendingKey, Memo>>,
}

/// The current execution context: a task, or the root caller outside any task.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub(crate) fn new(
        executor: Arc<dyn Executor>,
        task: Option<TaskHandle>,
        parker: Arc<Parker>,
    ) -> Self {
        Self::build(executor, task, parker, None)
    }

    /// Context for a body that is re-invoked after every suspend.
    pub(crate) fn replaying(
        executor: Arc<dyn Executor>,
        task: TaskHandle,
        parker: Arc<Parker>,
    ) -> Self {
        Self::build(executor, Some(task), parker, Some(Mutex::default()))
    }

    fn build(
        executor: Arc<dyn Executor>,
        task: Option<TaskHandle>,
        parker: Arc<Parker>,
        journal: Option<Mutex<Journal>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                executor,
                task,
                parker,
                journal,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    pub fn task(&self) -> Option<&TaskHandle> {
        self.inner.task.as_ref()
    }

    pub fn task_id(&self) -> Option<u64> {
        self.inner.task.as_ref().map(TaskHandle::id)
    }

    pub fn in_task(&self) -> bool {
        self.inner.task.is_some()
    }

    pub(crate) fn parker(&self) -> &Arc<Parker> {
        &self.inner.parker
    }

    /// True once the running task has been asked to cancel. Always false at root.
    pub fn cancel_requested(&self) -> bool {
        self.inner
            .task
            .as_ref()
            .is_some_and(TaskHandle::is_cancel_requested)
    }

    /// Cancellation query for language code; only meaningful inside a task.
    pub fn is_cancelled(&self) -> Result<bool, ConcError> {
        match &self.inner.task {
            Some(task) => Ok(task.is_cancel_requested()),
            None => Err(ConcError::OutsideTask("proc_cancelled")),
        }
    }

    pub fn resumer(&self) -> Resumer {
        self.inner.executor.resumer(self)
    }

    /// Wait until resumed. Cooperative task contexts return `Signal::Yield`.
    pub fn suspend(&self) -> Result<(), Signal> {
        self.inner.executor.suspend(self)
    }

    pub fn yield_now(&self) -> Result<(), Signal> {
        self.inner.executor.yield_now(self)
    }

    pub fn flush(&self) -> Result<(), Signal> {
        self.inner.executor.flush(self)
    }

    /// Rewind the journal before the body is invoked again.
    pub(crate) fn begin_invocation(&self) {
        if let Some(journal) = &self.inner.journal {
            journal.lock().cursor = 0;
        }
    }

    /// Run `op` as one suspension point of the current body.
    ///
    /// On a replaying context a point that completed in an earlier
    /// invocation returns its recorded result without running `op`. `op`
    /// receives `true` when it suspended in an earlier invocation and is
    /// now being resumed. A `Signal::Yield` result is not recorded.
    pub(crate) fn journaled<T, F>(&self, op: F) -> Result<T, Signal>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(bool) -> Result<T, Signal>,
    {
        self.record(op, |result| matches!(result, Err(Signal::Yield)))
    }

    /// Run a host side effect at most once per task, even when the body is
    /// re-invoked after a suspend. Later invocations get the first result.
    ///
    /// Outside the cooperative executor this simply calls `f`.
    pub fn run_once<T, F>(&self, f: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.record(|_| f(), |_| false)
    }

    fn record<R, F, S>(&self, op: F, suspended: S) -> R
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce(bool) -> R,
        S: Fn(&R) -> bool,
    {
        let Some(journal) = &self.inner.journal else {
            return op(false);
        };
        let (pos, resumed) = {
            let mut j = journal.lock();
            let pos = j.cursor;
            j.cursor += 1;
            let (recorded, resumed) = match j.entries.get(pos) {
                Some(Entry::Done(memo)) => (Some(memo.clone()), false),
                Some(Entry::Open) => (None, true),
                None => {
                    j.entries.push(Entry::Open);
                    (None, false)
                }
            };
            if let Some(memo) = recorded {
                match memo.downcast::<R>() {
                    Ok(result) => return (*result).clone(),
                    Err(_) => {
                        tracing::warn!(
                            task_id = ?self.task_id(),
                            pos,
                            "replay diverged, rerunning"
                        );
                        j.entries.truncate(pos);
                        j.entries.push(Entry::Open);
                    }
                }
            }
            (pos, resumed)
        };

        let result = op(resumed);
        if !suspended(&result) {
            let mut j = journal.lock();
            // Points nested inside this one replay through it from now on.
            j.entries.truncate(pos + 1);
            if let Some(entry) = j.entries.get_mut(pos) {
                *entry = Entry::Done(Arc::new(result.clone()));
            }
            j.cursor = pos + 1;
        }
        result
    }

    pub(crate) fn stash<T: Any + Send + Sync>(&self, key: PendingKey, memo: Arc<T>) {
        self.inner.pending.lock().insert(key, memo);
    }

    pub(crate) fn stashed<T: Any + Send + Sync>(&self, key: PendingKey) -> Option<Arc<T>> {
        let memo = self.inner.pending.lock().get(&key).cloned()?;
        memo.downcast::<T>().ok()
    }

    pub(crate) fn unstash(&self, key: PendingKey) {
        self.inner.pending.lock().remove(&key);
    }

    /// Wait for `handle` to finish and return its outcome.
    ///
    /// Cooperative executors drive the target first. Inside a cooperative
    /// task this may return `Signal::Yield`; the caller re-enters later.
    pub fn wait_for(&self, handle: &TaskHandle) -> Result<Outcome, Signal> {
        if self.task_id() == Some(handle.id()) && handle.is_pending() {
            return Err(ConcError::WouldBlock.into());
        }
        self.journaled(|_| self.join(handle))
    }

    fn join(&self, handle: &TaskHandle) -> Result<Outcome, Signal> {
        let key = PendingKey::Join(handle.id());
        loop {
            let outcome = handle.snapshot();
            if outcome.status().is_terminal() {
                self.unstash(key);
                return Ok(outcome);
            }
            self.inner.executor.drive(handle);
            if !handle.is_pending() {
                continue;
            }
            if self.cancel_requested() {
                if let Some(memo) = self.stashed::<JoinMemo>(key) {
                    if let Some(id) = memo.awaiter {
                        handle.remove_awaiter(id);
                    }
                }
                self.unstash(key);
                return Err(Signal::Cancelled(None));
            }
            if self.stashed::<JoinMemo>(key).is_none() {
                let resume = self.resumer();
                let awaiter = handle.add_awaiter(move || resume());
                self.stash(key, Arc::new(JoinMemo { awaiter }));
            }
            self.suspend()?;
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("executor", &self.inner.executor.kind())
            .field("task", &self.task_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parker_permit_survives_early_unpark() {
        let p = Parker::new();
        p.unpark();
        p.park();
        assert!(!p.try_consume());
    }

    #[test]
    fn park_timeout_reports_permit() {
        let p = Parker::new();
        assert!(!p.park_timeout(Duration::from_millis(1)));
        p.unpark();
        assert!(p.park_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn unpark_from_other_thread() {
        let p = Arc::new(Parker::new());
        let p2 = p.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            p2.unpark();
        });
        p.park();
        t.join().unwrap();
    }
}

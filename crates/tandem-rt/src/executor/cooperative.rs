// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deterministic single-queue executor.
//!
//! Tasks run one at a time on whichever thread calls `flush`, `drive` or
//! a blocking read. A body suspends by returning `Signal::Yield`: if it is
//! waiting on something, it stays out of the queue until its resumer fires,
//! otherwise it goes to the back of the queue. The next slice invokes the
//! body from the top with its context journal rewound, so suspension points
//! it already passed replay their results.
//!
//! The runner lock is reentrant so a body may flush or drive other tasks.
//! A task is never queued twice and never runs inside itself.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};

use crate::config::RuntimeConfig;
use crate::context::{Parker, Resumer, TaskContext};
use crate::error::{ConcError, Signal};
use crate::task::{TaskHandle, TaskKind};

use super::{apply_outcome, safe_invoke, Executor, ExecutorKind, ExternalWait, TaskBody};

#[derive(Debug, Default)]
struct TaskFlags {
    queued: bool,
    running: bool,
    /// Suspended and waiting for its resumer.
    blocked: bool,
    /// Resumed while running, before it suspended.
    woken: bool,
}

struct CoopTask {
    handle: TaskHandle,
    cx: TaskContext,
    body: Mutex<TaskBody>,
    flags: Mutex<TaskFlags>,
}

struct CoopShared {
    queue: Mutex<VecDeque<Arc<CoopTask>>>,
    live: Mutex<HashMap<u64, Arc<CoopTask>>>,
    runner: ReentrantMutex<()>,
    depth: AtomicUsize,
    root_parker: Arc<Parker>,
    external: Arc<AtomicUsize>,
    fairness: AtomicUsize,
    root_poll: Duration,
}

/// Executor that interleaves tasks on the caller's thread.
#[derive(Clone)]
pub struct CooperativeExecutor {
    shared: Arc<CoopShared>,
}

impl CooperativeExecutor {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(CoopShared {
                queue: Mutex::new(VecDeque::new()),
                live: Mutex::new(HashMap::new()),
                runner: ReentrantMutex::new(()),
                depth: AtomicUsize::new(0),
                root_parker: Arc::new(Parker::new()),
                external: Arc::new(AtomicUsize::new(0)),
                fairness: AtomicUsize::new(0),
                root_poll: Duration::from_millis(config.root_poll_ms.max(1)),
            }),
        }
    }

    /// Nesting depth of `flush` calls currently running.
    pub fn flush_depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    fn enqueue(&self, task: Arc<CoopTask>) {
        self.shared.queue.lock().push_back(task);
        self.shared.root_parker.unpark();
    }

    fn pop(&self) -> Option<Arc<CoopTask>> {
        let task = self.shared.queue.lock().pop_front()?;
        task.flags.lock().queued = false;
        Some(task)
    }

    /// Make a waiting task runnable again.
    fn resume_task(&self, id: u64) {
        let Some(task) = self.shared.live.lock().get(&id).cloned() else {
            return;
        };
        let requeue = {
            let mut flags = task.flags.lock();
            if flags.blocked {
                flags.blocked = false;
                if !flags.running && !flags.queued {
                    flags.queued = true;
                    true
                } else {
                    false
                }
            } else {
                if flags.running {
                    flags.woken = true;
                }
                false
            }
        };
        if requeue {
            tracing::trace!(task_id = id, "task resumed");
            self.enqueue(task);
        } else {
            self.shared.root_parker.unpark();
        }
    }

    /// Run one slice of `task`.
    fn step(&self, task: &Arc<CoopTask>) {
        let _runner = self.shared.runner.lock();
        {
            let mut flags = task.flags.lock();
            if flags.running {
                return;
            }
            flags.running = true;
        }
        if !task.handle.mark_started() {
            self.retire(task);
            return;
        }

        let result = {
            let mut body = task.body.lock();
            task.cx.begin_invocation();
            safe_invoke(&mut body, &task.cx)
        };

        match result {
            Err(Signal::Yield) => {
                let requeue = {
                    let mut flags = task.flags.lock();
                    flags.running = false;
                    flags.woken = false;
                    if flags.blocked || flags.queued {
                        false
                    } else {
                        flags.queued = true;
                        true
                    }
                };
                tracing::trace!(task_id = task.handle.id(), requeue, "task yielded");
                if requeue {
                    self.enqueue(task.clone());
                }
            }
            result => {
                apply_outcome(&task.handle, result);
                self.retire(task);
            }
        }
    }

    fn retire(&self, task: &Arc<CoopTask>) {
        task.flags.lock().running = false;
        self.shared.live.lock().remove(&task.handle.id());
        self.shared.root_parker.unpark();
    }

    /// Wait step for callers outside any task: run something, or sleep
    /// until a resumer or external wake arrives.
    fn suspend_root(&self) -> Result<(), Signal> {
        if self.shared.root_parker.try_consume() {
            return Ok(());
        }
        if let Some(task) = self.pop() {
            self.step(&task);
            return Ok(());
        }
        if self.shared.root_parker.park_timeout(self.shared.root_poll) {
            return Ok(());
        }
        if !self.shared.queue.lock().is_empty() {
            return Ok(());
        }
        if self.shared.external.load(Ordering::Acquire) == 0 {
            tracing::debug!("root wait cannot make progress");
            return Err(ConcError::WouldBlock.into());
        }
        Ok(())
    }
}

impl Default for CooperativeExecutor {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default())
    }
}

impl Executor for CooperativeExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Cooperative
    }

    fn spawn(&self, kind: TaskKind, body: TaskBody) -> TaskHandle {
        let handle = TaskHandle::new(kind);
        let cx = TaskContext::replaying(
            Arc::new(self.clone()),
            handle.clone(),
            Arc::new(Parker::new()),
        );
        let task = Arc::new(CoopTask {
            handle: handle.clone(),
            cx,
            body: Mutex::new(body),
            flags: Mutex::new(TaskFlags {
                queued: true,
                ..TaskFlags::default()
            }),
        });
        self.shared.live.lock().insert(handle.id(), task.clone());

        let weak: Weak<CoopShared> = Arc::downgrade(&self.shared);
        let id = handle.id();
        handle.token().on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                CooperativeExecutor { shared }.resume_task(id);
            }
        });

        tracing::debug!(task_id = id, ?kind, executor = "cooperative", "task spawned");
        self.enqueue(task);
        handle
    }

    fn flush(&self, _cx: &TaskContext) -> Result<(), Signal> {
        let depth = self.shared.depth.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(depth, pending = self.pending_tasks(), "flush begin");
        while let Some(task) = self.pop() {
            self.step(&task);
        }
        self.shared.depth.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(depth, "flush end");
        Ok(())
    }

    fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().len()
    }

    fn root_context(&self) -> TaskContext {
        TaskContext::new(
            Arc::new(self.clone()),
            None,
            self.shared.root_parker.clone(),
        )
    }

    fn suspend(&self, cx: &TaskContext) -> Result<(), Signal> {
        let Some(id) = cx.task_id() else {
            return self.suspend_root();
        };
        let task = self.shared.live.lock().get(&id).cloned();
        if let Some(task) = task {
            let mut flags = task.flags.lock();
            if flags.woken {
                flags.woken = false;
            } else {
                flags.blocked = true;
            }
        }
        Err(Signal::Yield)
    }

    fn resumer(&self, cx: &TaskContext) -> Resumer {
        match cx.task_id() {
            Some(id) => {
                let weak = Arc::downgrade(&self.shared);
                Arc::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        CooperativeExecutor { shared }.resume_task(id);
                    }
                })
            }
            None => {
                let parker = self.shared.root_parker.clone();
                Arc::new(move || parker.unpark())
            }
        }
    }

    fn yield_now(&self, cx: &TaskContext) -> Result<(), Signal> {
        if !cx.in_task() {
            return Err(ConcError::OutsideTask("proc_yield").into());
        }
        cx.journaled(|resumed| {
            if resumed {
                Ok(())
            } else {
                Err(Signal::Yield)
            }
        })
    }

    fn drive(&self, handle: &TaskHandle) {
        loop {
            if !handle.is_pending() {
                return;
            }
            let Some(task) = self.shared.live.lock().get(&handle.id()).cloned() else {
                return;
            };
            {
                let mut flags = task.flags.lock();
                if flags.running || flags.blocked {
                    return;
                }
                if flags.queued {
                    self.shared
                        .queue
                        .lock()
                        .retain(|queued| !Arc::ptr_eq(queued, &task));
                    flags.queued = false;
                }
            }
            self.step(&task);
            // Give the rest of the queue a turn so a target that spins on
            // another task still makes progress.
            if handle.is_pending() {
                if let Some(other) = self.pop() {
                    self.step(&other);
                }
            }
        }
    }

    fn next_fairness_index(&self) -> usize {
        self.shared.fairness.fetch_add(1, Ordering::Relaxed)
    }

    fn external_wait(&self) -> ExternalWait {
        ExternalWait::new(self.shared.external.clone())
    }
}

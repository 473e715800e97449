// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task-owned mutex.
//!
//! Ownership passes directly from the unlocking task to the first queued
//! waiter, so waiters are served in arrival order. Lock arms only fire
//! when the mutex actually becomes free.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::awaitable::{run_callback, Awaitable, Registration, Waker};
use crate::context::{PendingKey, Resumer, TaskContext};
use crate::error::{ConcError, Signal};
use crate::value::{Callable, Value};

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

struct LockWaiter {
    owner: Option<u64>,
    granted: AtomicBool,
    resume: Resumer,
}

#[derive(Default)]
struct MutexState {
    locked: bool,
    /// Task id of the holder; `None` for the root context.
    owner: Option<u64>,
    waiters: VecDeque<Arc<LockWaiter>>,
    awaiters: IndexMap<u64, Registration>,
    next_awaiter: u64,
}

impl MutexState {
    /// Pass the lock to the next waiter or free it.
    fn release(&mut self) -> (Option<Resumer>, Vec<Registration>) {
        match self.waiters.pop_front() {
            Some(next) => {
                self.owner = next.owner;
                next.granted.store(true, Ordering::Release);
                (Some(next.resume.clone()), Vec::new())
            }
            None => {
                self.locked = false;
                self.owner = None;
                let awaiters = self.awaiters.drain(..).map(|(_, reg)| reg).collect();
                (None, awaiters)
            }
        }
    }
}

fn wake(resume: Option<Resumer>, awaiters: Vec<Registration>) {
    if let Some(resume) = resume {
        resume();
    }
    for reg in awaiters {
        reg.fire();
    }
}

struct MutexInner {
    id: u64,
    state: Mutex<MutexState>,
}

#[derive(Clone)]
pub struct MutexHandle {
    inner: Arc<MutexInner>,
}

impl MutexHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MutexInner {
                id: NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(MutexState::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &MutexHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().locked
    }

    /// Acquire the lock, waiting behind earlier waiters.
    ///
    /// A task cancelled while queued gives up its place; if ownership was
    /// already handed to it, the lock passes on to the next waiter.
    pub fn lock(&self, cx: &TaskContext) -> Result<(), Signal> {
        cx.journaled(|_| self.acquire(cx))
    }

    fn acquire(&self, cx: &TaskContext) -> Result<(), Signal> {
        let key = PendingKey::Lock(self.inner.id);
        let waiter = match cx.stashed::<LockWaiter>(key) {
            Some(waiter) => waiter,
            None => {
                let resume = cx.resumer();
                let mut state = self.inner.state.lock();
                if !state.locked {
                    state.locked = true;
                    state.owner = cx.task_id();
                    return Ok(());
                }
                let waiter = Arc::new(LockWaiter {
                    owner: cx.task_id(),
                    granted: AtomicBool::new(false),
                    resume,
                });
                state.waiters.push_back(waiter.clone());
                drop(state);
                cx.stash(key, waiter.clone());
                waiter
            }
        };

        loop {
            if cx.cancel_requested() {
                let (resume, awaiters) = {
                    let mut state = self.inner.state.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                    if state.waiters.len() != before {
                        (None, Vec::new())
                    } else {
                        // Ownership was handed over before we noticed; give it back.
                        state.release()
                    }
                };
                cx.unstash(key);
                wake(resume, awaiters);
                return Err(Signal::Cancelled(None));
            }
            if waiter.granted.load(Ordering::Acquire) {
                cx.unstash(key);
                return Ok(());
            }
            cx.suspend()?;
        }
    }

    /// Acquire only if free.
    pub fn try_lock(&self, cx: &TaskContext) -> bool {
        cx.run_once(|| {
            let mut state = self.inner.state.lock();
            if state.locked {
                return false;
            }
            state.locked = true;
            state.owner = cx.task_id();
            true
        })
    }

    /// Release the lock held by the caller.
    pub fn unlock(&self, cx: &TaskContext) -> Result<(), ConcError> {
        cx.run_once(|| self.release(cx))
    }

    fn release(&self, cx: &TaskContext) -> Result<(), ConcError> {
        let (resume, awaiters) = {
            let mut state = self.inner.state.lock();
            if !state.locked {
                return Err(ConcError::MutexUnlocked);
            }
            if state.owner != cx.task_id() {
                return Err(ConcError::MutexNotOwner);
            }
            state.release()
        };
        wake(resume, awaiters);
        Ok(())
    }

    /// Awaitable lock arm; commits by locking, then runs `callback`.
    pub fn lock_arm(&self, callback: Option<Callable>) -> Value {
        Value::Awaitable(Arc::new(LockArm {
            mutex: self.clone(),
            callback,
        }))
    }
}

impl Default for MutexHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MutexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexHandle")
            .field("id", &self.inner.id)
            .field("locked", &self.is_locked())
            .finish()
    }
}

struct LockArm {
    mutex: MutexHandle,
    callback: Option<Callable>,
}

impl Awaitable for LockArm {
    fn is_ready(&self, _cx: &TaskContext) -> Result<bool, Signal> {
        Ok(!self.mutex.is_locked())
    }

    fn register(&self, _cx: &TaskContext, waker: Waker) -> Result<Registration, Signal> {
        let reg = Registration::new(waker);
        let inner = &self.mutex.inner;
        let free = {
            let mut state = inner.state.lock();
            if state.locked {
                let id = state.next_awaiter;
                state.next_awaiter += 1;
                state.awaiters.insert(id, reg.clone());
                let weak: Weak<MutexInner> = Arc::downgrade(inner);
                reg.set_detach(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.state.lock().awaiters.shift_remove(&id);
                    }
                });
                false
            } else {
                true
            }
        };
        if free {
            reg.fire();
        }
        Ok(reg)
    }

    fn commit(&self, cx: &TaskContext) -> Result<Value, Signal> {
        self.mutex.lock(cx)?;
        run_callback(cx, self.callback.as_ref(), &[])
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The awaitable arm protocol.
//!
//! Every `await` arm answers four questions: is it ready now, how to be
//! told when it becomes ready (`register` a waker), how to take it
//! (`commit`), and whether it is the fallback default arm. Channels,
//! mutexes, timers and task handles all adapt to this shape.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{Resumer, TaskContext};
use crate::error::{ConcError, Signal};
use crate::task::TaskHandle;
use crate::value::{Callable, Value};

pub trait Awaitable: Send + Sync {
    fn is_ready(&self, cx: &TaskContext) -> Result<bool, Signal>;

    /// Arrange for `waker` to fire once this arm may have become ready.
    fn register(&self, cx: &TaskContext, waker: Waker) -> Result<Registration, Signal>;

    /// Perform the arm's operation. Called only for the selected arm.
    fn commit(&self, cx: &TaskContext) -> Result<Value, Signal>;

    fn is_default(&self) -> bool {
        false
    }
}

struct WakerInner {
    fired: AtomicBool,
    resume: Resumer,
}

/// Trigger-once wake capability, callable from any thread.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<WakerInner>,
}

impl Waker {
    pub fn new(resume: Resumer) -> Self {
        Self {
            inner: Arc::new(WakerInner {
                fired: AtomicBool::new(false),
                resume,
            }),
        }
    }

    /// Resume the waiting context. Only the first call has an effect.
    pub fn wake(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        (self.inner.resume)();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Waker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").field("fired", &self.is_fired()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegState {
    Armed,
    Fired,
    Cancelled,
}

type Detach = Box<dyn FnOnce() + Send>;

struct RegInner {
    state: RegState,
    waker: Option<Waker>,
    detach: Option<Detach>,
}

/// An outstanding interest in an arm becoming ready.
///
/// `fire` and `cancel` race on the same lock; whichever comes first wins
/// and the other becomes a no-op.
#[derive(Clone)]
pub struct Registration {
    inner: Arc<Mutex<RegInner>>,
}

impl Registration {
    pub fn new(waker: Waker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegInner {
                state: RegState::Armed,
                waker: Some(waker),
                detach: None,
            })),
        }
    }

    /// A registration that never fires, for arms with nothing to wait on.
    pub fn inert() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegInner {
                state: RegState::Cancelled,
                waker: None,
                detach: None,
            })),
        }
    }

    /// Hook run on `cancel` to unlink from the owner's awaiter set.
    pub fn set_detach<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.inner.lock();
            if inner.state == RegState::Armed {
                inner.detach = Some(Box::new(f));
                return;
            }
        }
        f();
    }

    pub fn fire(&self) -> bool {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.state != RegState::Armed {
                return false;
            }
            inner.state = RegState::Fired;
            inner.detach = None;
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    pub fn cancel(&self) -> bool {
        let detach = {
            let mut inner = self.inner.lock();
            if inner.state != RegState::Armed {
                return false;
            }
            inner.state = RegState::Cancelled;
            inner.waker = None;
            inner.detach.take()
        };
        if let Some(detach) = detach {
            detach();
        }
        true
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().state == RegState::Armed
    }

    pub fn ptr_eq(&self, other: &Registration) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// Pass `value` to the arm's callback, if it has one.
pub(crate) fn run_callback(
    cx: &TaskContext,
    callback: Option<&Callable>,
    args: &[Value],
) -> Result<Value, Signal> {
    match callback {
        Some(cb) => cb.call(cx, args),
        None => Ok(args.first().cloned().unwrap_or(Value::Nil)),
    }
}

/// Always-ready fallback arm.
pub struct DefaultArm {
    callback: Option<Callable>,
}

impl DefaultArm {
    pub fn new(callback: Option<Callable>) -> Self {
        Self { callback }
    }
}

impl Awaitable for DefaultArm {
    fn is_ready(&self, _cx: &TaskContext) -> Result<bool, Signal> {
        Ok(true)
    }

    fn register(&self, _cx: &TaskContext, _waker: Waker) -> Result<Registration, Signal> {
        Ok(Registration::inert())
    }

    fn commit(&self, cx: &TaskContext) -> Result<Value, Signal> {
        run_callback(cx, self.callback.as_ref(), &[])
    }

    fn is_default(&self) -> bool {
        true
    }
}

/// Arm that becomes ready when a proc or future finishes; commits to its value.
pub struct TaskArm {
    handle: TaskHandle,
}

impl TaskArm {
    pub fn new(handle: TaskHandle) -> Self {
        Self { handle }
    }

    /// Fire `waker` when the task finishes. Cancelling the registration
    /// unhooks it from the handle.
    fn watch(&self, waker: Waker) -> Registration {
        let reg = Registration::new(waker);
        let on_done = reg.clone();
        let id = self.handle.add_awaiter(move || {
            on_done.fire();
        });
        if let Some(id) = id {
            let weak = self.handle.downgrade();
            reg.set_detach(move || {
                if let Some(handle) = weak.upgrade() {
                    handle.remove_awaiter(id);
                }
            });
        }
        reg
    }
}

impl Awaitable for TaskArm {
    fn is_ready(&self, _cx: &TaskContext) -> Result<bool, Signal> {
        Ok(!self.handle.is_pending())
    }

    fn register(&self, _cx: &TaskContext, waker: Waker) -> Result<Registration, Signal> {
        Ok(self.watch(waker))
    }

    fn commit(&self, cx: &TaskContext) -> Result<Value, Signal> {
        self.handle.value(cx)
    }
}

/// Adapt a value to an arm: awaitables pass through, proc and future
/// handles wait for completion.
pub fn as_awaitable(value: &Value) -> Result<Arc<dyn Awaitable>, ConcError> {
    match value {
        Value::Awaitable(arm) => Ok(arm.clone()),
        Value::Proc(handle) => Ok(Arc::new(TaskArm::new(handle.clone()))),
        Value::Future(future) => Ok(Arc::new(TaskArm::new(future.handle().clone()))),
        other => Err(ConcError::NotAwaitable(other.type_name().to_string())),
    }
}

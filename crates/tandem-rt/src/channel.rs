// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded channels with rendezvous at capacity 0.
//!
//! Blocked senders and receivers park a waiter record in the channel.
//! The peer that unblocks them completes the record under the channel
//! lock and calls its resumer after the lock is released. A blocked
//! sender's value lives only in its record until a receiver claims it,
//! so a rendezvous channel never holds a value at rest.
//!
//! Close is one-time: queued values stay receivable, blocked receivers get
//! nil, blocked and future senders get `ChannelSendOnClosed`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::awaitable::{run_callback, Awaitable, Registration, Waker};
use crate::context::{PendingKey, Resumer, TaskContext};
use crate::error::{ConcError, Signal};
use crate::value::{Callable, Value};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Waiting,
    Delivered,
    Closed,
}

struct WaiterState {
    outcome: WaitOutcome,
    value: Option<Value>,
    resume: Resumer,
}

/// A blocked send or receive.
struct Waiter {
    state: Mutex<WaiterState>,
}

impl Waiter {
    fn new(value: Option<Value>, resume: Resumer) -> Self {
        Self {
            state: Mutex::new(WaiterState {
                outcome: WaitOutcome::Waiting,
                value,
                resume,
            }),
        }
    }

    fn outcome(&self) -> WaitOutcome {
        self.state.lock().outcome
    }

    /// Hand `value` to a blocked receiver.
    fn deliver(&self, value: Value) -> Resumer {
        let mut state = self.state.lock();
        state.outcome = WaitOutcome::Delivered;
        state.value = Some(value);
        state.resume.clone()
    }

    /// Take a blocked sender's value.
    fn claim(&self) -> (Value, Resumer) {
        let mut state = self.state.lock();
        state.outcome = WaitOutcome::Delivered;
        (state.value.take().unwrap_or(Value::Nil), state.resume.clone())
    }

    fn close(&self) -> Resumer {
        let mut state = self.state.lock();
        state.outcome = WaitOutcome::Closed;
        state.resume.clone()
    }

    fn take_value(&self) -> Option<Value> {
        self.state.lock().value.take()
    }
}

#[derive(Default)]
struct Wakeups {
    resumers: Vec<Resumer>,
    registrations: Vec<Registration>,
}

impl Wakeups {
    fn drain(&mut self, awaiters: &mut IndexMap<u64, Registration>) {
        self.registrations.extend(awaiters.drain(..).map(|(_, reg)| reg));
    }

    fn fire(self) {
        for resume in self.resumers {
            resume();
        }
        for reg in self.registrations {
            reg.fire();
        }
    }
}

#[derive(Default)]
struct ChanState {
    queue: VecDeque<Value>,
    closed: bool,
    senders: VecDeque<Arc<Waiter>>,
    receivers: VecDeque<Arc<Waiter>>,
    send_awaiters: IndexMap<u64, Registration>,
    recv_awaiters: IndexMap<u64, Registration>,
    next_awaiter: u64,
}

struct ChannelInner {
    id: u64,
    capacity: usize,
    state: Mutex<ChanState>,
}

impl ChannelInner {
    fn recv_ready(&self, st: &ChanState) -> bool {
        !st.queue.is_empty()
            || (self.capacity == 0 && (!st.senders.is_empty() || !st.send_awaiters.is_empty()))
            || st.closed
    }

    fn send_ready(&self, st: &ChanState) -> Result<bool, ConcError> {
        if st.closed {
            return Err(ConcError::ChannelSendOnClosed);
        }
        Ok(if self.capacity == 0 {
            !st.receivers.is_empty() || !st.recv_awaiters.is_empty()
        } else {
            st.queue.len() < self.capacity
        })
    }

    /// Pop the next buffered value, refilling from the first blocked sender.
    fn pop_buffered(&self, st: &mut ChanState, wake: &mut Wakeups) -> Option<Value> {
        let value = st.queue.pop_front()?;
        match st.senders.pop_front() {
            Some(sender) => {
                let (moved, resume) = sender.claim();
                st.queue.push_back(moved);
                wake.resumers.push(resume);
            }
            None => wake.drain(&mut st.send_awaiters),
        }
        Some(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Recv,
}

/// Handle to a channel, or the nil channel.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Option<Arc<ChannelInner>>,
}

impl ChannelHandle {
    pub fn new(capacity: usize) -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(channel_id = id, capacity, "channel created");
        Self {
            inner: Some(Arc::new(ChannelInner {
                id,
                capacity,
                state: Mutex::new(ChanState::default()),
            })),
        }
    }

    /// Create from a language integer capacity.
    pub fn with_capacity(capacity: i64) -> Result<Self, ConcError> {
        usize::try_from(capacity)
            .map(Self::new)
            .map_err(|_| ConcError::NegativeCapacity(capacity))
    }

    /// The nil channel: blocks forever inside a task, errors outside.
    pub fn nil() -> Self {
        Self { inner: None }
    }

    pub fn is_nil(&self) -> bool {
        self.inner.is_none()
    }

    pub fn id(&self) -> Option<u64> {
        self.inner.as_ref().map(|inner| inner.id)
    }

    pub fn capacity(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.capacity)
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.state.lock().queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.state.lock().closed)
    }

    pub fn ptr_eq(&self, other: &ChannelHandle) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Send `value`, waiting while the channel has no room (or, at capacity
    /// 0, no receiver).
    pub fn send(&self, cx: &TaskContext, value: Value) -> Result<(), Signal> {
        cx.journaled(|_| self.send_now(cx, value))
    }

    fn send_now(&self, cx: &TaskContext, value: Value) -> Result<(), Signal> {
        let Some(inner) = &self.inner else {
            return nil_block(cx).map(|_| ());
        };
        let key = PendingKey::Send(inner.id);
        let waiter = match cx.stashed::<Waiter>(key) {
            Some(waiter) => waiter,
            None => {
                let resume = cx.resumer();
                let mut wake = Wakeups::default();
                let parked = {
                    let mut st = inner.state.lock();
                    if st.closed {
                        return Err(ConcError::ChannelSendOnClosed.into());
                    }
                    if let Some(receiver) = st.receivers.pop_front() {
                        wake.resumers.push(receiver.deliver(value));
                        None
                    } else if inner.capacity > 0 && st.queue.len() < inner.capacity {
                        st.queue.push_back(value);
                        wake.drain(&mut st.recv_awaiters);
                        None
                    } else {
                        let waiter = Arc::new(Waiter::new(Some(value), resume));
                        st.senders.push_back(waiter.clone());
                        wake.drain(&mut st.recv_awaiters);
                        Some(waiter)
                    }
                };
                wake.fire();
                match parked {
                    None => return Ok(()),
                    Some(waiter) => {
                        cx.stash(key, waiter.clone());
                        waiter
                    }
                }
            }
        };
        match wait(cx, inner, key, &waiter, Direction::Send)? {
            WaitOutcome::Closed => Err(ConcError::ChannelSendOnClosed.into()),
            _ => Ok(()),
        }
    }

    /// Receive the next value, waiting while none is available. Returns nil
    /// once the channel is closed and drained.
    pub fn receive(&self, cx: &TaskContext) -> Result<Value, Signal> {
        cx.journaled(|_| self.receive_now(cx))
    }

    fn receive_now(&self, cx: &TaskContext) -> Result<Value, Signal> {
        let Some(inner) = &self.inner else {
            return nil_block(cx);
        };
        let key = PendingKey::Recv(inner.id);
        let waiter = match cx.stashed::<Waiter>(key) {
            Some(waiter) => waiter,
            None => {
                let resume = cx.resumer();
                let mut wake = Wakeups::default();
                let taken = {
                    let mut st = inner.state.lock();
                    if let Some(value) = inner.pop_buffered(&mut st, &mut wake) {
                        Ok(value)
                    } else if let Some(sender) = st.senders.pop_front() {
                        let (value, resume) = sender.claim();
                        wake.resumers.push(resume);
                        Ok(value)
                    } else if st.closed {
                        Ok(Value::Nil)
                    } else {
                        let waiter = Arc::new(Waiter::new(None, resume));
                        st.receivers.push_back(waiter.clone());
                        if inner.capacity == 0 {
                            wake.drain(&mut st.send_awaiters);
                        }
                        Err(waiter)
                    }
                };
                wake.fire();
                match taken {
                    Ok(value) => return Ok(value),
                    Err(waiter) => {
                        cx.stash(key, waiter.clone());
                        waiter
                    }
                }
            }
        };
        wait(cx, inner, key, &waiter, Direction::Recv)?;
        Ok(waiter.take_value().unwrap_or(Value::Nil))
    }

    /// Send without waiting. False when the value could not be placed.
    pub fn try_send(&self, value: Value) -> Result<bool, ConcError> {
        let Some(inner) = &self.inner else {
            return Ok(false);
        };
        let mut wake = Wakeups::default();
        let sent = {
            let mut st = inner.state.lock();
            if st.closed {
                return Err(ConcError::ChannelSendOnClosed);
            }
            if let Some(receiver) = st.receivers.pop_front() {
                wake.resumers.push(receiver.deliver(value));
                true
            } else if inner.capacity > 0 && st.queue.len() < inner.capacity {
                st.queue.push_back(value);
                wake.drain(&mut st.recv_awaiters);
                true
            } else {
                false
            }
        };
        wake.fire();
        Ok(sent)
    }

    /// Receive without waiting; nil when nothing is available.
    pub fn try_receive(&self) -> Value {
        let Some(inner) = &self.inner else {
            return Value::Nil;
        };
        let mut wake = Wakeups::default();
        let value = {
            let mut st = inner.state.lock();
            if let Some(value) = inner.pop_buffered(&mut st, &mut wake) {
                value
            } else if let Some(sender) = st.senders.pop_front() {
                let (value, resume) = sender.claim();
                wake.resumers.push(resume);
                value
            } else {
                Value::Nil
            }
        };
        wake.fire();
        value
    }

    pub fn close(&self) -> Result<(), ConcError> {
        let Some(inner) = &self.inner else {
            return Err(ConcError::NilChannel);
        };
        let mut wake = Wakeups::default();
        {
            let mut st = inner.state.lock();
            if st.closed {
                return Err(ConcError::ChannelClosed);
            }
            st.closed = true;
            let st = &mut *st;
            for waiter in st.senders.drain(..).chain(st.receivers.drain(..)) {
                wake.resumers.push(waiter.close());
            }
            wake.drain(&mut st.send_awaiters);
            wake.drain(&mut st.recv_awaiters);
        }
        tracing::debug!(
            channel_id = inner.id,
            woken = wake.resumers.len() + wake.registrations.len(),
            "channel closed"
        );
        wake.fire();
        Ok(())
    }

    /// Awaitable receive arm; commits by receiving and passing the value to
    /// `callback`.
    pub fn recv_arm(&self, callback: Option<Callable>) -> Value {
        Value::Awaitable(Arc::new(RecvArm {
            channel: self.clone(),
            callback,
        }))
    }

    /// Awaitable send arm for `value`.
    pub fn send_arm(&self, value: Value, callback: Option<Callable>) -> Value {
        Value::Awaitable(Arc::new(SendArm {
            channel: self.clone(),
            value,
            callback,
        }))
    }

    fn register(&self, waker: Waker, direction: Direction) -> Result<Registration, Signal> {
        let reg = Registration::new(waker);
        let Some(inner) = &self.inner else {
            return Ok(reg);
        };
        let ready = {
            let mut st = inner.state.lock();
            let ready = match direction {
                Direction::Recv => inner.recv_ready(&st),
                Direction::Send => inner.send_ready(&st).unwrap_or(true),
            };
            if !ready {
                let id = st.next_awaiter;
                st.next_awaiter += 1;
                match direction {
                    Direction::Recv => st.recv_awaiters.insert(id, reg.clone()),
                    Direction::Send => st.send_awaiters.insert(id, reg.clone()),
                };
                let weak: Weak<ChannelInner> = Arc::downgrade(inner);
                reg.set_detach(move || {
                    if let Some(inner) = weak.upgrade() {
                        let mut st = inner.state.lock();
                        match direction {
                            Direction::Recv => st.recv_awaiters.shift_remove(&id),
                            Direction::Send => st.send_awaiters.shift_remove(&id),
                        };
                    }
                });
            }
            ready
        };
        if ready {
            reg.fire();
        }
        Ok(reg)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("ChannelHandle")
                .field("id", &inner.id)
                .field("capacity", &inner.capacity)
                .finish(),
            None => write!(f, "ChannelHandle(nil)"),
        }
    }
}

/// Wait on a parked send or receive until it completes, the channel closes,
/// or the task is cancelled.
fn wait(
    cx: &TaskContext,
    inner: &ChannelInner,
    key: PendingKey,
    waiter: &Arc<Waiter>,
    direction: Direction,
) -> Result<WaitOutcome, Signal> {
    loop {
        match waiter.outcome() {
            WaitOutcome::Waiting => {}
            done => {
                cx.unstash(key);
                return Ok(done);
            }
        }
        if cx.cancel_requested() {
            let removed = {
                let mut st = inner.state.lock();
                let list = match direction {
                    Direction::Send => &mut st.senders,
                    Direction::Recv => &mut st.receivers,
                };
                let before = list.len();
                list.retain(|w| !Arc::ptr_eq(w, waiter));
                before != list.len()
            };
            // Not in the list means a peer completed it first.
            if removed {
                cx.unstash(key);
                return Err(Signal::Cancelled(None));
            }
            continue;
        }
        cx.suspend()?;
    }
}

/// Operations on the nil channel: block until cancelled inside a task.
fn nil_block(cx: &TaskContext) -> Result<Value, Signal> {
    if !cx.in_task() {
        return Err(ConcError::NilChannel.into());
    }
    loop {
        if cx.cancel_requested() {
            return Err(Signal::Cancelled(None));
        }
        cx.suspend()?;
    }
}

struct RecvArm {
    channel: ChannelHandle,
    callback: Option<Callable>,
}

impl Awaitable for RecvArm {
    fn is_ready(&self, _cx: &TaskContext) -> Result<bool, Signal> {
        Ok(match &self.channel.inner {
            Some(inner) => inner.recv_ready(&inner.state.lock()),
            None => false,
        })
    }

    fn register(&self, _cx: &TaskContext, waker: Waker) -> Result<Registration, Signal> {
        self.channel.register(waker, Direction::Recv)
    }

    fn commit(&self, cx: &TaskContext) -> Result<Value, Signal> {
        let value = self.channel.receive(cx)?;
        run_callback(cx, self.callback.as_ref(), &[value])
    }
}

struct SendArm {
    channel: ChannelHandle,
    value: Value,
    callback: Option<Callable>,
}

impl Awaitable for SendArm {
    fn is_ready(&self, _cx: &TaskContext) -> Result<bool, Signal> {
        match &self.channel.inner {
            Some(inner) => Ok(inner.send_ready(&inner.state.lock())?),
            None => Ok(false),
        }
    }

    fn register(&self, _cx: &TaskContext, waker: Waker) -> Result<Registration, Signal> {
        self.channel.register(waker, Direction::Send)
    }

    fn commit(&self, cx: &TaskContext) -> Result<Value, Signal> {
        self.channel.send(cx, self.value.clone())?;
        run_callback(cx, self.callback.as_ref(), &[])
    }
}

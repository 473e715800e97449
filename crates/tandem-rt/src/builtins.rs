// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Native capability surface exposed to language code.
//!
//! Free functions are dispatched by name through `call_native`; methods on
//! handles, awaitables, wakers and registrations through `call_method`.
//! Natives that create or mutate something run once per task, so a
//! cooperative re-invocation of the calling body does not repeat them.

use std::sync::Arc;

use crate::awaitable::{Awaitable, DefaultArm, TaskArm, Waker};
use crate::channel::ChannelHandle;
use crate::context::TaskContext;
use crate::error::{ConcError, Signal};
use crate::executor::TaskBody;
use crate::mutex::MutexHandle;
use crate::runtime::Runtime;
use crate::task::TaskHandle;
use crate::value::{Callable, Value};

/// Names accepted by `call_native`.
pub const NATIVES: &[&str] = &[
    "spawn_proc",
    "spawn_future",
    "proc_yield",
    "proc_cancelled",
    "proc_flush",
    "proc_pending_tasks",
    "channel_new",
    "channel_send",
    "channel_receive",
    "channel_try_send",
    "channel_try_receive",
    "channel_close",
    "channel_is_closed",
    "channel_await_recv",
    "channel_await_send",
    "mutex_new",
    "mutex_lock",
    "mutex_unlock",
    "mutex_await_lock",
    "await_default",
    "await_sleep_ms",
];

fn arity(args: &[Value], min: usize, max: usize) -> Result<(), ConcError> {
    if args.len() < min || args.len() > max {
        let expected = if args.len() < min { min } else { max };
        return Err(ConcError::ArityMismatch {
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn callable_arg(native: &str, value: &Value) -> Result<Callable, ConcError> {
    match value {
        Value::Callable(c) => Ok(c.clone()),
        other => Err(ConcError::TypeError(format!(
            "{} expects a function, got {}",
            native,
            other.type_name()
        ))),
    }
}

/// Optional trailing callback: absent or nil means none.
fn callback_arg(native: &str, value: Option<&Value>) -> Result<Option<Callable>, ConcError> {
    match value {
        None | Some(Value::Nil) => Ok(None),
        Some(v) => callable_arg(native, v).map(Some),
    }
}

fn channel_arg(native: &str, value: &Value) -> Result<ChannelHandle, ConcError> {
    match value {
        Value::Channel(ch) => Ok(ch.clone()),
        Value::Nil => Ok(ChannelHandle::nil()),
        other => Err(ConcError::TypeError(format!(
            "{} expects a channel, got {}",
            native,
            other.type_name()
        ))),
    }
}

fn mutex_arg(native: &str, value: &Value) -> Result<MutexHandle, ConcError> {
    match value {
        Value::Mutex(m) => Ok(m.clone()),
        other => Err(ConcError::TypeError(format!(
            "{} expects a mutex, got {}",
            native,
            other.type_name()
        ))),
    }
}

fn waker_arg(value: Option<&Value>) -> Result<Waker, ConcError> {
    match value {
        Some(Value::Waker(w)) => Ok(w.clone()),
        _ => Err(ConcError::MissingWaker),
    }
}

fn callable_body(callable: Callable) -> TaskBody {
    Box::new(move |cx: &TaskContext| callable.call(cx, &[]))
}

/// Call a native function by name.
pub fn call_native(
    rt: &Runtime,
    cx: &TaskContext,
    name: &str,
    args: &[Value],
) -> Result<Value, Signal> {
    match name {
        "spawn_proc" => {
            arity(args, 1, 1)?;
            let body = callable_body(callable_arg(name, &args[0])?);
            Ok(cx.run_once(|| Value::Proc(cx.executor().run_proc(body))))
        }
        "spawn_future" => {
            arity(args, 1, 1)?;
            let body = callable_body(callable_arg(name, &args[0])?);
            Ok(cx.run_once(|| Value::Future(cx.executor().run_future(body))))
        }
        "proc_yield" => {
            arity(args, 0, 0)?;
            cx.yield_now()?;
            Ok(Value::Nil)
        }
        "proc_cancelled" => {
            arity(args, 0, 0)?;
            Ok(Value::Bool(cx.is_cancelled()?))
        }
        "proc_flush" => {
            arity(args, 0, 0)?;
            cx.flush()?;
            Ok(Value::Nil)
        }
        "proc_pending_tasks" => {
            arity(args, 0, 0)?;
            Ok(Value::Int(cx.executor().pending_tasks() as i64))
        }
        "channel_new" => {
            arity(args, 1, 1)?;
            let capacity = args[0].as_int().ok_or_else(|| {
                ConcError::TypeError(format!(
                    "channel capacity must be an integer, got {}",
                    args[0].type_name()
                ))
            })?;
            let ch = cx.run_once(|| ChannelHandle::with_capacity(capacity))?;
            Ok(Value::Channel(ch))
        }
        "channel_send" => {
            arity(args, 2, 2)?;
            channel_arg(name, &args[0])?.send(cx, args[1].clone())?;
            Ok(Value::Nil)
        }
        "channel_receive" => {
            arity(args, 1, 1)?;
            channel_arg(name, &args[0])?.receive(cx)
        }
        "channel_try_send" => {
            arity(args, 2, 2)?;
            let ch = channel_arg(name, &args[0])?;
            Ok(Value::Bool(cx.run_once(|| ch.try_send(args[1].clone()))?))
        }
        "channel_try_receive" => {
            arity(args, 1, 1)?;
            let ch = channel_arg(name, &args[0])?;
            Ok(cx.run_once(|| ch.try_receive()))
        }
        "channel_close" => {
            arity(args, 1, 1)?;
            let ch = channel_arg(name, &args[0])?;
            cx.run_once(|| ch.close())?;
            Ok(Value::Nil)
        }
        "channel_is_closed" => {
            arity(args, 1, 1)?;
            Ok(Value::Bool(channel_arg(name, &args[0])?.is_closed()))
        }
        "channel_await_recv" => {
            arity(args, 1, 2)?;
            let ch = channel_arg(name, &args[0])?;
            Ok(ch.recv_arm(callback_arg(name, args.get(1))?))
        }
        "channel_await_send" => {
            arity(args, 2, 3)?;
            let ch = channel_arg(name, &args[0])?;
            Ok(ch.send_arm(args[1].clone(), callback_arg(name, args.get(2))?))
        }
        "mutex_new" => {
            arity(args, 0, 0)?;
            Ok(cx.run_once(|| Value::Mutex(MutexHandle::new())))
        }
        "mutex_lock" => {
            arity(args, 1, 1)?;
            mutex_arg(name, &args[0])?.lock(cx)?;
            Ok(Value::Nil)
        }
        "mutex_unlock" => {
            arity(args, 1, 1)?;
            mutex_arg(name, &args[0])?.unlock(cx)?;
            Ok(Value::Nil)
        }
        "mutex_await_lock" => {
            arity(args, 1, 2)?;
            let m = mutex_arg(name, &args[0])?;
            Ok(m.lock_arm(callback_arg(name, args.get(1))?))
        }
        "await_default" => {
            arity(args, 0, 1)?;
            let callback = callback_arg(name, args.first())?;
            Ok(Value::Awaitable(Arc::new(DefaultArm::new(callback))))
        }
        "await_sleep_ms" => {
            arity(args, 1, 2)?;
            let callback = callback_arg(name, args.get(1))?;
            // The deadline is fixed when the arm is first created.
            Ok(cx.run_once(|| rt.sleep_arm(&args[0], callback))?)
        }
        _ => Err(ConcError::UndefinedNative(name.to_string()).into()),
    }
}

/// Call a method on a runtime value.
pub fn call_method(
    cx: &TaskContext,
    receiver: &Value,
    method: &str,
    args: &[Value],
) -> Result<Value, Signal> {
    match receiver {
        Value::Proc(handle) => call_task_method(cx, handle, method, args),
        Value::Future(future) => call_task_method(cx, future.handle(), method, args),
        Value::Awaitable(arm) => call_awaitable_method(cx, arm.as_ref(), method, args),
        Value::Waker(waker) => match method {
            "wake" => {
                arity(args, 0, 0)?;
                Ok(Value::Bool(waker.wake()))
            }
            _ => no_such_method(receiver, method),
        },
        Value::Registration(reg) => match method {
            "cancel" => {
                arity(args, 0, 0)?;
                Ok(Value::Bool(reg.cancel()))
            }
            _ => no_such_method(receiver, method),
        },
        Value::Channel(ch) => call_channel_method(cx, ch, receiver, method, args),
        Value::Mutex(m) => match method {
            "lock" => {
                arity(args, 0, 0)?;
                m.lock(cx)?;
                Ok(Value::Nil)
            }
            "unlock" => {
                arity(args, 0, 0)?;
                m.unlock(cx)?;
                Ok(Value::Nil)
            }
            "try_lock" => {
                arity(args, 0, 0)?;
                Ok(Value::Bool(m.try_lock(cx)))
            }
            "is_locked" => {
                arity(args, 0, 0)?;
                Ok(Value::Bool(m.is_locked()))
            }
            _ => no_such_method(receiver, method),
        },
        _ => no_such_method(receiver, method),
    }
}

fn no_such_method(receiver: &Value, method: &str) -> Result<Value, Signal> {
    Err(ConcError::NoSuchMethod {
        ty: receiver.type_name().to_string(),
        method: method.to_string(),
    }
    .into())
}

fn call_task_method(
    cx: &TaskContext,
    handle: &TaskHandle,
    method: &str,
    args: &[Value],
) -> Result<Value, Signal> {
    match method {
        "status" => {
            arity(args, 0, 0)?;
            Ok(handle.status_value())
        }
        "value" => {
            arity(args, 0, 0)?;
            handle.value(cx)
        }
        "cancel" => {
            arity(args, 0, 0)?;
            handle.request_cancel();
            Ok(Value::Nil)
        }
        _ => call_awaitable_method(cx, &TaskArm::new(handle.clone()), method, args).map_err(
            |sig| match sig {
                Signal::Error(ConcError::NoSuchMethod { method, .. }) => {
                    Signal::Error(ConcError::NoSuchMethod {
                        ty: handle.kind().label().to_string(),
                        method,
                    })
                }
                other => other,
            },
        ),
    }
}

fn call_awaitable_method(
    cx: &TaskContext,
    arm: &dyn Awaitable,
    method: &str,
    args: &[Value],
) -> Result<Value, Signal> {
    match method {
        "is_ready" => {
            arity(args, 0, 0)?;
            Ok(Value::Bool(arm.is_ready(cx)?))
        }
        "register" => {
            arity(args, 0, 1)?;
            let waker = waker_arg(args.first())?;
            Ok(Value::Registration(arm.register(cx, waker)?))
        }
        "commit" => {
            arity(args, 0, 0)?;
            arm.commit(cx)
        }
        "is_default" => {
            arity(args, 0, 0)?;
            Ok(Value::Bool(arm.is_default()))
        }
        _ => Err(ConcError::NoSuchMethod {
            ty: "Awaitable".to_string(),
            method: method.to_string(),
        }
        .into()),
    }
}

fn call_channel_method(
    cx: &TaskContext,
    ch: &ChannelHandle,
    receiver: &Value,
    method: &str,
    args: &[Value],
) -> Result<Value, Signal> {
    match method {
        "send" => {
            arity(args, 1, 1)?;
            ch.send(cx, args[0].clone())?;
            Ok(Value::Nil)
        }
        "receive" => {
            arity(args, 0, 0)?;
            ch.receive(cx)
        }
        "try_send" => {
            arity(args, 1, 1)?;
            Ok(Value::Bool(cx.run_once(|| ch.try_send(args[0].clone()))?))
        }
        "try_receive" => {
            arity(args, 0, 0)?;
            Ok(cx.run_once(|| ch.try_receive()))
        }
        "close" => {
            arity(args, 0, 0)?;
            cx.run_once(|| ch.close())?;
            Ok(Value::Nil)
        }
        "is_closed" => {
            arity(args, 0, 0)?;
            Ok(Value::Bool(ch.is_closed()))
        }
        "len" => {
            arity(args, 0, 0)?;
            Ok(Value::Int(ch.len() as i64))
        }
        "capacity" => {
            arity(args, 0, 0)?;
            Ok(Value::Int(ch.capacity() as i64))
        }
        _ => no_such_method(receiver, method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn native(rt: &Runtime, name: &str, args: &[Value]) -> Result<Value, Signal> {
        call_native(rt, &rt.root_context(), name, args)
    }

    #[test]
    fn every_listed_native_is_dispatched() {
        let rt = Runtime::cooperative();
        for name in NATIVES {
            if let Err(Signal::Error(ConcError::UndefinedNative(n))) = native(&rt, name, &[]) {
                panic!("native {} is listed but not dispatched", n);
            }
        }
        assert!(matches!(
            native(&rt, "proc_sleep", &[]),
            Err(Signal::Error(ConcError::UndefinedNative(_)))
        ));
    }

    #[test]
    fn spawn_and_read_through_methods() {
        let rt = Runtime::cooperative();
        let body = Value::Callable(Callable::new("answer", |_cx, _args| Ok(Value::Int(42))));
        let handle = native(&rt, "spawn_future", &[body]).unwrap();
        assert_eq!(
            native(&rt, "proc_pending_tasks", &[]).unwrap(),
            Value::Int(1)
        );
        let cx = rt.root_context();
        assert_eq!(call_method(&cx, &handle, "value", &[]).unwrap(), Value::Int(42));
        match call_method(&cx, &handle, "status", &[]).unwrap() {
            Value::Status(s) => assert_eq!(s.status, TaskStatus::Resolved),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            call_method(&cx, &handle, "is_ready", &[]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_method(&cx, &handle, "is_default", &[]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn channel_natives_round_trip() {
        let rt = Runtime::cooperative();
        let ch = native(&rt, "channel_new", &[Value::Int(1)]).unwrap();
        assert_eq!(
            native(&rt, "channel_try_send", &[ch.clone(), Value::Int(5)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            native(&rt, "channel_receive", &[ch.clone()]).unwrap(),
            Value::Int(5)
        );
        native(&rt, "channel_close", &[ch.clone()]).unwrap();
        assert_eq!(
            native(&rt, "channel_is_closed", &[ch.clone()]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            native(&rt, "channel_close", &[ch]).unwrap_err().as_error(),
            Some(&ConcError::ChannelClosed)
        );
        assert_eq!(
            native(&rt, "channel_new", &[Value::Int(-2)]).unwrap_err().as_error(),
            Some(&ConcError::NegativeCapacity(-2))
        );
    }

    #[test]
    fn proc_cancelled_outside_task_errors() {
        let rt = Runtime::cooperative();
        assert_eq!(
            native(&rt, "proc_cancelled", &[]).unwrap_err().as_error(),
            Some(&ConcError::OutsideTask("proc_cancelled"))
        );
    }

    #[test]
    fn proc_yield_outside_task_errors() {
        let rt = Runtime::cooperative();
        assert_eq!(
            native(&rt, "proc_yield", &[]).unwrap_err().as_error(),
            Some(&ConcError::OutsideTask("proc_yield"))
        );
    }

    #[test]
    fn natives_in_a_yielding_body_run_once() {
        let rt = Runtime::cooperative();
        let spawned = Arc::new(AtomicUsize::new(0));
        let (inner, count) = (rt.clone(), spawned.clone());
        let body = Callable::new("outer", move |cx, _args| {
            let count = count.clone();
            let child = Callable::new("child", move |_cx, _args| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Nil)
            });
            let ch = call_native(&inner, cx, "channel_new", &[Value::Int(1)])?;
            call_native(&inner, cx, "spawn_proc", &[Value::Callable(child)])?;
            call_native(&inner, cx, "proc_yield", &[])?;
            call_native(&inner, cx, "channel_try_send", &[ch.clone(), Value::Int(1)])?;
            call_native(&inner, cx, "proc_yield", &[])?;
            call_native(&inner, cx, "channel_try_receive", &[ch])
        });
        let outer = native(&rt, "spawn_proc", &[Value::Callable(body)]).unwrap();
        native(&rt, "proc_flush", &[]).unwrap();
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(
            call_method(&rt.root_context(), &outer, "value", &[]).unwrap(),
            Value::Int(1)
        );
    }

    #[test]
    fn register_without_waker_errors() {
        let rt = Runtime::cooperative();
        let arm = native(&rt, "await_default", &[]).unwrap();
        let cx = rt.root_context();
        assert_eq!(
            call_method(&cx, &arm, "register", &[]).unwrap_err().as_error(),
            Some(&ConcError::MissingWaker)
        );
        assert_eq!(
            call_method(&cx, &arm, "is_default", &[]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn unknown_methods_name_the_receiver() {
        let rt = Runtime::cooperative();
        let cx = rt.root_context();
        let m = Value::Mutex(MutexHandle::new());
        assert_eq!(
            call_method(&cx, &m, "frobnicate", &[]).unwrap_err().as_error(),
            Some(&ConcError::NoSuchMethod {
                ty: "Mutex".to_string(),
                method: "frobnicate".to_string(),
            })
        );
        let h = Value::Proc(rt.spawn_proc(|_cx| Ok(Value::Nil)));
        assert_eq!(
            call_method(&cx, &h, "frobnicate", &[]).unwrap_err().as_error(),
            Some(&ConcError::NoSuchMethod {
                ty: "Proc".to_string(),
                method: "frobnicate".to_string(),
            })
        );
    }

    #[test]
    fn arity_is_checked() {
        let rt = Runtime::cooperative();
        assert_eq!(
            native(&rt, "mutex_new", &[Value::Nil]).unwrap_err().as_error(),
            Some(&ConcError::ArityMismatch {
                expected: 0,
                got: 1
            })
        );
    }
}

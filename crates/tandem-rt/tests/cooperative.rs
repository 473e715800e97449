// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scenarios specific to the cooperative executor: everything runs on the
//! test thread, in a deterministic order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tandem_rt::builtins::call_native;
use tandem_rt::{
    await_values, AwaitSite, Callable, ConcError, Runtime, Signal, TaskStatus, Value,
};

#[test]
fn await_receive_meets_send_after_yield() {
    let rt = Runtime::cooperative();
    let ch = rt.channel(0);
    let threads: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    let (rx, seen) = (ch.clone(), threads.clone());
    let site = AwaitSite::new();
    let a = rt.spawn_proc(move |cx| {
        seen.lock().push(thread::current().id());
        await_values(cx, site, vec![rx.recv_arm(None)])
    });

    let (tx, seen) = (ch.clone(), threads.clone());
    let b = rt.spawn_proc(move |cx| {
        seen.lock().push(thread::current().id());
        cx.yield_now()?;
        tx.send(cx, Value::Int(42))?;
        Ok(Value::str("sent"))
    });

    rt.flush().unwrap();
    assert_eq!(a.status(), TaskStatus::Resolved);
    assert_eq!(b.status(), TaskStatus::Resolved);
    assert_eq!(rt.value(&a).unwrap(), Value::Int(42));
    assert_eq!(rt.value(&b).unwrap(), Value::str("sent"));

    let me = thread::current().id();
    assert!(threads.lock().iter().all(|id| *id == me));
}

#[test]
fn cancel_before_start_skips_body() {
    let rt = Runtime::cooperative();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let h = rt.spawn_proc(move |_cx| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Nil)
    });
    h.request_cancel();
    assert_eq!(h.status(), TaskStatus::Cancelled);
    rt.flush().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.status(), TaskStatus::Cancelled);
}

#[test]
fn body_observes_its_own_cancellation() {
    let rt = Runtime::cooperative();
    let exec = rt.clone();
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();
    let h = rt.spawn_proc(move |cx| {
        cx.yield_now()?;
        let cancelled = call_native(&exec, cx, "proc_cancelled", &[])?;
        if cancelled == Value::Bool(true) {
            seen.fetch_add(1, Ordering::SeqCst);
            return Err(Signal::Cancelled(None));
        }
        Ok(Value::Nil)
    });
    // Runs while the first task sits behind its yield.
    let target = h.clone();
    rt.spawn_proc(move |_cx| {
        target.request_cancel();
        Ok(Value::Nil)
    });
    rt.flush().unwrap();
    assert_eq!(h.status(), TaskStatus::Cancelled);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn proc_yield_at_root_is_rejected() {
    let rt = Runtime::cooperative();
    let err = call_native(&rt, &rt.root_context(), "proc_yield", &[]).unwrap_err();
    assert_eq!(err.as_error(), Some(&ConcError::OutsideTask("proc_yield")));
}

#[test]
fn side_effects_between_yields_run_once() {
    let rt = Runtime::cooperative();
    let log = Arc::new(Mutex::new(Vec::new()));
    let trace = log.clone();
    let h = rt.spawn_proc(move |cx| {
        cx.run_once(|| trace.lock().push("start"));
        cx.yield_now()?;
        cx.run_once(|| trace.lock().push("middle"));
        cx.yield_now()?;
        trace.lock().push("end");
        Ok(Value::Int(1))
    });
    assert_eq!(rt.value(&h).unwrap(), Value::Int(1));
    assert_eq!(*log.lock(), vec!["start", "middle", "end"]);
}

#[test]
fn spawned_callable_runs_through_natives() {
    let rt = Runtime::cooperative();
    let cx = rt.root_context();
    let ch = call_native(&rt, &cx, "channel_new", &[Value::Int(1)]).unwrap();

    let tx = ch.clone();
    let inner = rt.clone();
    let body = Callable::new("producer", move |cx, _args| {
        call_native(&inner, cx, "channel_send", &[tx.clone(), Value::Int(9)])?;
        call_native(&inner, cx, "channel_close", &[tx.clone()])
    });
    let proc_value = call_native(&rt, &cx, "spawn_proc", &[Value::Callable(body)]).unwrap();
    assert_eq!(
        call_native(&rt, &cx, "proc_pending_tasks", &[]).unwrap(),
        Value::Int(1)
    );
    call_native(&rt, &cx, "proc_flush", &[]).unwrap();

    assert_eq!(
        call_native(&rt, &cx, "channel_receive", &[ch.clone()]).unwrap(),
        Value::Int(9)
    );
    assert_eq!(
        call_native(&rt, &cx, "channel_try_receive", &[ch.clone()]).unwrap(),
        Value::Nil
    );
    match proc_value {
        Value::Proc(h) => assert_eq!(h.status(), TaskStatus::Resolved),
        other => panic!("expected proc handle, got {:?}", other),
    }
}

#[test]
fn nested_flush_inside_task() {
    let rt = Runtime::cooperative();
    let inner_ran = Arc::new(AtomicUsize::new(0));
    let exec = rt.clone();
    let flag = inner_ran.clone();
    let outer = rt.spawn_proc(move |cx| {
        cx.run_once(|| {
            let flag = flag.clone();
            exec.spawn_proc(move |_cx| {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Nil)
            })
        });
        cx.flush()?;
        Ok(Value::Int(flag.load(Ordering::SeqCst) as i64))
    });
    rt.flush().unwrap();
    assert_eq!(rt.value(&outer).unwrap(), Value::Int(1));
    assert_eq!(inner_ran.load(Ordering::SeqCst), 1);
}

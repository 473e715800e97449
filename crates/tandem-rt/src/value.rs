// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Opaque payload values flowing through tasks, channels and await arms.
//!
//! The execution core never inspects payloads beyond what it needs:
//! handles for dispatch, callables for arm callbacks, errors for failure
//! reporting. Handles compare by identity.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::awaitable::{Awaitable, Registration, Waker};
use crate::channel::ChannelHandle;
use crate::context::TaskContext;
use crate::error::Signal;
use crate::mutex::MutexHandle;
use crate::task::{FutureHandle, TaskHandle, TaskStatus};

/// A host-language callable: evaluates its captured body with arguments.
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    func: Arc<dyn Fn(&TaskContext, &[Value]) -> Result<Value, Signal> + Send + Sync>,
}

impl Callable {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&TaskContext, &[Value]) -> Result<Value, Signal> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, cx: &TaskContext, args: &[Value]) -> Result<Value, Signal> {
        (self.func)(cx, args)
    }

    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}>", self.name)
    }
}

/// Structured error payload: a stable kind, a message, and an optional cause.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    kind: String,
    message: String,
    cause: Option<Value>,
}

impl ErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Value> {
        self.cause.as_ref()
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of `status()` on a proc or future handle.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusValue {
    pub status: TaskStatus,
    /// Failure payload when `status` is Failed or Cancelled.
    pub failure: Option<Value>,
}

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Error(Arc<ErrorValue>),
    Status(Arc<StatusValue>),
    Proc(TaskHandle),
    Future(FutureHandle),
    Channel(ChannelHandle),
    Mutex(MutexHandle),
    Awaitable(Arc<dyn Awaitable>),
    Waker(Waker),
    Registration(Registration),
    Callable(Callable),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn error(err: ErrorValue) -> Self {
        Value::Error(Arc::new(err))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "i64",
            Value::Float(_) => "f64",
            Value::Str(_) => "String",
            Value::List(_) => "Array",
            Value::Error(_) => "Error",
            Value::Status(_) => "ProcStatus",
            Value::Proc(_) => "Proc",
            Value::Future(_) => "Future",
            Value::Channel(_) => "Channel",
            Value::Mutex(_) => "Mutex",
            Value::Awaitable(_) => "Awaitable",
            Value::Waker(_) => "AwaitWaker",
            Value::Registration(_) => "AwaitRegistration",
            Value::Callable(_) => "Function",
            Value::Opaque(_) => "Opaque",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Status(a), Value::Status(b)) => a == b,
            (Value::Proc(a), Value::Proc(b)) => a.ptr_eq(b),
            (Value::Future(a), Value::Future(b)) => a.handle().ptr_eq(b.handle()),
            (Value::Channel(a), Value::Channel(b)) => a.ptr_eq(b),
            (Value::Mutex(a), Value::Mutex(b)) => a.ptr_eq(b),
            (Value::Awaitable(a), Value::Awaitable(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Value::Waker(a), Value::Waker(b)) => a.ptr_eq(b),
            (Value::Registration(a), Value::Registration(b)) => a.ptr_eq(b),
            (Value::Callable(a), Value::Callable(b)) => a.ptr_eq(b),
            (Value::Opaque(a), Value::Opaque(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Error(e) => write!(f, "Error({})", e),
            Value::Status(s) => write!(f, "Status({})", s.status),
            other => write!(f, "{}", other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Error(e) => write!(f, "{}", e.message()),
            Value::Status(s) => write!(f, "{}", s.status),
            Value::Proc(h) => write!(f, "<proc #{}>", h.id()),
            Value::Future(h) => write!(f, "<future #{}>", h.handle().id()),
            Value::Channel(c) => match c.id() {
                Some(id) => write!(f, "<channel #{}>", id),
                None => write!(f, "<nil channel>"),
            },
            Value::Mutex(m) => write!(f, "<mutex #{}>", m.id()),
            Value::Awaitable(_) => write!(f, "<awaitable>"),
            Value::Waker(_) => write!(f, "<waker>"),
            Value::Registration(_) => write!(f, "<registration>"),
            Value::Callable(c) => write!(f, "<fn {}>", c.name()),
            Value::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_compare_by_value() {
        assert_eq!(Value::Int(3), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Float(3.0));
        assert_eq!(Value::str("a"), Value::from("a"));
        assert_eq!(
            Value::list(vec![Value::Nil, Value::Bool(true)]),
            Value::list(vec![Value::Nil, Value::Bool(true)])
        );
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = MutexHandle::new();
        let b = MutexHandle::new();
        assert_eq!(Value::Mutex(a.clone()), Value::Mutex(a));
        assert_ne!(Value::Mutex(b), Value::Mutex(MutexHandle::new()));
    }

    #[test]
    fn error_display_uses_message() {
        let err = ErrorValue::new("ProcError", "Proc failed: boom").with_cause(Value::str("boom"));
        assert_eq!(Value::error(err.clone()).to_string(), "Proc failed: boom");
        assert_eq!(err.to_string(), "ProcError: Proc failed: boom");
        assert_eq!(err.cause(), Some(&Value::str("boom")));
    }
}

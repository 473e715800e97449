// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tandem runtime library: the async execution core of a dynamically typed
//! language.
//!
//! Two executors share one `Executor` interface. The parallel executor runs
//! each task on its own OS thread; the cooperative executor runs tasks one
//! at a time from a FIFO queue, re-invoking a body after it yields.
//!
//! Components:
//! - task: proc and future handles with a single terminal transition
//! - context: the execution context threaded through every operation
//! - executor: parallel and cooperative scheduling
//! - awaitable/select: the `await` arm protocol and evaluator
//! - channel: bounded and rendezvous channels
//! - mutex: task-owned lock
//! - timer: `sleep_ms` arms
//! - builtins: native functions exposed to language code

pub mod awaitable;
pub mod builtins;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod mutex;
pub mod runtime;
pub mod select;
pub mod task;
pub mod timer;
pub mod value;

pub use awaitable::{Awaitable, Registration, Waker};
pub use channel::ChannelHandle;
pub use config::RuntimeConfig;
pub use context::TaskContext;
pub use error::{ConcError, ConfigError, Signal};
pub use executor::{CooperativeExecutor, Executor, ExecutorKind, ParallelExecutor};
pub use mutex::MutexHandle;
pub use runtime::Runtime;
pub use select::{await_arms, await_values, AwaitSite};
pub use task::{FutureHandle, Outcome, TaskHandle, TaskStatus};
pub use value::{Callable, ErrorValue, Value};

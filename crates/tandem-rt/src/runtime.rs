// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime facade: picks an executor from the config and exposes the
//! primitives to callers outside any task.

use std::fmt;
use std::sync::Arc;

use crate::channel::ChannelHandle;
use crate::config::RuntimeConfig;
use crate::context::TaskContext;
use crate::error::{ConcError, ConfigError, Signal};
use crate::executor::{CooperativeExecutor, Executor, ExecutorKind, ParallelExecutor};
use crate::mutex::MutexHandle;
use crate::task::{FutureHandle, Outcome, TaskHandle};
use crate::timer::{sleep_duration, SleepArm};
use crate::value::{Callable, Value};

#[derive(Clone)]
pub struct Runtime {
    executor: Arc<dyn Executor>,
    config: Arc<RuntimeConfig>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let executor: Arc<dyn Executor> = match config.executor {
            ExecutorKind::Parallel => Arc::new(ParallelExecutor::new(&config)),
            ExecutorKind::Cooperative => Arc::new(CooperativeExecutor::new(&config)),
        };
        tracing::debug!(executor = %config.executor, "runtime created");
        Self {
            executor,
            config: Arc::new(config),
        }
    }

    pub fn cooperative() -> Self {
        Self::new(RuntimeConfig::default().with_executor(ExecutorKind::Cooperative))
    }

    pub fn parallel() -> Self {
        Self::new(RuntimeConfig::default().with_executor(ExecutorKind::Parallel))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(RuntimeConfig::from_env()?))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn kind(&self) -> ExecutorKind {
        self.executor.kind()
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn root_context(&self) -> TaskContext {
        self.executor.root_context()
    }

    pub fn spawn_proc<F>(&self, body: F) -> TaskHandle
    where
        F: FnMut(&TaskContext) -> Result<Value, Signal> + Send + 'static,
    {
        self.executor.run_proc(Box::new(body))
    }

    pub fn spawn_future<F>(&self, body: F) -> FutureHandle
    where
        F: FnMut(&TaskContext) -> Result<Value, Signal> + Send + 'static,
    {
        self.executor.run_future(Box::new(body))
    }

    pub fn flush(&self) -> Result<(), Signal> {
        self.executor.flush(&self.root_context())
    }

    pub fn pending_tasks(&self) -> usize {
        self.executor.pending_tasks()
    }

    /// Wait for `handle` from outside any task and return its outcome.
    pub fn wait(&self, handle: &TaskHandle) -> Result<Outcome, Signal> {
        self.root_context().wait_for(handle)
    }

    /// Wait for `handle` and return its result, raising its failure.
    pub fn value(&self, handle: &TaskHandle) -> Result<Value, Signal> {
        handle.value(&self.root_context())
    }

    pub fn channel(&self, capacity: usize) -> ChannelHandle {
        ChannelHandle::new(capacity)
    }

    pub fn mutex(&self) -> MutexHandle {
        MutexHandle::new()
    }

    /// Timer arm for `ms` milliseconds, clamped to the configured maximum.
    pub fn sleep_arm(&self, ms: &Value, callback: Option<Callable>) -> Result<Value, ConcError> {
        let duration = sleep_duration(ms, self.config.max_sleep_ms)?;
        Ok(Value::Awaitable(Arc::new(SleepArm::new(duration, callback))))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("executor", &self.executor.kind())
            .field("pending", &self.executor.pending_tasks())
            .finish()
    }
}

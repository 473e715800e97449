// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Errors and control-flow signals.
//!
//! `ConcError` covers misuse of the primitives (closing a closed channel,
//! unlocking a mutex you don't own). `Signal` is what every suspension
//! point returns: it separates the cooperative yield sentinel and
//! cancellation from values raised by task bodies.

use std::fmt;

use crate::value::{ErrorValue, Value};

/// Programming errors raised by channel, mutex, await and executor operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConcError {
    #[error("send on closed channel")]
    ChannelSendOnClosed,

    #[error("close of closed channel")]
    ChannelClosed,

    #[error("invalid operation on nil channel")]
    NilChannel,

    #[error("unlock of unlocked mutex")]
    MutexUnlocked,

    #[error("unlock of mutex held by another task")]
    MutexNotOwner,

    #[error("operation would block forever; no runnable tasks remain")]
    WouldBlock,

    #[error("`{0}` must be called inside an asynchronous task")]
    OutsideTask(&'static str),

    #[error("register requires a waker")]
    MissingWaker,

    #[error("await requires at least one arm")]
    EmptyAwait,

    #[error("await accepts at most one default arm")]
    MultipleDefaultArms,

    #[error("value of type `{0}` is not awaitable")]
    NotAwaitable(String),

    #[error("channel capacity must be non-negative, got {0}")]
    NegativeCapacity(i64),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("{0}")]
    TypeError(String),

    #[error("expected {expected} argument{}, got {got}", if *.expected == 1 { "" } else { "s" })]
    ArityMismatch { expected: usize, got: usize },

    #[error("no method `{method}` on type `{ty}`")]
    NoSuchMethod { ty: String, method: String },

    #[error("undefined native `{0}`")]
    UndefinedNative(String),
}

impl ConcError {
    /// Stable name surfaced to language code as the error's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ConcError::ChannelSendOnClosed => "ChannelSendOnClosed",
            ConcError::ChannelClosed => "ChannelClosed",
            ConcError::NilChannel => "ChannelNil",
            ConcError::MutexUnlocked => "MutexUnlocked",
            ConcError::MutexNotOwner => "MutexNotOwner",
            ConcError::WouldBlock => "WouldBlock",
            ConcError::OutsideTask(_) => "OutsideTask",
            ConcError::MissingWaker => "MissingWaker",
            ConcError::EmptyAwait => "EmptyAwait",
            ConcError::MultipleDefaultArms => "MultipleDefaultArms",
            ConcError::NotAwaitable(_) => "NotAwaitable",
            ConcError::NegativeCapacity(_) => "NegativeCapacity",
            ConcError::InvalidDuration(_) => "InvalidDuration",
            ConcError::TypeError(_) => "TypeError",
            ConcError::ArityMismatch { .. } => "ArityMismatch",
            ConcError::NoSuchMethod { .. } => "NoSuchMethod",
            ConcError::UndefinedNative(_) => "UndefinedNative",
        }
    }

    /// Convert into a language-level error value.
    pub fn to_value(&self) -> Value {
        Value::error(ErrorValue::new(self.kind(), self.to_string()))
    }
}

/// Non-local exit from a suspension point.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Cooperative reschedule: return to the scheduler, the body is re-invoked later.
    Yield,
    /// The running task was cancelled while waiting.
    Cancelled(Option<Value>),
    /// A value raised by language code.
    Raise(Value),
    /// A runtime programming error.
    Error(ConcError),
}

impl Signal {
    pub fn is_yield(&self) -> bool {
        matches!(self, Signal::Yield)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Signal::Cancelled(_))
    }

    /// The programming error carried by this signal, if any.
    pub fn as_error(&self) -> Option<&ConcError> {
        match self {
            Signal::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConcError> for Signal {
    fn from(err: ConcError) -> Self {
        Signal::Error(err)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Yield => write!(f, "yield"),
            Signal::Cancelled(None) => write!(f, "cancelled"),
            Signal::Cancelled(Some(payload)) => write!(f, "cancelled: {}", payload),
            Signal::Raise(value) => write!(f, "raised: {}", value),
            Signal::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse runtime config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown executor `{0}`; expected `parallel` or `cooperative`")]
    UnknownExecutor(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_names() {
        assert_eq!(ConcError::ChannelSendOnClosed.kind(), "ChannelSendOnClosed");
        assert_eq!(ConcError::NilChannel.kind(), "ChannelNil");
        assert_eq!(ConcError::MutexUnlocked.kind(), "MutexUnlocked");
    }

    #[test]
    fn arity_message_pluralizes() {
        let one = ConcError::ArityMismatch { expected: 1, got: 0 };
        let two = ConcError::ArityMismatch { expected: 2, got: 3 };
        assert_eq!(one.to_string(), "expected 1 argument, got 0");
        assert_eq!(two.to_string(), "expected 2 arguments, got 3");
    }

    #[test]
    fn error_converts_to_value() {
        let v = ConcError::ChannelClosed.to_value();
        let err = v.as_error().expect("error value");
        assert_eq!(err.kind(), "ChannelClosed");
        assert_eq!(err.message(), "close of closed channel");
    }

    #[test]
    fn signal_from_error() {
        let sig: Signal = ConcError::EmptyAwait.into();
        assert_eq!(sig.as_error(), Some(&ConcError::EmptyAwait));
        assert!(!sig.is_yield());
    }
}

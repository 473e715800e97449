// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! AtomicBool flag plus listeners. Tasks check `is_cancelled()` at
//! suspension points; listeners unpark or re-enqueue a task that is
//! waiting so it notices the request promptly.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

type Listener = Box<dyn FnOnce() + Send>;

/// Cancellation token owned by a task handle.
pub struct CancelToken {
    flag: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Set the cancellation flag and run every listener once.
    ///
    /// Returns false if the token was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener();
        }
        true
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Run `f` when the token is cancelled, or right away if it already is.
    pub fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut listeners = self.listeners.lock();
            if !self.flag.load(Ordering::Acquire) {
                listeners.push(Box::new(f));
                return;
            }
        }
        f();
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn cancel_sets_flag_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(token.is_cancelled());
        assert!(!token.cancel());
    }

    #[test]
    fn listeners_run_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

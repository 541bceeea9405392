use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tern_error::{Result, TernError};

/// Shared cancellation handle threaded through execution.
///
/// Cancelling is sticky and idempotent. Everything that blocks (table scans,
/// sink writes, pipe reads) checks the context between units of work so a
/// cancel tears the whole plan down in bounded time.
#[derive(Debug, Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug, Default)]
struct ContextInner {
    cancelled: AtomicBool,
    mu: Mutex<()>,
    cond: Condvar,
    children: Mutex<Vec<std::sync::Weak<ContextInner>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child context: cancelling the parent cancels the child, but
    /// cancelling the child leaves the parent running. Used to abort sibling
    /// peers when one fails without tearing down the whole plan.
    pub fn child(&self) -> Context {
        let child = Context::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner
                .children
                .lock()
                .push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        {
            let _guard = self.inner.mu.lock();
            self.inner.cond.notify_all();
        }
        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children {
            if let Some(inner) = child.upgrade() {
                Context {
                    inner,
                }
                .cancel();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Error out if the context has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TernError::cancelled());
        }
        Ok(())
    }

    /// Block until cancelled or `timeout` elapses. Returns whether the
    /// context is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut guard = self.inner.mu.lock();
        if !self.is_cancelled() {
            self.inner.cond.wait_for(&mut guard, timeout);
        }
        self.is_cancelled()
    }
}

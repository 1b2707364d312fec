//! Execution context threaded through task execution.
//!
//! Instead of binding the current transaction and owner to thread-local
//! state, every task body receives an [`ExecutionContext`] describing who it
//! runs for, which transaction (if any) it is inside, and the [`Interrupt`]
//! token of the thread running it. Contexts are values: the engine derives a
//! child for each task and a grandchild for each transaction, and dropping
//! them restores the caller's view.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{Interrupted, TaskError, Transaction};
use crate::util::serde::Identity;

type Waker = Arc<dyn Fn() + Send + Sync>;

struct InterruptInner {
    flag: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Cooperative interruption flag for one thread of execution.
///
/// `interrupt()` sets the flag and wakes whatever blocking wait is currently
/// registered. [`Interrupt::check`] consumes the flag, so a caller that has
/// reacted to an interruption can block again afterwards.
#[derive(Clone)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

impl Interrupt {
    /// Create an un-interrupted token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InterruptInner {
                flag: AtomicBool::new(false),
                waker: Mutex::new(None),
            }),
        }
    }

    /// Interrupt the owning thread.
    pub fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        // Clone out so the waker runs without holding the slot lock.
        let waker = self.inner.waker.lock().clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    /// Whether an interruption is pending.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn clear(&self) -> bool {
        self.inner.flag.swap(false, Ordering::SeqCst)
    }

    /// Consume a pending interruption.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the flag was set.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.clear() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Register the waker for a blocking wait; it is removed when the guard drops.
    pub(crate) fn register_waker(&self, waker: Waker) -> WakerRegistration<'_> {
        *self.inner.waker.lock() = Some(waker);
        WakerRegistration { interrupt: self }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

pub(crate) struct WakerRegistration<'a> {
    interrupt: &'a Interrupt,
}

impl Drop for WakerRegistration<'_> {
    fn drop(&mut self) {
        self.interrupt.inner.waker.lock().take();
    }
}

/// Application-level context stamped into every task context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelContext {
    app_name: String,
}

impl KernelContext {
    /// Create a context for the named application.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    /// Name of the application this context belongs to.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }
}

/// What a piece of code is running as, and inside which transaction.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    owner: Identity,
    kernel: Option<Arc<KernelContext>>,
    transaction: Option<Arc<dyn Transaction>>,
    interrupt: Interrupt,
}

impl ExecutionContext {
    /// A root context for a thread outside the scheduler.
    #[must_use]
    pub fn new(owner: Identity) -> Self {
        Self::with_interrupt(owner, Interrupt::new())
    }

    /// A root context sharing an existing interrupt token.
    #[must_use]
    pub const fn with_interrupt(owner: Identity, interrupt: Interrupt) -> Self {
        Self {
            owner,
            kernel: None,
            transaction: None,
            interrupt,
        }
    }

    /// The identity the current code runs for.
    #[must_use]
    pub const fn owner(&self) -> &Identity {
        &self.owner
    }

    /// The application context, if one was installed.
    #[must_use]
    pub fn kernel_context(&self) -> Option<&KernelContext> {
        self.kernel.as_deref()
    }

    /// The transaction bound to this context.
    #[must_use]
    pub const fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }

    /// Whether code running with this context is inside a transaction.
    #[must_use]
    pub const fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// The interrupt token of the thread running this context.
    #[must_use]
    pub const fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Consume a pending interruption as a task failure.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Interrupted`] if the running thread was interrupted.
    pub fn check_interrupted(&self) -> Result<(), TaskError> {
        self.interrupt.check().map_err(|_| TaskError::Interrupted)
    }

    /// Child context running for `owner` outside any transaction.
    pub(crate) fn bind(&self, kernel: Option<Arc<KernelContext>>, owner: Identity) -> Self {
        Self {
            owner,
            kernel: kernel.or_else(|| self.kernel.clone()),
            transaction: None,
            interrupt: self.interrupt.clone(),
        }
    }

    /// Child context bound to `transaction`.
    pub(crate) fn with_transaction(&self, transaction: Arc<dyn Transaction>) -> Self {
        Self {
            owner: self.owner.clone(),
            kernel: self.kernel.clone(),
            transaction: Some(transaction),
            interrupt: self.interrupt.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_interrupt_check_consumes_flag() {
        let interrupt = Interrupt::new();
        assert!(interrupt.check().is_ok());
        interrupt.interrupt();
        assert!(interrupt.is_interrupted());
        assert_eq!(interrupt.check(), Err(Interrupted));
        assert!(interrupt.check().is_ok());
    }

    #[test]
    fn test_interrupt_runs_registered_waker() {
        let interrupt = Interrupt::new();
        let woken = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&woken);
            let _registration = interrupt.register_waker(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            interrupt.interrupt();
        }
        // Registration dropped; further interrupts wake nobody.
        interrupt.interrupt();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bind_replaces_owner_and_clears_transaction() {
        let root = ExecutionContext::new(Identity::new("caller"));
        let child = root.bind(Some(Arc::new(KernelContext::new("app"))), Identity::new("task"));
        assert_eq!(child.owner().name(), "task");
        assert_eq!(child.kernel_context().map(KernelContext::app_name), Some("app"));
        assert!(!child.is_in_transaction());
        assert_eq!(root.owner().name(), "caller");

        child.interrupt().interrupt();
        assert!(root.interrupt().is_interrupted());
    }

    #[test]
    fn test_check_interrupted_maps_to_task_error() {
        let ctx = ExecutionContext::new(Identity::system());
        ctx.interrupt().interrupt();
        assert!(matches!(ctx.check_interrupted(), Err(TaskError::Interrupted)));
        assert!(ctx.check_interrupted().is_ok());
    }
}

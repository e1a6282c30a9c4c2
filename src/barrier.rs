//! Completion barrier for a dynamically sized fan-out
//!
//! A wait group whose size is only known as work starts. Every unit of work
//! calls [`CompletionBarrier::register`] before it begins and holds the
//! returned [`Pending`] token until it settles; dropping or completing the
//! token decrements the outstanding count. The transition to zero runs the
//! finalizer exactly once, whichever thread observes it.
//!
//! A producer that may still start work must hold a registration of its own
//! for as long as it can produce, otherwise the count can touch zero between
//! two units of work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

type Finalizer = Box<dyn FnOnce() + Send>;

/// Shared handle to one barrier
#[derive(Clone)]
pub struct CompletionBarrier {
    inner: Arc<Inner>,
}

struct Inner {
    outstanding: AtomicUsize,
    settled: AtomicBool,
    finalizer: Mutex<Option<Finalizer>>,
}

/// Registration token for one outstanding unit of work
///
/// Completing or dropping the token releases the registration exactly once.
#[must_use = "dropping a Pending token completes it immediately"]
pub struct Pending {
    inner: Arc<Inner>,
}

impl CompletionBarrier {
    /// Create a barrier that runs `finalize` when the last registration settles
    pub fn new(finalize: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                outstanding: AtomicUsize::new(0),
                settled: AtomicBool::new(false),
                finalizer: Mutex::new(Some(Box::new(finalize))),
            }),
        }
    }

    /// Create a barrier whose finalizer resolves the returned receiver
    pub fn with_signal() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let barrier = Self::new(move || {
            let _ = tx.send(());
        });
        (barrier, rx)
    }

    /// Register one unit of work that has started
    pub fn register(&self) -> Pending {
        let prev = self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            !self.inner.settled.load(Ordering::Acquire),
            "registration after the barrier settled"
        );
        debug!(outstanding = prev + 1, "barrier registration");
        Pending {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Registrations that have not settled yet
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Whether the finalizer has run
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }
}

impl Pending {
    /// Mark this unit of work as finished, successfully or not
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl Inner {
    fn release(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "barrier released more often than registered");
        if prev == 1 && !self.settled.swap(true, Ordering::AcqRel) {
            debug!("barrier settled");
            let finalize = self
                .finalizer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(finalize) = finalize {
                finalize();
            }
        }
    }
}

//! Fan-in aggregation of write completions
//!
//! A [`FanIn`] counts down `count` sub-completions and runs one downstream
//! callback when the last one arrives. The downstream callback is moved out
//! before it runs, and every clone only touches the shared counter, so
//! nothing dereferences the aggregator's state after it reached zero.

use crate::device::IoCompletion;
use crate::write::IoCallback;
use blockio_common::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

struct FanInInner {
    remaining: AtomicUsize,
    failed: AtomicBool,
    downstream: Mutex<Option<IoCallback>>,
}

/// Countdown over several asynchronous writes
#[derive(Clone)]
pub struct FanIn {
    inner: Arc<FanInInner>,
}

impl FanIn {
    /// Expect `count` completions before running `downstream`
    ///
    /// With `count == 0` the downstream callback runs before `new` returns.
    #[must_use]
    pub fn new(count: usize, downstream: IoCallback) -> Self {
        let downstream = if count == 0 {
            downstream();
            None
        } else {
            Some(downstream)
        };

        Self {
            inner: Arc::new(FanInInner {
                remaining: AtomicUsize::new(count),
                failed: AtomicBool::new(false),
                downstream: Mutex::new(downstream),
            }),
        }
    }

    /// Record one sub-completion
    ///
    /// # Panics
    ///
    /// Panics if called more often than the count given to [`FanIn::new`].
    pub fn complete(&self) {
        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or_else(|_| panic!("fan-in completed more times than its count"));

        if previous == 1 {
            let downstream = self.inner.downstream.lock().take();
            if let Some(downstream) = downstream {
                downstream();
            }
        }
    }

    /// Record one sub-completion carrying a device result
    pub fn complete_with(&self, result: &Result<()>) {
        if let Err(e) = result {
            warn!("fan-in sub-write failed: {}", e);
            self.inner.failed.store(true, Ordering::Release);
        }
        self.complete();
    }

    /// A boxed sub-completion for code that only knows [`IoCallback`]
    #[must_use]
    pub fn callback(&self) -> IoCallback {
        let fanin = self.clone();
        Box::new(move || fanin.complete())
    }

    /// A boxed sub-completion for handing to a device
    #[must_use]
    pub fn io_completion(&self) -> IoCompletion {
        let fanin = self.clone();
        Box::new(move |result| fanin.complete_with(&result))
    }

    /// Sub-completions still outstanding
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Whether any sub-write reported an error
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FanIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanIn")
            .field("remaining", &self.remaining())
            .field("failed", &self.has_failed())
            .finish()
    }
}

//! IO accounts
//!
//! Every request issued to a device carries the account of the caller that
//! issued it. An account has a scheduling priority and an optional cap on
//! its outstanding requests. The pipeline only threads accounts through;
//! devices enforce the cap by taking an [`IoPermit`] per request.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// I/O priority level for scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Priority and throttling handle shared by one class of callers
#[derive(Debug)]
pub struct IoAccount {
    priority: Priority,
    /// Cap on in-flight requests (None = unlimited)
    max_outstanding: Option<usize>,
    outstanding: Mutex<usize>,
    slot_freed: Condvar,
    total_requests: AtomicU64,
    throttled: AtomicU64,
}

impl IoAccount {
    /// Create an account with unlimited outstanding requests
    #[must_use]
    pub fn new(priority: Priority) -> Self {
        Self::build(priority, None)
    }

    /// Create an account allowing at most `max_outstanding` in-flight requests
    ///
    /// A cap of 0 means unlimited.
    #[must_use]
    pub fn with_limit(priority: Priority, max_outstanding: usize) -> Self {
        Self::build(priority, (max_outstanding > 0).then_some(max_outstanding))
    }

    fn build(priority: Priority, max_outstanding: Option<usize>) -> Self {
        Self {
            priority,
            max_outstanding,
            outstanding: Mutex::new(0),
            slot_freed: Condvar::new(),
            total_requests: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn max_outstanding(&self) -> Option<usize> {
        self.max_outstanding
    }

    /// Requests issued on this account that have not completed yet
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Requests ever issued on this account
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Number of times a request had to wait for a free slot
    #[must_use]
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Take a slot for one request, blocking while the account is at its cap
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> IoPermit {
        let mut outstanding = self.outstanding.lock();
        if let Some(max) = self.max_outstanding
            && *outstanding >= max
        {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            while *outstanding >= max {
                self.slot_freed.wait(&mut outstanding);
            }
        }
        *outstanding += 1;
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        IoPermit {
            account: Arc::clone(self),
        }
    }

    fn release_slot(&self) {
        let mut outstanding = self.outstanding.lock();
        debug_assert!(*outstanding > 0, "io account slot released twice");
        *outstanding = outstanding.saturating_sub(1);
        self.slot_freed.notify_one();
    }
}

impl Default for IoAccount {
    fn default() -> Self {
        Self::new(Priority::Normal)
    }
}

/// One in-flight request on an account; frees its slot on drop
#[derive(Debug)]
pub struct IoPermit {
    account: Arc<IoAccount>,
}

impl IoPermit {
    #[must_use]
    pub fn account(&self) -> &Arc<IoAccount> {
        &self.account
    }
}

impl Drop for IoPermit {
    fn drop(&mut self) {
        self.account.release_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_account_unlimited() {
        let account = Arc::new(IoAccount::new(Priority::High));
        assert_eq!(account.priority(), Priority::High);
        assert_eq!(account.max_outstanding(), None);

        let permits: Vec<_> = (0..100).map(|_| account.acquire()).collect();
        assert_eq!(account.outstanding(), 100);
        assert_eq!(account.throttled(), 0);

        drop(permits);
        assert_eq!(account.outstanding(), 0);
        assert_eq!(account.total_requests(), 100);
    }

    #[test]
    fn test_account_zero_limit_is_unlimited() {
        let account = IoAccount::with_limit(Priority::Low, 0);
        assert_eq!(account.max_outstanding(), None);
    }

    #[test]
    fn test_account_limit_blocks_until_release() {
        let account = Arc::new(IoAccount::with_limit(Priority::Normal, 2));
        let first = account.acquire();
        let _second = account.acquire();
        assert_eq!(account.outstanding(), 2);

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let account = Arc::clone(&account);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _permit = account.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(account.throttled(), 1);
        assert_eq!(account.outstanding(), 1);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Low < Priority::Normal);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}

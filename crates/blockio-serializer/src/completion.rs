//! Completion synchronizer
//!
//! Bridges a device completion, delivered on an I/O worker, into a blocking
//! wait on the pipeline's home context. [`write_cond`] returns the two ends
//! of a one-shot channel: the [`WriteCompleter`] goes to the device, the
//! [`WriteCond`] stays with the waiter. Both ends are consumed by use, so a
//! second completion or a second wait cannot be expressed.

use crate::device::IoCompletion;
use crate::write::IoCallback;
use blockio_common::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::fmt;

/// Create a pending synchronizer
///
/// `forward` runs on the completing thread before the waiter is woken. A
/// completer dropped without completing still runs `forward`, and the
/// waiter then sees an error.
#[must_use]
pub fn write_cond(forward: Option<IoCallback>) -> (WriteCompleter, WriteCond) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (WriteCompleter { forward, tx }, WriteCond { rx })
}

/// Completing end, handed to the I/O layer
pub struct WriteCompleter {
    forward: Option<IoCallback>,
    tx: Sender<Result<()>>,
}

impl WriteCompleter {
    /// Signal that the write finished
    pub fn complete(mut self, result: Result<()>) {
        if let Some(forward) = self.forward.take() {
            forward();
        }
        // The waiter may already be gone if its pipeline bailed out early.
        let _ = self.tx.send(result);
    }

    /// Wrap as a device completion callback
    #[must_use]
    pub fn into_io_completion(self) -> IoCompletion {
        Box::new(move |result| self.complete(result))
    }
}

impl Drop for WriteCompleter {
    fn drop(&mut self) {
        if let Some(forward) = self.forward.take() {
            forward();
        }
    }
}

impl fmt::Debug for WriteCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteCompleter")
            .field("forward", &self.forward.is_some())
            .finish_non_exhaustive()
    }
}

/// Waiting end
#[derive(Debug)]
pub struct WriteCond {
    rx: Receiver<Result<()>>,
}

impl WriteCond {
    /// Block until the write completes and return its outcome
    ///
    /// Returns immediately if the write already completed.
    pub fn wait(self) -> Result<()> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(Error::internal(
                "write completion dropped without completing",
            ))
        })
    }

    /// Check for completion without blocking
    #[must_use]
    pub fn is_completed(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Take the outcome if the write already completed
    pub fn try_wait(self) -> std::result::Result<Result<()>, Self> {
        match self.rx.try_recv() {
            Ok(result) => Ok(result),
            Err(TryRecvError::Empty) => Err(self),
            Err(TryRecvError::Disconnected) => Ok(Err(Error::internal(
                "write completion dropped without completing",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_after_completion_returns_immediately() {
        let (completer, cond) = write_cond(None);
        assert!(!cond.is_completed());

        completer.complete(Ok(()));
        assert!(cond.is_completed());
        cond.wait().unwrap();
    }

    #[test]
    fn test_forward_runs_before_wake() {
        let forwarded = Arc::new(AtomicBool::new(false));
        let (completer, cond) = write_cond(Some(Box::new({
            let forwarded = Arc::clone(&forwarded);
            move || forwarded.store(true, Ordering::SeqCst)
        })));

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(()));
        });

        cond.wait().unwrap();
        assert!(forwarded.load(Ordering::SeqCst));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_blocks_until_completed() {
        let (completer, cond) = write_cond(None);
        let done = Arc::new(AtomicUsize::new(0));

        let handle = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                cond.wait().unwrap();
                done.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        completer.into_io_completion()(Ok(()));
        handle.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_write_reported() {
        let (completer, cond) = write_cond(None);
        completer.complete(Err(Error::storage("short write")));
        assert!(matches!(cond.wait(), Err(Error::Storage(_))));
    }

    #[test]
    fn test_dropped_completer_is_an_error() {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let (completer, cond) = write_cond(Some(Box::new({
            let forwarded = Arc::clone(&forwarded);
            move || {
                forwarded.fetch_add(1, Ordering::SeqCst);
            }
        })));
        drop(completer.into_io_completion());
        assert!(matches!(cond.wait(), Err(Error::Internal(_))));
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forward_runs_once() {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let (completer, cond) = write_cond(Some(Box::new({
            let forwarded = Arc::clone(&forwarded);
            move || {
                forwarded.fetch_add(1, Ordering::SeqCst);
            }
        })));
        completer.complete(Ok(()));
        cond.wait().unwrap();
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_wait() {
        let (completer, cond) = write_cond(None);
        let cond = cond.try_wait().unwrap_err();
        completer.complete(Ok(()));
        assert!(cond.try_wait().unwrap().is_ok());
    }
}

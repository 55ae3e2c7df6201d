//! Condition-variable waits shared by every suspension point.
//!
//! A [`Waiter`] describes how the calling context wants to wait: block or fail
//! fast, which [`CancelToken`] can abort it and which teardown flag ends it.
//! [`Waiter::wait_until`] is the only loop that parks a thread in nicwarp.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{ErrorKind, Result};

/// How often a parked thread re-checks its cancel token and the teardown flag.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Blocking behaviour of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Park until the condition holds.
    Blocking,
    /// Return `WouldBlock` instead of parking.
    NonBlocking,
}

impl WaitMode {
    /// Maps the `blocking_mode` configuration flag.
    pub fn from_blocking(blocking: bool) -> Self {
        if blocking {
            WaitMode::Blocking
        } else {
            WaitMode::NonBlocking
        }
    }
}

/// External interrupt for a blocked wait.
///
/// Cancelling is one-shot: the next wait that would park (or is parked)
/// observes it, returns `Interrupted` and clears it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the current or next wait is aborted.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true if a cancel is pending.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Consumes a pending cancel.
    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Parameters of one wait.
#[derive(Debug, Clone, Copy)]
pub struct Waiter<'a> {
    mode: WaitMode,
    cancel: Option<&'a CancelToken>,
    teardown: Option<&'a AtomicBool>,
}

impl<'a> Waiter<'a> {
    /// A waiter with the given mode and no cancellation.
    pub fn new(mode: WaitMode) -> Self {
        Waiter { mode, cancel: None, teardown: None }
    }

    /// A blocking waiter.
    pub fn blocking() -> Self {
        Self::new(WaitMode::Blocking)
    }

    /// A waiter that never parks.
    pub fn non_blocking() -> Self {
        Self::new(WaitMode::NonBlocking)
    }

    /// Aborts the wait with `Interrupted` when `token` is cancelled.
    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Ends the wait with `ShutDown` once `flag` is set.
    pub fn with_teardown(mut self, flag: &'a AtomicBool) -> Self {
        self.teardown = Some(flag);
        self
    }

    /// The wait mode.
    pub fn mode(&self) -> WaitMode {
        self.mode
    }

    /// Returns `ShutDown` if the teardown flag is set.
    pub fn check_teardown(&self) -> Result<()> {
        match self.teardown {
            Some(flag) if flag.load(Ordering::Acquire) => Err(ErrorKind::ShutDown),
            _ => Ok(()),
        }
    }

    /// Acquires an exclusivity lock, honouring the wait mode, cancellation and teardown.
    pub fn lock<'m, T>(&self, mutex: &'m Mutex<T>) -> Result<MutexGuard<'m, T>> {
        loop {
            self.check_teardown()?;
            if let Some(guard) = mutex.try_lock() {
                return Ok(guard);
            }
            if self.mode == WaitMode::NonBlocking {
                return Err(ErrorKind::WouldBlock);
            }
            if self.cancel.map_or(false, |token| token.take()) {
                return Err(ErrorKind::Interrupted);
            }
            if let Some(guard) = mutex.try_lock_for(CANCEL_POLL_INTERVAL) {
                return Ok(guard);
            }
        }
    }

    /// Parks on `condvar` until `ready` returns true for the guarded state.
    ///
    /// Returns whether the thread actually parked. The guard is held whenever
    /// `ready` runs and on return. On any error the guarded state is left as the
    /// caller had it.
    pub fn wait_until<T, F>(&self, condvar: &Condvar, guard: &mut MutexGuard<'_, T>, mut ready: F) -> Result<bool>
    where
        F: FnMut(&mut T) -> bool,
    {
        let mut waited = false;
        loop {
            self.check_teardown()?;
            if ready(&mut **guard) {
                return Ok(waited);
            }
            if self.mode == WaitMode::NonBlocking {
                return Err(ErrorKind::WouldBlock);
            }
            if self.cancel.map_or(false, |token| token.take()) {
                return Err(ErrorKind::Interrupted);
            }
            waited = true;
            condvar.wait_for(guard, CANCEL_POLL_INTERVAL);
        }
    }
}

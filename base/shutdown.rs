// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The receiver can be cloned, checked, and awaited in async code. For
//! convenience, synchronous code can also block on it with a timeout
//! without going through the runtime.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// `true` iff shutdown has already happened.
    stopped: Mutex<bool>,

    /// Wakes synchronous `wait_for` callers.
    condvar: Condvar,

    /// Wakes async `wait` callers.
    notify: Notify,
}

/// Requests shutdown when dropped.
pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: flip the flag under the lock, then wake both kinds
        // of waiters. The opposite order would race with a waiter that checks
        // the flag and then parks.
        *self.0.stopped.lock().expect("shutdown lock poisoned") = true;
        self.0.condvar.notify_all();
        self.0.notify.notify_waiters();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    /// Returns an error iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.stopped.lock().expect("shutdown lock poisoned") {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks up to `timeout`; `Ok` means the timeout elapsed without a
    /// shutdown request.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.stopped.lock().expect("shutdown lock poisoned");
        let (stopped, result) = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |stopped| !*stopped)
            .expect("shutdown lock poisoned");
        if *stopped {
            Err(ShutdownError)
        } else {
            debug_assert!(result.timed_out());
            Ok(())
        }
    }

    /// Completes when shutdown is requested. Cancel-safe, so it can be used
    /// directly in `tokio::select!` arms.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // `Sender::drop` can't slip between the check and the await.
            let notified = self.0.notify.notified();
            if *self.0.stopped.lock().expect("shutdown lock poisoned") {
                return;
            }
            notified.await;
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender requests shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        stopped: Mutex::new(false),
        condvar: Condvar::new(),
        notify: Notify::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking() {
        let (tx, rx) = super::channel();
        rx.wait_for(Duration::from_secs(0)).unwrap();
        let h = std::thread::spawn(move || rx.wait_for(Duration::from_secs(1000)).unwrap_err());

        // Make it likely that rx has done its initial check and is parked.
        std::thread::sleep(Duration::from_millis(10));

        drop(tx);
        h.join().unwrap();
    }

    #[tokio::test]
    async fn async_wait() {
        let (tx, rx) = super::channel();
        let h = tokio::spawn(async move { rx.wait().await });
        drop(tx);
        h.await.unwrap();
    }

    #[tokio::test]
    async fn wait_after_shutdown() {
        let (tx, rx) = super::channel();
        drop(tx);
        rx.wait().await;
    }
}

//! Module to signal phase changes in dotter.
//!
//! dotter has two kinds of phase change: the end of the whole process and the
//! end of a single scheduled burst task. Both use the mechanism here, a
//! `Broadcaster` and any number of `Watcher` instances. The `Broadcaster`
//! fires exactly once. Each `Watcher` observes the signal and, by dropping,
//! tells the `Broadcaster` it has gone away. This lets the owner of a task be
//! certain the task has stopped before anything replaces it.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use tokio::sync::watch;
use tracing::{debug, trace};

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The channel value flips from false to true exactly once. Dropping the
    // sender without flipping the value is also treated as the signal, so a
    // `Broadcaster` that goes out of scope never strands its watchers.
    let (sender, receiver) = watch::channel(false);

    let w = Watcher {
        receiver,
        signal_received: false,
    };
    let b = Broadcaster { sender };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that a phase has been
/// achieved.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until all peers have dropped.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function WILL block until every `Watcher` derived from this
    /// `Broadcaster` has been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        let peers = self.sender.receiver_count();
        if peers > 0 {
            debug!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
    }

    /// The number of live `Watcher` instances.
    #[must_use]
    pub fn peers(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The signal has been received and yet `try_recv` was called.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has been sent and yet `register` was called.
    #[error("signal has been sent")]
    SignalSent,
}

#[derive(Debug)]
/// Mechanism to watch for phase changes.
///
/// Every live `Watcher` holds up `Broadcaster::signal_and_wait`. Owners of a
/// `Watcher` that never intend to wait on it must drop it.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    /// Used to track if the signal has been received without synchronization.
    signal_received: bool,
}

impl Watcher {
    /// Receive the signal. This function will block if the signal has not
    /// already been sent.
    ///
    /// The `Watcher` is consumed, which is what releases the `Broadcaster` from
    /// `signal_and_wait`.
    pub async fn recv(mut self) {
        if self.signal_received {
            // Avoid drowning out other arms if this is polled in a `select!`
            // loop after the signal.
            tokio::task::yield_now().await;
            return;
        }

        if self.receiver.wait_for(|signaled| *signaled).await.is_err() {
            trace!("broadcaster dropped without signaling");
        }
    }

    /// Check if the signal has been sent without blocking.
    ///
    /// If the signal has not been received returns Ok(false). If it has been
    /// received Ok(true). All calls after will return
    /// `TryRecvError::SignalReceived`.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` if the signal has already been
    /// received by this watcher.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }

        let signaled = *self.receiver.borrow() || self.receiver.has_changed().is_err();
        if signaled {
            self.signal_received = true;
        }
        Ok(signaled)
    }

    /// Whether the signal has been sent, without consuming it.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.signal_received || *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Register with the `Broadcaster`, returning a new instance of `Watcher`.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalSent` once the `Broadcaster` has
    /// signaled, so no new peer can start after shutdown began.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.is_signaled() {
            return Err(RegisterError::SignalSent);
        }

        Ok(Self {
            receiver: self.receiver.clone(),
            signal_received: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use tokio::time::{sleep, timeout};

    use crate::{RegisterError, TryRecvError, signal};

    #[tokio::test]
    async fn basic_signal() {
        let (watcher, broadcaster) = signal();

        let handle = tokio::spawn(watcher.recv());
        broadcaster.signal_and_wait().await;

        handle.await.expect("watcher task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn signal_and_wait_blocks_until_watchers_drop() {
        let (watcher, broadcaster) = signal();
        let second = watcher.register().expect("registration must succeed");
        assert_eq!(broadcaster.peers(), 2);

        let released = Arc::new(AtomicBool::new(false));
        let slow_released = Arc::clone(&released);
        let slow = tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            slow_released.store(true, Ordering::SeqCst);
            drop(second);
        });
        let fast = tokio::spawn(watcher.recv());

        broadcaster.signal_and_wait().await;
        assert!(released.load(Ordering::SeqCst));
        fast.await.expect("fast watcher panicked");
        slow.await.expect("slow watcher panicked");
    }

    #[tokio::test]
    async fn signal_without_watchers() {
        let (watcher, broadcaster) = signal();
        drop(watcher);
        timeout(Duration::from_secs(1), broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait must not hang without watchers");
    }

    #[tokio::test]
    async fn dropped_broadcaster_counts_as_signal() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        timeout(Duration::from_secs(1), watcher.recv())
            .await
            .expect("recv must return once the broadcaster is gone");
    }

    #[test]
    fn try_receive_before_and_after_signal() {
        let (mut watcher, broadcaster) = signal();

        assert!(!watcher.try_recv().expect("signal not yet received"));
        broadcaster.signal();
        assert!(watcher.try_recv().expect("signal not yet received"));

        assert!(matches!(
            watcher.try_recv(),
            Err(TryRecvError::SignalReceived)
        ));
    }

    #[test]
    fn register_after_signal_fails() {
        let (watcher, broadcaster) = signal();
        let mut second = watcher.register().expect("registration must succeed");
        assert!(!watcher.is_signaled());

        broadcaster.signal();

        assert!(watcher.is_signaled());
        assert!(matches!(watcher.register(), Err(RegisterError::SignalSent)));
        assert!(second.try_recv().expect("signal not yet received"));
    }
}

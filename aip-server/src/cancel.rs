//! First-class cancellation signalling between routers and handlers.
//!
//! The router holds the [`CancelHandle`]; the business handler polls or awaits
//! the paired [`CancelSignal`] at each chunk boundary. Dropping the handle
//! counts as cancellation, so a request that unwinds early can never leave
//! orphaned handler work behind.

use tokio::sync::watch;

/// Router-side cancellation trigger bound to one request's lifetime.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fires the cancellation signal.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Handler-side view of the cancellation state.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    // Held only to keep the channel open for `never()` signals.
    #[allow(dead_code)]
    keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// Returns `true` once the owning request has been cancelled.
    ///
    /// A dropped [`CancelHandle`] reads as cancelled: the request it belonged
    /// to is gone either way.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation fires (or the handle is dropped).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped: the request is over.
    }

    /// Creates a signal that never fires, for handlers invoked outside a
    /// request lifetime (tests, warm-up probes).
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            keepalive: Some(std::sync::Arc::new(tx)),
        }
    }
}

/// Creates a linked cancellation pair for one request.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx },
        CancelSignal {
            rx,
            keepalive: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_fires_on_cancel() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .expect("cancelled future resolves");
    }

    #[tokio::test]
    async fn dropped_handle_reads_as_cancelled() {
        let (handle, signal) = cancel_pair();
        drop(handle);
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .expect("drop resolves waiters");
    }

    #[tokio::test]
    async fn never_signal_stays_quiet() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
    }
}

//! Cooperative cancellation signal.
//!
//! Long-running bus loops (`listen`, and the reply wait inside a query
//! `execute`) hold a [`Shutdown`] and check it between broker polls. When the
//! paired [`ShutdownTrigger`] fires, the loop closes its broker session and
//! returns [`BusError::Cancelled`](crate::BusError::Cancelled).
//!
//! Built on `tokio::sync::watch` so any number of loops can observe the same
//! trigger, and a loop started after the trigger fired still sees it.

use tokio::sync::watch;

/// Owning side of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        // ---
        self.tx.send_replace(true);
    }

    /// Another observer of this trigger.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observing side of a shutdown signal. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Self {
        // ---
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires.
    ///
    /// Pends forever if the trigger is dropped without firing.
    pub async fn triggered(&self) {
        // ---
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::never()
    }
}

/// Create a connected trigger/observer pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    // ---
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

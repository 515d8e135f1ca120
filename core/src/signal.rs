//! Stop signalling shared by every suspension point of the controller.
//!
//! A [`StopHandle`] owns the flag; any number of [`StopSignal`] clones observe
//! it. Stopping is idempotent and cannot be undone.

use tokio::sync::watch;

/// Owning side of the stop flag
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Create a new, not yet stopped, handle and its first observer
    pub fn new() -> (Self, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, StopSignal { rx })
    }

    /// Raise the stop flag. Calling this more than once is harmless.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Another observer of this flag
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of the stop flag
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Whether the flag is raised (or its handle is gone)
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once the flag is raised.
    ///
    /// A dropped [`StopHandle`] counts as a stop: nobody is left to keep the
    /// work alive.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

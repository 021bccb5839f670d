//! Cooperative cancellation. A `StopToken` is cloned into every long-running
//! loop; the matching `StopHandle` closes the underlying channel, which every
//! token observes at its next check or mid-sleep.

use std::time::Duration;

use async_channel::{Receiver, Sender};

pub fn stop_channel() -> (StopHandle, StopToken) {
    let (tx, rx) = async_channel::bounded::<()>(1);
    (StopHandle { tx }, StopToken { rx })
}

pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    /// Signal every token. Dropping the handle has the same effect.
    pub fn stop(self) {
        self.tx.close();
    }
}

#[derive(Clone)]
pub struct StopToken {
    rx: Receiver<()>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.rx.is_closed()
    }

    /// Resolves once stop is signalled.
    pub async fn stopped(&self) {
        let _ = self.rx.recv().await;
    }

    /// Sleep for `duration` unless stopped first. Returns true when the full
    /// sleep elapsed, false when the loop should wind down.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let cancelled = async {
            self.stopped().await;
            false
        };
        let slept = async {
            smol::Timer::after(duration).await;
            true
        };
        smol::future::or(cancelled, slept).await
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Returned by a wait that was cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Per-run stop request. Set from anywhere; the run notices at its next check
/// point or immediately if it is sleeping in [`CancelFlag::sleep`].
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }

    /// Sleep for `duration`, waking early on cancel.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a cancel in between is not lost
        notified.as_mut().enable();
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = notified => {}
        }
        self.check()
    }
}

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;

/// Shared running flag observed by the receive loop, the dispatcher and the matcher
/// poller.
///
/// Clearing the flag wakes every task awaiting [`RunSignal::stopped`].
#[derive(Debug, Clone)]
pub struct RunSignal {
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for RunSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignal {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolve once [`RunSignal::stop`] has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_running() {
                return;
            }

            notified.await;
        }
    }
}

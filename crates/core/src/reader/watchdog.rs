//! Watchdog timer for process-backed readers: refreshed on any stderr line,
//! fires after `wd_timeout_s` of silence so the caller can kill and restart
//! the child.

use std::time::Duration;

use tokio::sync::watch;

/// A resettable deadline. `0` disables the watchdog (the default), matching
/// `DEFAULT_WATCHDOG_TIMEOUT_SECS`.
pub struct Watchdog {
    timeout: Duration,
    reset_tx: watch::Sender<()>,
    reset_rx: watch::Receiver<()>,
}

impl Watchdog {
    pub fn new(timeout_secs: u64) -> Self {
        let (reset_tx, reset_rx) = watch::channel(());
        Self { timeout: Duration::from_secs(timeout_secs), reset_tx, reset_rx }
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Called whenever a stderr line (or any liveness signal) arrives.
    pub fn feed(&self) {
        let _ = self.reset_tx.send(());
    }

    /// Waits until `timeout` elapses without an intervening `feed()` call.
    /// Never returns if the watchdog is disabled.
    pub async fn expired(&self) {
        if !self.is_enabled() {
            std::future::pending::<()>().await;
        }
        let mut rx = self.reset_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.timeout) => return,
                res = rx.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn disabled_watchdog_never_expires() {
        let wd = Watchdog::new(0);
        assert!(!wd.is_enabled());
        tokio::select! {
            _ = wd.expired() => panic!("disabled watchdog should never fire"),
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn feed_resets_the_deadline() {
        let wd = Watchdog::new(2);
        let expired_fut = wd.expired();
        tokio::pin!(expired_fut);
        tokio::time::sleep(Duration::from_secs(1)).await;
        wd.feed();
        tokio::select! {
            _ = &mut expired_fut => panic!("should not have expired yet"),
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

//! One-way stop broadcast shared by every task of a run.
use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of the stop broadcast. Cloning shares the same signal.
///
/// Stopping is idempotent and permanent: once [`StopSignal::stop`] has been called every
/// current and future [`StopListener`] observes it.
#[derive(Clone, Debug)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        // NOTE: send_replace stores the value even when nobody is subscribed yet.
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// Non-blocking poll, used at the top of worker and report loops.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is stopped. A signal whose owners were all dropped without
    /// stopping can never fire, so this stays pending.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_observe_stop() {
        let signal = StopSignal::new();
        let mut early = signal.listener();
        assert!(!early.is_stopped());

        let waiter = tokio::spawn(async move { early.stopped().await });
        signal.stop();
        waiter.await.unwrap();

        let late = signal.listener();
        assert!(late.is_stopped());
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        signal.stop();
        clone.stop();
        let mut listener = signal.listener();
        listener.stopped().await;
        assert!(listener.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_signal_never_fires() {
        let mut listener = StopSignal::new().listener();
        let res = tokio::time::timeout(Duration::from_secs(5), listener.stopped()).await;
        assert!(res.is_err());
        assert!(!listener.is_stopped());
    }
}

//! One-shot reassembly expiry timer

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::core::{event::SessionEvent, reassembly::TransferId};

/// Default inactivity window for write-without-response transfers
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_millis(2000);

/// At most one pending expiry; arming replaces the previous deadline
pub struct ReassemblyTimer {
    timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    pending: Option<(TransferId, JoinHandle<()>)>,
}

impl ReassemblyTimer {
    pub fn new(timeout: Duration, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            timeout,
            events,
            pending: None,
        }
    }

    /// Transfer the pending expiry belongs to
    pub fn armed_for(&self) -> Option<TransferId> {
        self.pending.as_ref().map(|(transfer, _)| *transfer)
    }

    /// (Re)start the countdown for `transfer`
    pub fn arm(&mut self, transfer: TransferId) {
        self.cancel();

        let events = self.events.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent::ReassemblyTimeout(transfer));
        });

        debug!(%transfer, timeout_ms = timeout.as_millis() as u64, "Reassembly timer armed");
        self.pending = Some((transfer, handle));
    }

    pub fn cancel(&mut self) {
        if let Some((transfer, handle)) = self.pending.take() {
            handle.abort();
            debug!(%transfer, "Reassembly timer cancelled");
        }
    }

    /// Forget the expiry that just fired
    pub fn fired(&mut self, transfer: TransferId) {
        if self.armed_for() == Some(transfer) {
            self.pending = None;
        }
    }
}

impl Drop for ReassemblyTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ReassemblyTimer::new(Duration::from_millis(20), tx);

        timer.arm(TransferId(7));
        tokio::time::sleep(Duration::from_millis(60)).await;

        match rx.try_recv() {
            Ok(SessionEvent::ReassemblyTimeout(transfer)) => assert_eq!(transfer, TransferId(7)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_previous_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ReassemblyTimer::new(Duration::from_millis(40), tx);

        timer.arm(TransferId(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        timer.arm(TransferId(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::ReassemblyTimeout(TransferId(1)))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ReassemblyTimer::new(Duration::from_millis(20), tx);

        timer.arm(TransferId(3));
        timer.cancel();
        assert_eq!(timer.armed_for(), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}

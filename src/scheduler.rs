use std::time::Duration;
use tokio::{
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time,
};
use tracing::debug;

/// Delayed messages owned by the controller. Everything still waiting is
/// aborted on `cancel_all` and when the scheduler is dropped.
#[derive(Debug, Default)]
pub struct RefreshScheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `message` on `tx` after `delay`.
    pub fn schedule<T: Send + 'static>(
        &mut self,
        delay: Duration,
        tx: UnboundedSender<T>,
        message: T,
    ) {
        self.tasks.retain(|task| !task.is_finished());
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            if tx.send(message).is_err() {
                debug!("scheduled refresh receiver dropped");
            }
        });
        self.tasks.push(task);
    }

    pub fn pending(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }

    pub fn cancel_all(&mut self) {
        let cancelled = self.tasks.len();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if cancelled > 0 {
            debug!(cancelled, "scheduled refreshes cancelled");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn schedule__delivers_after_delay() {
        // given
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RefreshScheduler::new();

        // when
        scheduler.schedule(Duration::from_millis(5), tx, 7u8);
        let received = time::timeout(Duration::from_secs(2), rx.recv()).await;

        // then
        assert_eq!(received.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn cancel_all__drops_pending_messages() {
        // given
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = RefreshScheduler::new();
        scheduler.schedule(Duration::from_millis(50), tx, ());

        // when
        scheduler.cancel_all();

        // then
        assert_eq!(scheduler.pending(), 0);
        let received = time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert_eq!(received.unwrap(), None);
    }
}

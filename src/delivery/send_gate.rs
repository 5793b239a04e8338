use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Process-wide spacing between consecutive provider calls.
///
/// All senders share one gate; holding the lock while sleeping is what
/// serializes them.
pub struct SendGate {
    gap: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl SendGate {
    pub fn new(gap: Duration) -> Self {
        Self {
            gap,
            last_send: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last_send = self.last_send.lock().await;
        if let Some(last) = *last_send {
            let ready_at = last + self.gap;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_send = Some(Instant::now());
    }
}

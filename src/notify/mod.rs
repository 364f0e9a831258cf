//! Admin notification delivery: gate toggles and availability transitions
//! are posted to a configured webhook on a best-effort basis.
//!
//! A single consumer task drains a bounded channel and POSTs each message;
//! the channel itself is non-blocking (`try_send`) so a stalled webhook
//! never backs up the probe loop or admin handlers that publish into it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

const NOTIFY_BUFFER: usize = 1000;
const NOTIFY_POST_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct NotificationBus {
    tx: mpsc::Sender<String>,
}

impl NotificationBus {
    /// Build the bus and, if a webhook is configured, spawn its consumer.
    /// With no webhook, published messages are simply dropped once the
    /// channel fills (and, since nothing ever drains it, that's immediately
    /// after `NOTIFY_BUFFER` messages) — notification delivery is
    /// best-effort by design. `shutdown` mirrors the one passed to every
    /// `UpstreamSupervisor`: the consumer task exits on root-context
    /// cancellation rather than only when every sender has dropped.
    pub fn new(webhook: Option<String>, shutdown: Arc<Notify>) -> Self {
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        if let Some(webhook) = webhook {
            tokio::spawn(run_consumer(rx, webhook, shutdown));
        } else {
            drop(rx);
        }
        Self { tx }
    }

    /// Publish a notification. Never blocks — a full channel silently drops
    /// the message and counts it.
    pub fn try_publish(&self, msg: String) {
        if self.tx.try_send(msg).is_err() {
            metrics::counter!("buffy_notify_dropped_total").increment(1);
            debug!("notify: channel full or closed, message dropped");
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        (Self { tx }, rx)
    }
}

async fn run_consumer(mut rx: mpsc::Receiver<String>, webhook: String, shutdown: Arc<Notify>) {
    let client = reqwest::Client::new();
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
            _ = shutdown.notified() => {
                debug!("notify: consumer stopping");
                return;
            }
        };

        let post = client
            .post(&webhook)
            .header("content-type", "application/json")
            .body(msg.clone())
            .timeout(NOTIFY_POST_TIMEOUT)
            .send();

        match tokio::time::timeout(NOTIFY_POST_TIMEOUT, post).await {
            Ok(Ok(resp)) => {
                debug!("notify: webhook post ok, status={}", resp.status());
                metrics::counter!("buffy_notify_sent_total").increment(1);
            }
            Ok(Err(e)) => {
                warn!("notify: webhook post failed: {}", e);
                metrics::counter!("buffy_notify_failed_total").increment(1);
            }
            Err(_) => {
                warn!("notify: webhook post timed out after {:?}", NOTIFY_POST_TIMEOUT);
                metrics::counter!("buffy_notify_failed_total").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_consumer_is_observable_via_test_receiver() {
        let (bus, mut rx) = NotificationBus::new_for_test();
        bus.try_publish("hello".to_string());
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_past_capacity_drops_without_panicking() {
        let (bus, _rx) = NotificationBus::new_for_test();
        for i in 0..(NOTIFY_BUFFER + 10) {
            bus.try_publish(format!("msg-{i}"));
        }
        // No receiver draining: channel fills and later publishes are
        // dropped silently, never blocking the caller.
    }

    #[tokio::test]
    async fn publish_with_no_webhook_configured_does_not_panic() {
        let bus = NotificationBus::new(None, Arc::new(Notify::new()));
        bus.try_publish("into the void".to_string());
    }
}

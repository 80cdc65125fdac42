//! Shared fixtures for the integration scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use topic_bus::{BusEvent, MessageHandler};

/// Handler that appends everything it receives to a shared log.
pub struct Recorder {
    seen: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, routing_key: &str, payload: serde_json::Value) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((routing_key.to_string(), payload));
        }
    }
}

/// A recording handler plus a handle onto everything it has seen.
pub fn recorder() -> (Recorder, Arc<Mutex<Vec<(String, serde_json::Value)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    (
        Recorder {
            seen: Arc::clone(&seen),
        },
        seen,
    )
}

/// Await the first event satisfying `want`, skipping everything else.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<BusEvent>,
    want: impl Fn(&BusEvent) -> bool,
) -> BusEvent {
    timeout(Duration::from_millis(1_000), async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

/// Let spawned dispatch tasks drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

//! Async utilities to wait for state transitions

use std::time::Duration;

use corral_loader::events::{LoaderEvent, LoaderEventReceiver};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, sleep};

/// Poll `pred` every 20ms until it holds or `timeout` passes.
pub async fn wait_for(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    pred()
}

/// Wait for a lifecycle event matching `pred`.
pub async fn wait_for_event(
    rx: &mut LoaderEventReceiver,
    pred: impl Fn(&LoaderEvent) -> bool,
    timeout: Duration,
) -> Option<LoaderEvent> {
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(msg) if pred(&msg.event) => return Some(msg.event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

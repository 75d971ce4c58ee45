//! Device inventory watcher
//!
//! The device subsystem has no hot-plug notification, so the watcher polls
//! the port lists and emits a new [`Inventory`] whenever a name or an id
//! changed. Each emission is meant to trigger a reconciliation.
//!
//! Ids count: a device unplugged and replugged between two polls comes back
//! under the same name, but it and the ports after it are renumbered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::device::{DeviceSubsystem, Inventory};

/// Polls the device subsystem and reports inventory changes
pub struct InventoryWatcher {
    rx: mpsc::Receiver<Inventory>,
    task: JoinHandle<()>,
}

impl InventoryWatcher {
    /// Start polling every `interval`, comparing against `baseline`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(subsystem: Arc<dyn DeviceSubsystem>, interval: Duration, baseline: Inventory) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(poll_loop(subsystem, interval, baseline, tx));
        debug!("Inventory watcher started ({} ms)", interval.as_millis());
        Self { rx, task }
    }

    /// Wait for the next inventory change.
    /// Returns None if the watcher has stopped.
    pub async fn next_change(&mut self) -> Option<Inventory> {
        self.rx.recv().await
    }
}

impl Drop for InventoryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    subsystem: Arc<dyn DeviceSubsystem>,
    interval: Duration,
    mut last: Inventory,
    tx: mpsc::Sender<Inventory>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let subsystem = subsystem.clone();
        let captured = tokio::task::spawn_blocking(move || Inventory::capture(subsystem.as_ref())).await;
        let current = match captured {
            Ok(Ok(inventory)) => inventory,
            Ok(Err(e)) => {
                warn!("Device enumeration failed: {}", e);
                continue;
            },
            Err(e) => {
                warn!("Device enumeration task failed: {}", e);
                continue;
            },
        };

        if current == last {
            continue;
        }
        debug!(
            "Device inventory changed ({} in, {} out)",
            current.inputs.len(),
            current.outputs.len()
        );
        last = current.clone();
        if tx.send(current).await.is_err() {
            break;
        }
    }
}

//! Periodic call quality sampling.

use crate::transport::PeerTransport;
use callcore::quality::{CallQuality, QualitySample};
use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Samples transport statistics on a fixed interval while a call is connected
/// and publishes the classified [`CallQuality`].
pub struct QualityMonitor {
    interval: Duration,
    quality_tx: watch::Sender<CallQuality>,
    task: std::sync::Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
}

impl QualityMonitor {
    pub fn new(interval: Duration) -> Self {
        let (quality_tx, _) = watch::channel(CallQuality::Unknown);
        Self {
            interval,
            quality_tx,
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn current(&self) -> CallQuality {
        *self.quality_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallQuality> {
        self.quality_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    /// Starts sampling `peer`. A running monitor is restarted on the new peer.
    pub fn start(&self, peer: Arc<dyn PeerTransport>) {
        self.stop();

        let alive = Arc::new(AtomicBool::new(true));
        let interval = self.interval;
        let quality_tx = self.quality_tx.clone();
        let task_alive = alive.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = match peer.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        debug!(target: "Call/Quality", "Stats unavailable: {e}");
                        continue;
                    }
                };
                // A sample that resolves after stop() must not be published.
                if !task_alive.load(Ordering::Acquire) {
                    return;
                }
                let Some(sample) = QualitySample::from_stats(&stats) else {
                    continue;
                };
                let quality = sample.classify();
                debug!(
                    target: "Call/Quality",
                    "rtt={:.0}ms loss={:.3} -> {quality:?}",
                    sample.round_trip_time_ms,
                    sample.packet_loss_ratio
                );
                quality_tx.send_if_modified(|current| {
                    let changed = *current != quality;
                    *current = quality;
                    changed
                });
            }
        });

        info!(target: "Call/Quality", "Monitoring every {:?}", self.interval);
        *self.task.lock().unwrap() = Some((handle, alive));
    }

    /// Stops sampling. Idempotent.
    pub fn stop(&self) {
        if let Some((handle, alive)) = self.task.lock().unwrap().take() {
            alive.store(false, Ordering::Release);
            handle.abort();
            debug!(target: "Call/Quality", "Monitor stopped");
        }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

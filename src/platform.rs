use crate::geofence::haversine_distance;
use crate::models::LocationSample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

/// Delivery thresholds for a background sampling registration.
#[derive(Debug, Clone, Copy)]
pub struct SamplingOptions {
    pub min_interval: Duration,
    pub min_distance_meters: f64,
}

/// Options for a single position fix request. Balanced accuracy: a timed-out
/// fix is a soft failure, so we bound the wait instead of asking for maximum
/// precision.
#[derive(Debug, Clone, Copy)]
pub struct PositionOptions {
    pub timeout: Duration,
}

/// The platform permission and sampling surface the tracker runs against.
///
/// On a phone this maps to the OS location APIs; in the agent daemon it is
/// implemented by [`BridgePlatform`], which is fed device fixes over HTTP.
#[async_trait]
pub trait LocationPlatform: Send + Sync {
    fn has_foreground_permission(&self) -> bool;
    async fn request_foreground_permission(&self) -> Result<bool>;
    fn has_background_permission(&self) -> bool;
    async fn request_background_permission(&self) -> Result<bool>;

    /// Whether the platform can deliver samples while the app is not in the
    /// foreground.
    fn background_delivery_supported(&self) -> bool;

    /// Registers an always-on sampling source. Samples arrive on the
    /// returned channel until it is dropped or unregistered.
    async fn register_background_sampling(
        &self,
        options: SamplingOptions,
    ) -> Result<mpsc::Receiver<LocationSample>>;

    async fn unregister_background_sampling(&self) -> Result<()>;

    /// Requests a single position fix.
    async fn current_position(&self, options: PositionOptions) -> Result<LocationSample>;
}

/// Platform implementation fed by fixes posted to the HTTP bridge.
///
/// Background delivery forwards every posted fix that passes the
/// interval/distance thresholds; a foreground fix request simply waits for
/// the next posted fix.
pub struct BridgePlatform {
    fixes_tx: broadcast::Sender<LocationSample>,
    background_capable: bool,
    // The live forwarder task, if any. Re-registering or unregistering
    // aborts it so a stale forwarder never outlives its receiver.
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BridgePlatform {
    pub fn new(background_capable: bool) -> Self {
        let (fixes_tx, _fixes_rx) = broadcast::channel(64);
        Self {
            fixes_tx,
            background_capable,
            forwarder: Mutex::new(None),
        }
    }

    /// Feeds one device fix into the bridge. Called by the position ingest
    /// handler.
    pub fn publish(&self, sample: LocationSample) {
        match self.fixes_tx.send(sample) {
            Ok(_) => (),
            Err(_) => (), // no sampling source is listening right now
        }
    }

    pub async fn is_registered(&self) -> bool {
        self.forwarder
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl LocationPlatform for BridgePlatform {
    fn has_foreground_permission(&self) -> bool {
        // Running the agent is the foreground grant; there is no separate
        // prompt to drive on this platform.
        true
    }

    async fn request_foreground_permission(&self) -> Result<bool> {
        Ok(true)
    }

    fn has_background_permission(&self) -> bool {
        self.background_capable
    }

    async fn request_background_permission(&self) -> Result<bool> {
        Ok(self.background_capable)
    }

    fn background_delivery_supported(&self) -> bool {
        self.background_capable
    }

    async fn register_background_sampling(
        &self,
        options: SamplingOptions,
    ) -> Result<mpsc::Receiver<LocationSample>> {
        if !self.background_capable {
            anyhow::bail!("background delivery is not supported by this bridge");
        }

        let (tx, rx) = mpsc::channel(16);
        let mut fixes = self.fixes_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut last_delivered: Option<LocationSample> = None;
            let mut last_instant: Option<tokio::time::Instant> = None;
            loop {
                let sample = match fixes.recv().await {
                    Ok(sample) => sample,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Background feed lagged, skipped {skipped} fix(es)");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if let Some(at) = last_instant {
                    if at.elapsed() < options.min_interval {
                        continue;
                    }
                }
                if let Some(prev) = &last_delivered {
                    let moved = haversine_distance(
                        prev.latitude,
                        prev.longitude,
                        sample.latitude,
                        sample.longitude,
                    );
                    if moved < options.min_distance_meters {
                        continue;
                    }
                }

                last_instant = Some(tokio::time::Instant::now());
                last_delivered = Some(sample.clone());
                if tx.send(sample).await.is_err() {
                    // Receiver dropped: the registration was cancelled.
                    break;
                }
            }
        });

        if let Some(stale) = self.forwarder.lock().await.replace(task) {
            stale.abort();
        }

        Ok(rx)
    }

    async fn unregister_background_sampling(&self) -> Result<()> {
        if let Some(task) = self.forwarder.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    async fn current_position(&self, options: PositionOptions) -> Result<LocationSample> {
        let mut fixes = self.fixes_tx.subscribe();
        let sample = tokio::time::timeout(options.timeout, async {
            loop {
                match fixes.recv().await {
                    Ok(sample) => return Ok(sample),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("position feed closed")
                    }
                }
            }
        })
        .await
        .context("timed out waiting for a position fix")??;
        Ok(sample)
    }
}

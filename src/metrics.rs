use crate::models::{StatusResponse, TrackingMode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared between the tracker and the metrics endpoint.
pub struct Metrics {
    start_time: Instant,
    pub pings_persisted: AtomicU64,
    pub events_persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub position_failures: AtomicU64,
    pub open_streams: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            pings_persisted: AtomicU64::new(0),
            events_persisted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            position_failures: AtomicU64::new(0),
            open_streams: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// Increment counter by one until this StreamCounter is dropped
pub struct StreamCounter {
    counter: Arc<AtomicU64>,
}

impl StreamCounter {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);

        StreamCounter { counter }
    }
}

impl Drop for StreamCounter {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Generates metrics in Prometheus text format.
pub fn generate_metrics(metrics: &Metrics, status: &StatusResponse) -> String {
    let mut lines = Vec::new();

    lines.push("# HELP uptime_seconds Agent process uptime in seconds.".to_string());
    lines.push("# TYPE uptime_seconds gauge".to_string());
    lines.push(format!(
        "uptime_seconds {}",
        metrics.start_time.elapsed().as_secs_f64()
    ));

    lines.push("# HELP shifttrack_tracking_active Whether tracking is running.".to_string());
    lines.push("# TYPE shifttrack_tracking_active gauge".to_string());
    lines.push(format!(
        "shifttrack_tracking_active {}",
        if status.status.is_active { 1 } else { 0 }
    ));

    lines.push("# HELP shifttrack_tracking_mode Active sampling mode.".to_string());
    lines.push("# TYPE shifttrack_tracking_mode gauge".to_string());
    for (label, mode) in [
        ("none", TrackingMode::None),
        ("background", TrackingMode::Background),
        ("foreground", TrackingMode::Foreground),
    ] {
        lines.push(format!(
            "shifttrack_tracking_mode{{mode=\"{label}\"}} {}",
            if status.status.mode == mode { 1 } else { 0 }
        ));
    }

    lines.push("# HELP shifttrack_geofences Number of loaded active geofences.".to_string());
    lines.push("# TYPE shifttrack_geofences gauge".to_string());
    lines.push(format!("shifttrack_geofences {}", status.geofences));

    lines.push("# HELP shifttrack_pings_persisted Location pings stored.".to_string());
    lines.push("# TYPE shifttrack_pings_persisted counter".to_string());
    lines.push(format!(
        "shifttrack_pings_persisted {}",
        metrics.pings_persisted.load(Ordering::SeqCst)
    ));

    lines.push("# HELP shifttrack_events_persisted Geofence events stored.".to_string());
    lines.push("# TYPE shifttrack_events_persisted counter".to_string());
    lines.push(format!(
        "shifttrack_events_persisted {}",
        metrics.events_persisted.load(Ordering::SeqCst)
    ));

    lines.push(
        "# HELP shifttrack_persist_failures Soft failures while storing pings or events."
            .to_string(),
    );
    lines.push("# TYPE shifttrack_persist_failures counter".to_string());
    lines.push(format!(
        "shifttrack_persist_failures {}",
        metrics.persist_failures.load(Ordering::SeqCst)
    ));

    lines.push("# HELP shifttrack_position_failures Failed or timed-out position fixes.".to_string());
    lines.push("# TYPE shifttrack_position_failures counter".to_string());
    lines.push(format!(
        "shifttrack_position_failures {}",
        metrics.position_failures.load(Ordering::SeqCst)
    ));

    lines.push("# HELP shifttrack_open_sse_streams Number of open SSE client streams.".to_string());
    lines.push("# TYPE shifttrack_open_sse_streams gauge".to_string());
    lines.push(format!(
        "shifttrack_open_sse_streams {}",
        metrics.open_streams.load(Ordering::SeqCst)
    ));

    lines.push("# HELP shifttrack_info Build information about the tracking agent.".to_string());
    lines.push("# TYPE shifttrack_info gauge".to_string());
    lines.push(format!(
        "shifttrack_info{{version=\"{}\"}} 1",
        crate::version::VERSION
    ));

    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TrackingConfiguration, TrackingStatus};

    #[test]
    fn stream_counter_tracks_open_streams() {
        let metrics = Metrics::new();
        {
            let _a = StreamCounter::new(metrics.open_streams.clone());
            let _b = StreamCounter::new(metrics.open_streams.clone());
            assert_eq!(metrics.open_streams.load(Ordering::SeqCst), 2);
        }
        assert_eq!(metrics.open_streams.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn renders_mode_and_counters() {
        let metrics = Metrics::new();
        metrics.pings_persisted.fetch_add(3, Ordering::SeqCst);
        let status = StatusResponse {
            status: TrackingStatus {
                is_active: true,
                mode: TrackingMode::Foreground,
            },
            settings: TrackingConfiguration::default(),
            geofences: 2,
            has_permission: true,
            background_supported: false,
        };

        let text = generate_metrics(&metrics, &status);
        assert!(text.contains("shifttrack_tracking_active 1"));
        assert!(text.contains("shifttrack_tracking_mode{mode=\"foreground\"} 1"));
        assert!(text.contains("shifttrack_tracking_mode{mode=\"background\"} 0"));
        assert!(text.contains("shifttrack_pings_persisted 3"));
        assert!(text.contains("shifttrack_geofences 2"));
    }
}

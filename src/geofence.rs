use crate::backend::TrackingBackend;
use crate::models::{Geofence, GeofenceEvent, GeofenceEventType};
use std::collections::HashMap;
use std::sync::Arc;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance in meters between two coordinates, by the
/// haversine formula.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Evaluates position samples against the organization's geofence set.
///
/// Holds the per-geofence membership state for the current process lifetime.
/// Membership starts as "outside" for every geofence, so a device that is
/// already inside a geofence at startup emits one enter event on its first
/// evaluated sample.
pub struct GeofenceEngine {
    backend: Arc<dyn TrackingBackend>,
    company_id: Option<String>,
    geofences: Vec<Geofence>,
    membership: HashMap<String, bool>,
}

impl GeofenceEngine {
    pub fn new(backend: Arc<dyn TrackingBackend>) -> Self {
        Self {
            backend,
            company_id: None,
            geofences: Vec::new(),
            membership: HashMap::new(),
        }
    }

    /// Loads the active geofence set for an organization.
    ///
    /// A fetch failure leaves the set empty: location tracking must keep
    /// running even when geofences are unavailable.
    pub async fn initialize(&mut self, company_id: &str) {
        self.company_id = Some(company_id.to_string());
        self.refresh().await;
    }

    /// Re-fetches the geofence set without resetting membership state.
    ///
    /// A geofence removed mid-session simply stops being evaluated; a newly
    /// added one starts out assumed "outside".
    pub async fn refresh(&mut self) {
        let Some(company_id) = self.company_id.clone() else {
            return;
        };
        match self.backend.fetch_active_geofences(&company_id).await {
            Ok(geofences) => {
                log::debug!(
                    "Loaded {} active geofence(s) for company {company_id}",
                    geofences.len()
                );
                self.geofences = geofences;
            }
            Err(err) => {
                log::warn!("Failed to fetch geofences for company {company_id}: {err:#}");
            }
        }
    }

    /// Evaluates one sample against every active geofence and returns the
    /// enter/exit transitions it caused.
    ///
    /// Geofences are independent: a single sample can produce between 0 and
    /// N events. Membership state is updated whether or not an event fired.
    pub fn evaluate(&mut self, latitude: f64, longitude: f64) -> Vec<GeofenceEvent> {
        let mut events = Vec::new();
        for fence in self.geofences.iter().filter(|f| f.is_active) {
            let distance =
                haversine_distance(latitude, longitude, fence.latitude, fence.longitude);
            let inside = distance <= fence.radius_meters;
            let was_inside = self
                .membership
                .get(&fence.id)
                .copied()
                .unwrap_or(false);

            if inside != was_inside {
                events.push(GeofenceEvent {
                    geofence_id: fence.id.clone(),
                    event_type: if inside {
                        GeofenceEventType::Enter
                    } else {
                        GeofenceEventType::Exit
                    },
                    latitude,
                    longitude,
                    distance_from_center_meters: distance,
                });
            }
            self.membership.insert(fence.id.clone(), inside);
        }
        events
    }

    /// Display name for a geofence; falls back to a fixed label when the id
    /// is unknown (e.g. the geofence was removed after an event fired).
    pub fn geofence_name(&self, geofence_id: &str) -> String {
        self.geofences
            .iter()
            .find(|f| f.id == geofence_id)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "Unknown geofence".to_string())
    }

    pub fn geofence_count(&self) -> usize {
        self.geofences.len()
    }

    /// Read-only snapshot of the current membership state.
    pub fn membership(&self) -> HashMap<String, bool> {
        self.membership.clone()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A circular region (center + radius) used to detect device entry/exit.
///
/// Immutable from the tracker's point of view within a session; the active
/// set is refreshed wholesale from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    pub is_active: bool,
}

/// A raw position fix produced by the sampling source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSample {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "acc")]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceEventType {
    Enter,
    Exit,
}

impl std::fmt::Display for GeofenceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeofenceEventType::Enter => write!(f, "enter"),
            GeofenceEventType::Exit => write!(f, "exit"),
        }
    }
}

/// A discrete enter/exit transition detected for one geofence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub geofence_id: String,
    pub event_type: GeofenceEventType,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_from_center_meters: f64,
}

/// Per-organization tracking settings, owned by the backend and cached by
/// the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfiguration {
    pub location_tracking_enabled: bool,
    pub ping_interval_seconds: u64,
    pub ping_distance_meters: f64,
    pub geofencing_enabled: bool,
}

impl Default for TrackingConfiguration {
    /// Fallback settings used until a configuration fetch succeeds.
    fn default() -> Self {
        Self {
            location_tracking_enabled: true,
            ping_interval_seconds: 30,
            ping_distance_meters: 50.0,
            geofencing_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    None,
    Background,
    Foreground,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub is_active: bool,
    pub mode: TrackingMode,
}

/// The user/organization context the tracker persists against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub company_id: String,
}

/// A persisted raw location sample, tagged with the active timesheet when
/// one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationPing {
    pub user_id: String,
    pub company_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timesheet_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// One message on the live update feed consumed by the admin dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerUpdate {
    Ping { ping: LocationPing },
    Geofence { event: GeofenceEvent, geofence_name: String },
}

// ========================
// API Request and Response Models
// ========================

/// Request body for the /api/position endpoint (device bridge).
#[derive(Debug, Serialize, Deserialize)]
pub struct PositionRequest {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "acc")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PositionRequest {
    pub fn into_sample(self) -> LocationSample {
        LocationSample {
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            accuracy: self.accuracy,
        }
    }
}

/// Response body for the /api/status endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: TrackingStatus,
    pub settings: TrackingConfiguration,
    pub geofences: usize,
    pub has_permission: bool,
    pub background_supported: bool,
}

/// Request body for the /api/user endpoint. A null user pauses persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    pub user: Option<UserContext>,
}

/// Response body for the clock in/out endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClockResponse {
    pub timesheet_id: Option<String>,
}

use crate::models::{Geofence, GeofenceEvent, LocationPing, TrackingConfiguration, UserContext};
use anyhow::Result;
use async_trait::async_trait;

/// The backend collaborator the tracker persists through and loads
/// configuration from.
///
/// Every operation is fallible; callers treat failures as soft (logged,
/// degraded) rather than fatal, so implementations should return errors
/// instead of panicking.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    /// Per-organization tracking settings.
    async fn fetch_tracking_configuration(
        &self,
        company_id: &str,
    ) -> Result<TrackingConfiguration>;

    /// The active geofence set for an organization.
    async fn fetch_active_geofences(&self, company_id: &str) -> Result<Vec<Geofence>>;

    /// Durably store one raw location ping.
    async fn persist_location_ping(&self, ping: &LocationPing) -> Result<()>;

    /// Durably store a batch of geofence events, tagged with the user and
    /// organization they were detected for.
    async fn persist_geofence_events(
        &self,
        user: &UserContext,
        events: &[GeofenceEvent],
    ) -> Result<()>;

    /// The id of the open (un-closed) timesheet for a user, if any.
    async fn query_active_timesheet(&self, user: &UserContext) -> Result<Option<String>>;
}

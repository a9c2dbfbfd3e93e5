use crate::backend::TrackingBackend;
use crate::models::{Geofence, GeofenceEvent, LocationPing, TrackingConfiguration, UserContext};
use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use turso::{Builder, Connection, Row};

fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Turso (SQLite) implementation of the tracking backend.
///
/// In production the org settings, geofences and timesheets live in the
/// managed backend; the agent talks to this local store through the same
/// [`TrackingBackend`] contract.
pub struct DbBackend {
    conn: Arc<Mutex<Connection>>, // Persist the connection
    db_file: PathBuf,
}

impl DbBackend {
    /// Creates a new `DbBackend` and initializes the database schema.
    pub async fn new(db_file: &Path) -> Result<Self> {
        let turso_db_client = Arc::new(
            Builder::new_local(db_file.to_str().ok_or_else(|| {
                anyhow::anyhow!("Cannot convert path name to unicode: {:?}", db_file)
            })?)
            .build()
            .await
            .with_context(|| {
                format!("Failed to open db (and/or its wal file). File name: {db_file:?}")
            })?,
        );

        let conn = Arc::new(Mutex::new(turso_db_client.connect()?));

        let client = DbBackend {
            conn,
            db_file: PathBuf::from(db_file),
        };
        client
            .init_db()
            .await
            .with_context(|| format!("Failed to init db file {db_file:?} (and/or its wal file)"))?;
        Ok(client)
    }

    /// Initializes the schema if it doesn't already exist.
    async fn init_db(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tracking_settings (
                company_id TEXT PRIMARY KEY,
                location_tracking_enabled BOOL NOT NULL,
                ping_interval_seconds INTEGER NOT NULL,
                ping_distance_meters REAL NOT NULL,
                geofencing_enabled BOOL NOT NULL
            )",
            (),
        )
        .await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS geofences (
                id TEXT PRIMARY KEY,
                company_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                radius_meters REAL NOT NULL,
                is_active BOOL NOT NULL
            )",
            (),
        )
        .await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS timesheets (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                company_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT
            )",
            (),
        )
        .await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS location_pings (
                user_id TEXT NOT NULL,
                company_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy REAL,
                timesheet_id TEXT,
                recorded_at TEXT NOT NULL
            )",
            (),
        )
        .await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS geofence_events (
                geofence_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                company_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                distance_from_center_meters REAL NOT NULL,
                recorded_at TEXT NOT NULL
            )",
            (),
        )
        .await?;
        Ok(())
    }

    /// Inserts the default settings row for an organization if none exists,
    /// so the first configuration fetch succeeds on a fresh database.
    pub async fn ensure_settings(&self, company_id: &str) -> Result<()> {
        if self.fetch_tracking_configuration(company_id).await.is_ok() {
            return Ok(());
        }
        self.set_tracking_configuration(company_id, &TrackingConfiguration::default())
            .await
    }

    /// Replaces the settings row for an organization. The tracker picks the
    /// change up on its next settings poll.
    pub async fn set_tracking_configuration(
        &self,
        company_id: &str,
        settings: &TrackingConfiguration,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM tracking_settings WHERE company_id = ?",
            (company_id.to_string(),),
        )
        .await
        .with_context(|| format!("Failed to clear settings. File name: {:?}", self.db_file))?;
        conn.execute(
            "INSERT INTO tracking_settings
             (company_id, location_tracking_enabled, ping_interval_seconds, ping_distance_meters, geofencing_enabled)
             VALUES (?, ?, ?, ?, ?)",
            (
                company_id.to_string(),
                settings.location_tracking_enabled,
                settings.ping_interval_seconds,
                settings.ping_distance_meters,
                settings.geofencing_enabled,
            ),
        )
        .await
        .with_context(|| format!("Failed to store settings. File name: {:?}", self.db_file))?;
        Ok(())
    }

    /// Inserts or replaces a geofence definition.
    pub async fn upsert_geofence(&self, company_id: &str, geofence: &Geofence) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM geofences WHERE id = ?", (geofence.id.clone(),))
            .await
            .with_context(|| {
                format!("Failed to clear geofence. File name: {:?}", self.db_file)
            })?;
        conn.execute(
            "INSERT INTO geofences
             (id, company_id, name, description, latitude, longitude, radius_meters, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                geofence.id.clone(),
                company_id.to_string(),
                geofence.name.clone(),
                geofence.description.clone(),
                geofence.latitude,
                geofence.longitude,
                geofence.radius_meters,
                geofence.is_active,
            ),
        )
        .await
        .with_context(|| format!("Failed to store geofence. File name: {:?}", self.db_file))?;
        Ok(())
    }

    /// Opens a timesheet for the user, or returns the already-open one.
    pub async fn clock_in(&self, user: &UserContext) -> Result<String> {
        if let Some(open) = self.query_active_timesheet(user).await? {
            return Ok(open);
        }
        let id = generate_id();
        self.conn
            .lock()
            .await
            .execute(
                "INSERT INTO timesheets (id, user_id, company_id, started_at, ended_at)
                 VALUES (?, ?, ?, ?, NULL)",
                (
                    id.clone(),
                    user.user_id.clone(),
                    user.company_id.clone(),
                    Utc::now().to_rfc3339(),
                ),
            )
            .await
            .with_context(|| {
                format!("Failed to open timesheet. File name: {:?}", self.db_file)
            })?;
        Ok(id)
    }

    /// Closes the open timesheet for the user, if any, returning its id.
    pub async fn clock_out(&self, user: &UserContext) -> Result<Option<String>> {
        let open = self.query_active_timesheet(user).await?;
        if let Some(id) = &open {
            self.conn
                .lock()
                .await
                .execute(
                    "UPDATE timesheets SET ended_at = ? WHERE id = ?",
                    (Utc::now().to_rfc3339(), id.clone()),
                )
                .await
                .with_context(|| {
                    format!("Failed to close timesheet. File name: {:?}", self.db_file)
                })?;
        }
        Ok(open)
    }

    /// Helper function to convert a `turso::rows::Row` into a `Geofence`.
    fn map_row_to_geofence(row: Row) -> Result<Geofence> {
        Ok(Geofence {
            id: row.get::<String>(0)?,
            name: row.get::<String>(1)?,
            description: row.get::<Option<String>>(2)?,
            latitude: row.get::<f64>(3)?,
            longitude: row.get::<f64>(4)?,
            radius_meters: row.get::<f64>(5)?,
            is_active: row.get::<bool>(6)?,
        })
    }
}

#[async_trait]
impl TrackingBackend for DbBackend {
    async fn fetch_tracking_configuration(
        &self,
        company_id: &str,
    ) -> Result<TrackingConfiguration> {
        let mut results = self
            .conn
            .lock()
            .await
            .query(
                "SELECT location_tracking_enabled, ping_interval_seconds, ping_distance_meters, geofencing_enabled
                 FROM tracking_settings WHERE company_id = ?",
                (company_id.to_string(),),
            )
            .await
            .with_context(|| {
                format!("Failed to load settings. File name: {:?}", self.db_file)
            })?;
        let row = results
            .next()
            .await?
            .ok_or_else(|| anyhow::anyhow!("No tracking settings for company {company_id}"))?;
        Ok(TrackingConfiguration {
            location_tracking_enabled: row.get::<bool>(0)?,
            ping_interval_seconds: row.get::<u64>(1)?,
            ping_distance_meters: row.get::<f64>(2)?,
            geofencing_enabled: row.get::<bool>(3)?,
        })
    }

    async fn fetch_active_geofences(&self, company_id: &str) -> Result<Vec<Geofence>> {
        let mut results = self
            .conn
            .lock()
            .await
            .query(
                "SELECT id, name, description, latitude, longitude, radius_meters, is_active
                 FROM geofences WHERE company_id = ? AND is_active = 1",
                (company_id.to_string(),),
            )
            .await
            .with_context(|| {
                format!("Failed to load geofences. File name: {:?}", self.db_file)
            })?;
        let mut rows = Vec::new();
        while let Some(row) = results.next().await? {
            rows.push(Self::map_row_to_geofence(row)?);
        }
        Ok(rows)
    }

    async fn persist_location_ping(&self, ping: &LocationPing) -> Result<()> {
        self.conn
            .lock()
            .await
            .execute(
                "INSERT INTO location_pings
                 (user_id, company_id, latitude, longitude, accuracy, timesheet_id, recorded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    ping.user_id.clone(),
                    ping.company_id.clone(),
                    ping.latitude,
                    ping.longitude,
                    ping.accuracy,
                    ping.timesheet_id.clone(),
                    ping.recorded_at.to_rfc3339(),
                ),
            )
            .await
            .with_context(|| {
                format!("Failed to insert location ping. File name: {:?}", self.db_file)
            })?;
        Ok(())
    }

    async fn persist_geofence_events(
        &self,
        user: &UserContext,
        events: &[GeofenceEvent],
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        for event in events {
            conn.execute(
                "INSERT INTO geofence_events
                 (geofence_id, user_id, company_id, event_type, latitude, longitude, distance_from_center_meters, recorded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    event.geofence_id.clone(),
                    user.user_id.clone(),
                    user.company_id.clone(),
                    event.event_type.to_string(),
                    event.latitude,
                    event.longitude,
                    event.distance_from_center_meters,
                    Utc::now().to_rfc3339(),
                ),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to insert geofence event. File name: {:?}",
                    self.db_file
                )
            })?;
        }
        Ok(())
    }

    async fn query_active_timesheet(&self, user: &UserContext) -> Result<Option<String>> {
        let mut results = self
            .conn
            .lock()
            .await
            .query(
                "SELECT id FROM timesheets
                 WHERE user_id = ? AND company_id = ? AND ended_at IS NULL
                 ORDER BY started_at DESC LIMIT 1",
                (user.user_id.clone(), user.company_id.clone()),
            )
            .await
            .with_context(|| {
                format!("Failed to query timesheets. File name: {:?}", self.db_file)
            })?;
        match results.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }
}

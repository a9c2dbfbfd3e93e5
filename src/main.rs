use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod backend;
mod db;
mod geofence;
mod handlers;
mod metrics;
mod models;
mod platform;
mod tracker;
mod version;

/// Shared application state handed to every handler. The tracker serializes
/// its own internals, so no outer lock is needed here.
pub struct AppState {
    pub tracker: tracker::LocationTracker,
    pub bridge: Arc<platform::BridgePlatform>,
    pub db: Arc<db::DbBackend>,
    pub metrics: Arc<metrics::Metrics>,
}

/// Command line configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// IP address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the SQLite database file
    #[arg(long, default_value = "shifttrack.db")]
    database_file: PathBuf,

    /// Organization the agent tracks for
    #[arg(long)]
    company_id: String,

    /// User the agent tracks for
    #[arg(long)]
    user_id: String,

    /// Whether the device bridge delivers fixes while the app is backgrounded.
    /// Without this flag the tracker exercises the foreground polling fallback.
    #[arg(long)]
    background_capable: bool,

    /// Begin tracking immediately instead of waiting for /api/tracking/start
    #[arg(long)]
    autostart: bool,

    /// How often to poll the backend for settings and geofence changes
    #[arg(long, default_value = "60s")]
    settings_poll_interval: humantime::Duration,

    /// How long to wait for a single position fix in foreground polling mode
    #[arg(long, default_value = "10s")]
    position_timeout: humantime::Duration,
}

async fn real_main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_line_number(true)
        .with_target(true)
        .init();

    info!("Initializing");

    let config = Config::parse();

    info!("Configuration: {config:?}"); // Log the parsed configuration

    let db = Arc::new(db::DbBackend::new(&config.database_file).await?);
    db.ensure_settings(&config.company_id).await?;

    let bridge = Arc::new(platform::BridgePlatform::new(config.background_capable));
    let metrics = Arc::new(metrics::Metrics::new());
    let tracker = tracker::LocationTracker::new(
        db.clone(),
        bridge.clone(),
        metrics.clone(),
        config.position_timeout.into(),
    );
    tracker
        .initialize(models::UserContext {
            user_id: config.user_id.clone(),
            company_id: config.company_id.clone(),
        })
        .await;

    // Registered once at bootstrap; runs for the process lifetime.
    let _settings_poll = tracker.spawn_settings_poll(config.settings_poll_interval.into());

    if config.autostart {
        let status = tracker.start_tracking().await?;
        info!("Tracking autostarted: {status:?}");
    }

    let app_state = web::Data::new(AppState {
        tracker,
        bridge,
        db,
        metrics,
    });

    info!("Starting server on {}:{}", config.address, config.port);

    // Start the HTTP server.
    Ok(HttpServer::new(move || {
        // Configure CORS to allow cross-origin requests from any origin.
        let cors = Cors::permissive();

        App::new()
            .wrap(TracingLogger::default())
            .wrap(cors)
            .app_data(app_state.clone())
            .service(handlers::start_tracking)
            .service(handlers::stop_tracking)
            .service(handlers::tracking_status)
            .service(handlers::refresh_settings)
            .service(handlers::update_user)
            .service(handlers::post_position)
            .service(handlers::clock_in)
            .service(handlers::clock_out)
            .service(handlers::upsert_geofence)
            .service(handlers::set_settings)
            .service(handlers::stream)
            .service(handlers::prometheus_metrics)
    })
    .bind((config.address.as_str(), config.port))? // Use parsed address and port
    .run()
    .await?)
}

#[actix_web::main]
async fn main() -> std::process::ExitCode {
    match real_main().await {
        Ok(()) => std::process::ExitCode::from(0),
        Err(err) => {
            error!("{err}");
            std::process::ExitCode::from(10)
        }
    }
}

use crate::AppState;
use crate::metrics::{self, StreamCounter};
use crate::models::{
    ClockResponse, Geofence, PositionRequest, TrackingConfiguration, UpdateUserRequest,
};
use actix_web::{HttpResponse, Responder, web};
use tokio_stream::wrappers::BroadcastStream;

/// Handler for the `/api/tracking/start` endpoint.
///
/// Foreground permission denial is the one error surfaced to the caller, so
/// the UI can drive a prompt; everything else ends in some tracking state.
#[actix_web::post("/api/tracking/start")]
pub async fn start_tracking(state: web::Data<AppState>) -> actix_web::Result<impl Responder> {
    match state.tracker.start_tracking().await {
        Ok(status) => Ok(web::Json(status)),
        Err(err) => Err(actix_web::error::ErrorForbidden(err.to_string())),
    }
}

/// Handler for the `/api/tracking/stop` endpoint.
#[actix_web::post("/api/tracking/stop")]
pub async fn stop_tracking(state: web::Data<AppState>) -> impl Responder {
    state.tracker.stop_tracking().await;
    web::Json(state.tracker.tracking_status().await)
}

/// Handler for the `/api/tracking/status` endpoint.
#[actix_web::get("/api/tracking/status")]
pub async fn tracking_status(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.tracker.status_response().await)
}

/// Handler for the `/api/tracking/refresh` endpoint. Forces a settings and
/// geofence re-fetch outside the periodic poll.
#[actix_web::post("/api/tracking/refresh")]
pub async fn refresh_settings(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.tracker.refresh_location_settings().await)
}

/// Handler for the `/api/user` endpoint. A null user pauses persistence
/// without tearing down an already-registered sampling source.
#[actix_web::post("/api/user")]
pub async fn update_user(
    data: web::Json<UpdateUserRequest>,
    state: web::Data<AppState>,
) -> impl Responder {
    state.tracker.update_user(data.into_inner().user).await;
    HttpResponse::NoContent().finish()
}

/// Handler for the `/api/position` endpoint.
///
/// Device clients post raw fixes here; the bridge fans them out to whichever
/// sampling source is active.
#[actix_web::post("/api/position")]
pub async fn post_position(
    data: web::Json<PositionRequest>,
    state: web::Data<AppState>,
) -> impl Responder {
    state.bridge.publish(data.into_inner().into_sample());
    HttpResponse::Accepted().finish()
}

/// Handler for the `/api/clock/in` endpoint. Opens a timesheet for the
/// current user (or returns the already-open one).
#[actix_web::post("/api/clock/in")]
pub async fn clock_in(state: web::Data<AppState>) -> actix_web::Result<impl Responder> {
    let Some(user) = state.tracker.current_user().await else {
        return Err(actix_web::error::ErrorConflict("No user context."));
    };
    let timesheet_id = state
        .db
        .clock_in(&user)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(web::Json(ClockResponse {
        timesheet_id: Some(timesheet_id),
    }))
}

/// Handler for the `/api/clock/out` endpoint.
#[actix_web::post("/api/clock/out")]
pub async fn clock_out(state: web::Data<AppState>) -> actix_web::Result<impl Responder> {
    let Some(user) = state.tracker.current_user().await else {
        return Err(actix_web::error::ErrorConflict("No user context."));
    };
    let timesheet_id = state
        .db
        .clock_out(&user)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(web::Json(ClockResponse { timesheet_id }))
}

/// Handler for the `/api/geofences` endpoint. Upserts a geofence definition
/// and reloads the tracker's set immediately.
#[actix_web::post("/api/geofences")]
pub async fn upsert_geofence(
    data: web::Json<Geofence>,
    state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    let geofence = data.into_inner();
    if geofence.radius_meters <= 0.0 {
        return Err(actix_web::error::ErrorBadRequest(
            "radius_meters must be positive.",
        ));
    }
    let Some(user) = state.tracker.current_user().await else {
        return Err(actix_web::error::ErrorConflict("No user context."));
    };
    state
        .db
        .upsert_geofence(&user.company_id, &geofence)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    state.tracker.refresh_location_settings().await;
    Ok(HttpResponse::NoContent().finish())
}

/// Handler for the `/api/settings` endpoint. Stores new organization
/// settings and applies them right away instead of waiting for the poll.
#[actix_web::post("/api/settings")]
pub async fn set_settings(
    data: web::Json<TrackingConfiguration>,
    state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    let Some(user) = state.tracker.current_user().await else {
        return Err(actix_web::error::ErrorConflict("No user context."));
    };
    state
        .db
        .set_tracking_configuration(&user.company_id, &data.into_inner())
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    Ok(web::Json(state.tracker.refresh_location_settings().await))
}

/// Handler for the `/api/stream` endpoint: SSE feed of persisted pings and
/// geofence events for the dashboard.
#[actix_web::get("/api/stream")]
pub async fn stream(state: web::Data<AppState>) -> actix_web::Result<impl Responder> {
    let counter = StreamCounter::new(state.metrics.open_streams.clone());
    let updates = BroadcastStream::new(state.tracker.subscribe());

    let events = async_stream::stream! {
        // Keep the gauge incremented for as long as the client stays
        // connected.
        let _counter = counter;
        let mut updates = std::pin::pin!(updates);
        while let Some(update) = futures_util::StreamExt::next(&mut updates).await {
            yield update;
        }
    };

    let events = futures_util::StreamExt::map(
        events,
        |update| -> anyhow::Result<actix_web_lab::sse::Event> {
            let update = update?;
            let json_data = serde_json::to_string(&update)?;
            Ok(actix_web_lab::sse::Event::Data(
                actix_web_lab::sse::Data::new(json_data),
            ))
        },
    );

    Ok(actix_web_lab::sse::Sse::from_stream(events)
        .with_keep_alive(std::time::Duration::from_secs(5)))
}

/// Handler for the `/metrics` endpoint (Prometheus text format).
#[actix_web::get("/metrics")]
pub async fn prometheus_metrics(state: web::Data<AppState>) -> impl Responder {
    let status = state.tracker.status_response().await;
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::generate_metrics(&state.metrics, &status))
}

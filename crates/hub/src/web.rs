//! HTTP + WebSocket surface. Readings, pump activations, and predictive
//! alerts come in here; notifications go out over `/ws`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::db::{now_unix, Db, IrrigationKind};
use crate::detector::{DetectionParams, GreenhouseLocks};
use crate::dispatch::{Dispatcher, NotificationWire};
use crate::error::HubError;
use crate::ingest::{self, IngestReading};
use crate::notify::{self, NotificationKind};
use crate::events;
use crate::sessions::SharedSessions;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

pub struct AppContext {
    pub db: Db,
    pub sessions: SharedSessions,
    pub dispatcher: Dispatcher,
    pub locks: GreenhouseLocks,
    pub params: DetectionParams,
    pub started_at: Instant,
}

pub type SharedContext = Arc<AppContext>;

impl AppContext {
    pub fn shared(db: Db, sessions: SharedSessions, params: DetectionParams) -> SharedContext {
        let dispatcher = Dispatcher::new(db.clone(), sessions.clone());
        Arc::new(Self {
            db,
            sessions,
            dispatcher,
            locks: GreenhouseLocks::default(),
            params,
            started_at: Instant::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AlreadyConfirmed(_) => StatusCode::CONFLICT,
            Self::Delivery(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {self:#}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/api/readings", post(post_reading))
        .route("/api/pump/activations", post(post_pump_activation))
        .route("/api/predictions", post(post_prediction))
        .route("/api/events", get(list_events))
        .route("/api/events/{id}/confirm", post(confirm_event))
        .route(
            "/api/notifications",
            get(list_notifications).delete(cleanup_notifications),
        )
        .route("/api/notifications/{id}/read", post(mark_read))
        .route("/api/notifications/read-all", post(mark_all_read))
        .route("/api/notifications/{id}", delete(delete_notification))
        .route("/api/status", get(api_status))
        .route("/ws", get(ws_upgrade))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Ingest + signals
// ---------------------------------------------------------------------------

async fn post_reading(
    State(ctx): State<SharedContext>,
    Json(input): Json<IngestReading>,
) -> Result<impl IntoResponse, HubError> {
    let stored = ingest::ingest_reading(
        &ctx.db,
        &ctx.locks,
        ctx.params,
        &ctx.dispatcher,
        input,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Debug, Deserialize)]
struct PumpActivation {
    greenhouse_id: String,
    duration_seconds: i64,
    water_amount_liters: f64,
    reason: String,
}

/// A pump command is a known event, not an inferred one — it enters at the
/// notification generator and skips the detector entirely.
async fn post_pump_activation(
    State(ctx): State<SharedContext>,
    Json(signal): Json<PumpActivation>,
) -> Result<impl IntoResponse, HubError> {
    if signal.duration_seconds < 0 {
        return Err(HubError::Validation(format!(
            "duration_seconds must be non-negative, got {}",
            signal.duration_seconds
        )));
    }
    if !signal.water_amount_liters.is_finite() || signal.water_amount_liters < 0.0 {
        return Err(HubError::Validation(format!(
            "water_amount_liters must be a non-negative number, got {}",
            signal.water_amount_liters
        )));
    }

    let greenhouse = ctx
        .db
        .get_greenhouse(&signal.greenhouse_id)
        .await?
        .ok_or_else(|| HubError::not_found("greenhouse", signal.greenhouse_id.clone()))?;

    let event = events::create_automatic(
        &ctx.db,
        &greenhouse.greenhouse_id,
        signal.duration_seconds,
        signal.water_amount_liters,
        &signal.reason,
        now_unix(),
    )
    .await?;

    let draft = notify::pump_activated(
        &greenhouse,
        &event,
        signal.duration_seconds,
        signal.water_amount_liters,
        &signal.reason,
    );
    let notification = ctx.dispatcher.dispatch(&greenhouse.owner_user_id, draft).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "event": event,
            "notification": NotificationWire::from_notification(&notification),
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct PredictionAlert {
    greenhouse_id: String,
    current_moisture: f64,
    predicted_moisture: f64,
    hours_until_dry: f64,
    confidence: f64,
}

async fn post_prediction(
    State(ctx): State<SharedContext>,
    Json(signal): Json<PredictionAlert>,
) -> Result<impl IntoResponse, HubError> {
    for (name, v) in [
        ("current_moisture", signal.current_moisture),
        ("predicted_moisture", signal.predicted_moisture),
        ("hours_until_dry", signal.hours_until_dry),
    ] {
        if !v.is_finite() {
            return Err(HubError::Validation(format!("{name} must be finite")));
        }
    }
    if !(0.0..=1.0).contains(&signal.confidence) {
        return Err(HubError::Validation(format!(
            "confidence must be within [0, 1], got {}",
            signal.confidence
        )));
    }

    let greenhouse = ctx
        .db
        .get_greenhouse(&signal.greenhouse_id)
        .await?
        .ok_or_else(|| HubError::not_found("greenhouse", signal.greenhouse_id.clone()))?;

    let draft = notify::lstm_prediction(
        &greenhouse,
        signal.current_moisture,
        signal.predicted_moisture,
        signal.hours_until_dry,
        signal.confidence,
    );
    let notification = ctx.dispatcher.dispatch(&greenhouse.owner_user_id, draft).await?;

    Ok((
        StatusCode::CREATED,
        Json(NotificationWire::from_notification(&notification)),
    ))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventsQuery {
    greenhouse_id: Option<String>,
    kind: Option<String>,
    limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

async fn list_events(
    State(ctx): State<SharedContext>,
    Query(q): Query<EventsQuery>,
) -> Result<impl IntoResponse, HubError> {
    let kind = match q.kind.as_deref() {
        None => None,
        Some(s) => Some(
            IrrigationKind::parse(s)
                .ok_or_else(|| HubError::Validation(format!("unknown event kind '{s}'")))?,
        ),
    };

    let events = ctx
        .db
        .list_events(q.greenhouse_id.as_deref(), kind, clamp_limit(q.limit))
        .await?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct ConfirmRequest {
    final_kind: String,
    water_amount_liters: Option<f64>,
    notes: Option<String>,
}

async fn confirm_event(
    State(ctx): State<SharedContext>,
    Path(id): Path<i64>,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, HubError> {
    let final_kind = IrrigationKind::parse(&req.final_kind).ok_or_else(|| {
        HubError::Validation(format!("unknown final kind '{}'", req.final_kind))
    })?;

    let event = events::confirm(
        &ctx.db,
        id,
        final_kind,
        req.water_amount_liters,
        req.notes.as_deref(),
    )
    .await?;

    // The confirmation itself already succeeded; the follow-up notification
    // is best-effort.
    match ctx.db.get_greenhouse(&event.greenhouse_id).await {
        Ok(Some(greenhouse)) => {
            let draft = notify::irrigation_confirmed(&greenhouse, &event);
            if let Err(e) = ctx.dispatcher.dispatch(&greenhouse.owner_user_id, draft).await {
                error!(event_id = id, "confirmation notification failed: {e:#}");
            }
        }
        Ok(None) => debug!(event_id = id, "greenhouse gone, skipping confirm notification"),
        Err(e) => error!(event_id = id, "greenhouse lookup failed: {e:#}"),
    }

    Ok(Json(event))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NotificationsQuery {
    user_id: String,
    kind: Option<String>,
    #[serde(default)]
    unread: bool,
    limit: Option<i64>,
}

async fn list_notifications(
    State(ctx): State<SharedContext>,
    Query(q): Query<NotificationsQuery>,
) -> Result<impl IntoResponse, HubError> {
    let kind = match q.kind.as_deref() {
        None => None,
        Some(s) => Some(
            NotificationKind::parse(s)
                .ok_or_else(|| HubError::Validation(format!("unknown notification kind '{s}'")))?,
        ),
    };

    let notifications = ctx
        .dispatcher
        .list(&q.user_id, kind, q.unread, clamp_limit(q.limit))
        .await?;
    let wire: Vec<NotificationWire> = notifications
        .iter()
        .map(NotificationWire::from_notification)
        .collect();
    Ok(Json(wire))
}

async fn mark_read(
    State(ctx): State<SharedContext>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, HubError> {
    let notification = ctx.dispatcher.mark_read(id).await?;
    Ok(Json(NotificationWire::from_notification(&notification)))
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn mark_all_read(
    State(ctx): State<SharedContext>,
    Query(q): Query<UserQuery>,
) -> Result<impl IntoResponse, HubError> {
    let marked = ctx.dispatcher.mark_all_read(&q.user_id).await?;
    Ok(Json(json!({ "marked": marked })))
}

async fn delete_notification(
    State(ctx): State<SharedContext>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, HubError> {
    ctx.dispatcher.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    older_than_days: i64,
}

async fn cleanup_notifications(
    State(ctx): State<SharedContext>,
    Query(q): Query<CleanupQuery>,
) -> Result<impl IntoResponse, HubError> {
    if q.older_than_days < 1 {
        return Err(HubError::Validation(format!(
            "older_than_days must be at least 1, got {}",
            q.older_than_days
        )));
    }
    let deleted = ctx.dispatcher.cleanup_older_than(q.older_than_days).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn api_status(State(ctx): State<SharedContext>) -> Result<impl IntoResponse, HubError> {
    let greenhouses = ctx.db.load_greenhouses().await?.len();
    let readings = ctx.db.count_readings().await?;
    let events = ctx.db.count_events().await?;
    let notifications = ctx.db.count_notifications().await?;
    let sessions = ctx.sessions.read().await.connected();

    Ok(Json(json!({
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "greenhouses": greenhouses,
        "readings": readings,
        "events": events,
        "notifications": notifications,
        "connected_sessions": sessions,
    })))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Client → server requests over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    MarkRead { id: i64 },
    MarkAllRead,
}

async fn ws_upgrade(
    State(ctx): State<SharedContext>,
    Query(q): Query<UserQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(ctx, q.user_id, socket))
}

async fn handle_socket(ctx: SharedContext, user_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session_id = ctx.sessions.write().await.register(&user_id, tx);
    info!(user = %user_id, session_id, "websocket session opened");

    // Outbound pump: registry → socket. Independent of the inbound loop so
    // a slow reader never holds the registry lock.
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_action(&ctx, &user_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: ignore
                }
            }
            _ = &mut send_task => break,
        }
    }

    ctx.sessions.write().await.unregister(&user_id, session_id);
    send_task.abort();
    info!(user = %user_id, session_id, "websocket session closed");
}

async fn handle_client_action(ctx: &SharedContext, user_id: &str, text: &str) {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(ClientAction::MarkRead { id }) => {
            // Scoped to the session's user: a socket cannot flip read state
            // on another user's notifications.
            if let Err(e) = ctx.dispatcher.mark_read_for(user_id, id).await {
                debug!(user = %user_id, id, "ws mark_read failed: {e}");
            }
        }
        Ok(ClientAction::MarkAllRead) => {
            if let Err(e) = ctx.dispatcher.mark_all_read(user_id).await {
                debug!(user = %user_id, "ws mark_all_read failed: {e}");
            }
        }
        Err(e) => debug!(user = %user_id, "ignoring unrecognized ws message: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(ctx: SharedContext) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(ctx)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

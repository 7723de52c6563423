//! HTTP control plane: operation endpoints, license endpoints, and the
//! WebSocket event stream.

mod ws;

use crate::broadcast::{Broadcaster, ChannelBroadcaster};
use crate::errors::{LicenseError, OrchestratorError, redact_message};
use crate::license::LicenseManager;
use crate::operation::OperationRequest;
use crate::orchestrator::Orchestrator;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// How often the background monitor revalidates the license for UI
/// consumers.
const LICENSE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub license: Arc<LicenseManager>,
    pub broadcaster: ChannelBroadcaster,
}

pub type SharedState = Arc<AppState>;

// ── Error mapping ────────────────────────────────────────────────────

/// JSON error envelope: `{"error": "...", "kind": "..."}` with paths and
/// key material redacted.
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": redact_message(&self.message),
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::DuplicateOperation(_) | OrchestratorError::DuplicateStep(_) => {
                StatusCode::CONFLICT
            }
            OrchestratorError::LicenseRequired(_) => StatusCode::FORBIDDEN,
            OrchestratorError::UnknownStep(_)
            | OrchestratorError::UnknownDependency { .. }
            | OrchestratorError::CyclicDependency(_)
            | OrchestratorError::RegistryFrozen => StatusCode::BAD_REQUEST,
            OrchestratorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl From<LicenseError> for ApiError {
    fn from(err: LicenseError) -> Self {
        let status = match &err {
            LicenseError::NotActivated => StatusCode::NOT_FOUND,
            LicenseError::InvalidFormat => StatusCode::BAD_REQUEST,
            LicenseError::AlreadyActivated => StatusCode::CONFLICT,
            LicenseError::Revoked
            | LicenseError::Expired(_)
            | LicenseError::FingerprintMismatch => StatusCode::FORBIDDEN,
            LicenseError::Network(_) => StatusCode::BAD_GATEWAY,
            LicenseError::IntegrityFailure
            | LicenseError::Io { .. }
            | LicenseError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StartResponse {
    id: String,
    status: &'static str,
}

async fn start_operation(
    State(state): State<SharedState>,
    Json(mut request): Json<OperationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.id.trim().is_empty() {
        request.id = uuid::Uuid::new_v4().to_string();
    }
    let id = request.id.clone();

    let orchestrator = state.orchestrator.clone();
    let task_id = id.clone();
    tokio::spawn(async move {
        if let Err(err) = orchestrator.execute(request).await {
            error!(operation = %task_id, error = %err, "operation failed to run");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            id,
            status: "accepted",
        }),
    ))
}

async fn list_operations(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.list_operations().await)
}

async fn get_operation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.orchestrator.get_operation(&id).await?;
    Ok(Json(snapshot))
}

async fn cancel_operation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.cancel(&id).await?;
    Ok(Json(serde_json::json!({"cancelled": id})))
}

async fn license_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.license.validate().await)
}

#[derive(Debug, Deserialize)]
struct ActivateBody {
    key: String,
    #[serde(default)]
    email: Option<String>,
}

async fn activate_license(
    State(state): State<SharedState>,
    Json(body): Json<ActivateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state
        .license
        .activate(&body.key, body.email.as_deref())
        .await?;
    state
        .broadcaster
        .refresh("license_activation", &["license".to_string()]);
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct StackBody {
    key: String,
}

async fn stack_license(
    State(state): State<SharedState>,
    Json(body): Json<StackBody>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.license.stack(&body.key).await?;
    state
        .broadcaster
        .refresh("license_stacking", &["license".to_string()]);
    Ok(Json(info))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Router ───────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/operations", get(list_operations).post(start_operation))
        .route("/api/operations/{id}", get(get_operation))
        .route("/api/operations/{id}/cancel", post(cancel_operation))
        .route("/api/license", get(license_status))
        .route("/api/license/activate", post(activate_license))
        .route("/api/license/stack", post(stack_license))
        .route("/health", get(health_check))
}

/// Full application router with the WebSocket endpoint and CORS.
pub fn build_router(state: SharedState) -> Router {
    let ws_tx = state.broadcaster.sender();
    api_router()
        .route(
            "/ws",
            get(move |upgrade| ws::ws_handler(upgrade, ws_tx)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control plane until the process exits.
pub async fn start_server(addr: &str, state: SharedState) -> anyhow::Result<()> {
    spawn_license_monitor(state.clone());

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Revalidate the license on a schedule and nudge UI subscribers. The
/// orchestrator gates each operation itself; this loop only feeds status
/// displays.
fn spawn_license_monitor(state: SharedState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LICENSE_REFRESH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let validation = state.license.validate().await;
            info!(valid = validation.valid, "license revalidated");
            state
                .broadcaster
                .refresh("license_monitor", &["license".to_string()]);
        }
    });
}

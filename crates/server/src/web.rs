use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tandem_protocol::{ErrorCode, NewCall, TandemConfig};
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use crate::auth::{self, Claims};
use crate::relay::{self, Rejection, Relay};

/// Shared application state.
pub struct AppState {
    pub config: TandemConfig,
    pub relay: Arc<Relay>,
    pub jwt_secret: String,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(config: TandemConfig, jwt_secret: String) -> Self {
        let relay = Arc::new(Relay::new(
            config.server.channel_capacity,
            config.session.clone(),
        ));
        Self {
            config,
            relay,
            jwt_secret,
            started_at: std::time::Instant::now(),
        }
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/mirror-sessions", post(open_mirror))
        .route("/api/mirror-sessions/{id}", get(get_mirror))
        .route("/api/mirror-sessions/{id}/end", post(end_mirror))
        .route("/api/calls", post(create_call))
        .route("/api/calls/{id}", get(get_call))
        .route("/api/calls/{id}/end", post(end_call))
        .route("/api/ice-config", get(ice_config))
        .route("/ws", get(relay_ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

/// Query parameters accepted next to (or instead of) the Authorization header
#[derive(Deserialize)]
struct ApiQuery {
    token: Option<String>,
    duration_seconds: Option<u64>,
}

/// Extract and validate JWT from Authorization header or query parameter.
/// Prefers the Authorization header (Bearer token) when available.
fn authenticate(
    headers: &HeaderMap,
    query: &ApiQuery,
    jwt_secret: &str,
) -> Result<Claims, Response> {
    let token = auth::bearer_token(headers, query.token.as_deref()).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing token" })),
        )
            .into_response()
    })?;

    auth::validate_jwt(token, jwt_secret).map_err(|e| {
        tracing::warn!("Invalid JWT: {e}");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid or expired token" })),
        )
            .into_response()
    })
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::InvalidTransition => StatusCode::CONFLICT,
        ErrorCode::LimitReached => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (
            status_for(self.code),
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

/// GET /api/health - server health check (no auth required)
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// POST /api/mirror-sessions - open a mirror session owned by the caller (agents only)
async fn open_mirror(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
) -> Response {
    let claims = match authenticate(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.relay.open_mirror(&claims).await {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// GET /api/mirror-sessions/{id}
async fn get_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
) -> Response {
    let claims = match authenticate(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.relay.mirror_session(&claims, id).await {
        Ok(session) => Json(session).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// POST /api/mirror-sessions/{id}/end
async fn end_mirror(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
) -> Response {
    let claims = match authenticate(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.relay.end_mirror(&claims, id).await {
        Ok(session) => Json(session).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// POST /api/calls - create a pending call session (agents only)
async fn create_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
    Json(call): Json<NewCall>,
) -> Response {
    let claims = match authenticate(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.relay.create_call(&claims, call).await {
        Ok(call) => (StatusCode::CREATED, Json(call)).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// GET /api/calls/{id} - participants only
async fn get_call(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
) -> Response {
    let claims = match authenticate(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state.relay.call_session(&claims, id).await {
        Ok(call) => Json(call).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// POST /api/calls/{id}/end?duration_seconds=N - participants only
async fn end_call(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
) -> Response {
    let claims = match authenticate(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err(response) => return response,
    };
    match state
        .relay
        .end_call(&claims, id, query.duration_seconds)
        .await
    {
        Ok(call) => Json(call).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// GET /api/ice-config - return ICE/TURN server configuration (requires JWT)
async fn ice_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
) -> Response {
    if let Err(response) = authenticate(&headers, &query, &state.jwt_secret) {
        return response;
    }
    Json(json!({ "ice_servers": state.config.call.ice.servers() })).into_response()
}

/// GET /ws - participant relay connection (requires JWT)
async fn relay_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match authenticate(&headers, &query, &state.jwt_secret) {
        Ok(c) => c,
        Err(response) => return response,
    };

    tracing::info!(user = %claims.sub, role = ?claims.role, "Relay WebSocket upgrade");
    let relay = Arc::clone(&state.relay);
    ws.max_message_size(state.config.server.max_message_bytes)
        .on_upgrade(move |socket| relay::handle_socket(socket, claims, relay))
        .into_response()
}

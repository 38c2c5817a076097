use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::verify_bearer,
    dispatcher::McpDispatcher,
    phone_home::{supervise, PhoneHome},
    resources::uri_templates,
};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub api_key: Arc<str>,
    pub platform_version: Arc<str>,
    pub dispatcher: McpDispatcher,
    pub phone_home: Arc<PhoneHome>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp/v1", post(mcp_endpoint))
        .route("/mcp/v1/health", get(health))
        .route("/mcp/v1/capabilities", get(capabilities))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn mcp_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let principal = match verify_bearer(&headers, &state.api_key) {
        Ok(principal) => principal,
        Err(rejection) => return rejection.into_response(),
    };

    let response = state.dispatcher.handle(&body, principal).await;
    (StatusCode::OK, Json(response)).into_response()
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    // Detached; the response never waits on re-registration.
    if let Some(task) = state.phone_home.check_hostname_drift() {
        supervise(task, "hostname re-registration");
    }

    Json(json!({
        "status": "healthy",
        "version": SERVER_VERSION,
        "platformVersion": &*state.platform_version,
    }))
}

pub async fn capabilities(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(rejection) = verify_bearer(&headers, &state.api_key) {
        return rejection.into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "version": SERVER_VERSION,
            "transport": "http",
            "tools": state.dispatcher.registry().names(),
            "resources": uri_templates(),
        })),
    )
        .into_response()
}

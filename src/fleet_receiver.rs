use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const DEFAULT_RECEIVER_PORT: u16 = 5000;
const STALE_AFTER_SECS: i64 = 120;

#[derive(Debug, Clone)]
struct ServerRecord {
    fields: Map<String, Value>,
    last_seen: DateTime<Utc>,
    heartbeat_count: u64,
}

impl ServerRecord {
    fn to_json(&self) -> Value {
        let mut full = self.fields.clone();
        full.insert("last_seen".into(), Value::String(timestamp(self.last_seen)));
        full.insert("heartbeat_count".into(), Value::from(self.heartbeat_count));
        Value::Object(full)
    }

    fn summary(&self, server_id: &str, now: DateTime<Utc>) -> Value {
        let text = |key: &str| {
            self.fields
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        json!({
            "server_id": server_id,
            "hostname": text("hostname"),
            "database": text("database"),
            "last_seen": timestamp(self.last_seen),
            "heartbeat_count": self.heartbeat_count,
            "stale": (now - self.last_seen).num_seconds() > STALE_AFTER_SECS,
        })
    }
}

/// In-memory fleet registry fed by registrations and heartbeats.
#[derive(Clone)]
pub struct ReceiverState {
    servers: Arc<RwLock<HashMap<String, ServerRecord>>>,
    started: Instant,
}

impl ReceiverState {
    pub fn new() -> Self {
        Self {
            servers: Arc::new(RwLock::new(HashMap::new())),
            started: Instant::now(),
        }
    }
}

impl Default for ReceiverState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: ReceiverState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/servers", get(list_servers))
        .route("/servers/{server_id}", get(get_server).delete(delete_server))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind fleet receiver on {addr}"))?;
    info!("fleet receiver listening on {addr}");
    axum::serve(listener, router(ReceiverState::new())).await?;
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn bad_request(message: &str) -> axum::response::Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn not_found(server_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Server not found", "server_id": server_id})),
    )
        .into_response()
}

/// Parses an announcement body into its fields and `server_id`.
fn announcement(body: &[u8]) -> Result<(String, Map<String, Value>), axum::response::Response> {
    let fields = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) if !fields.is_empty() => fields,
        _ => return Err(bad_request("No JSON payload provided")),
    };
    match fields.get("server_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok((id.clone(), fields)),
        _ => Err(bad_request("Missing required field: server_id")),
    }
}

async fn register(State(state): State<ReceiverState>, body: Bytes) -> impl IntoResponse {
    let (server_id, mut fields) = match announcement(&body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    let now = Utc::now();
    fields.insert("registered_at".into(), Value::String(timestamp(now)));
    let record = ServerRecord {
        fields,
        last_seen: now,
        heartbeat_count: 0,
    };

    state.servers.write().await.insert(server_id.clone(), record);
    info!(server_id = %server_id, "Server registered");

    (
        StatusCode::CREATED,
        Json(json!({"status": "registered", "server_id": server_id})),
    )
        .into_response()
}

async fn heartbeat(State(state): State<ReceiverState>, body: Bytes) -> impl IntoResponse {
    let (server_id, fields) = match announcement(&body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    let now = Utc::now();
    let heartbeat_count = {
        let mut servers = state.servers.write().await;
        let record = servers
            .entry(server_id.clone())
            .or_insert_with(|| ServerRecord {
                fields: Map::new(),
                last_seen: now,
                heartbeat_count: 0,
            });
        for (key, value) in fields {
            if key != "heartbeat_count" && key != "last_seen" {
                record.fields.insert(key, value);
            }
        }
        record.last_seen = now;
        record.heartbeat_count += 1;
        record.heartbeat_count
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "server_id": server_id,
            "heartbeat_count": heartbeat_count,
        })),
    )
        .into_response()
}

async fn list_servers(State(state): State<ReceiverState>) -> impl IntoResponse {
    let now = Utc::now();
    let servers = state.servers.read().await;
    let mut listed = servers
        .iter()
        .map(|(server_id, record)| record.summary(server_id, now))
        .collect::<Vec<_>>();
    listed.sort_by(|a, b| a["server_id"].as_str().cmp(&b["server_id"].as_str()));

    Json(json!({"count": listed.len(), "servers": listed}))
}

async fn get_server(
    State(state): State<ReceiverState>,
    Path(server_id): Path<String>,
) -> impl IntoResponse {
    match state.servers.read().await.get(&server_id) {
        Some(record) => (StatusCode::OK, Json(record.to_json())).into_response(),
        None => not_found(&server_id),
    }
}

async fn delete_server(
    State(state): State<ReceiverState>,
    Path(server_id): Path<String>,
) -> impl IntoResponse {
    if state.servers.write().await.remove(&server_id).is_none() {
        return not_found(&server_id);
    }
    info!(server_id = %server_id, "Server removed");
    (
        StatusCode::OK,
        Json(json!({"status": "deleted", "server_id": server_id})),
    )
        .into_response()
}

async fn health(State(state): State<ReceiverState>) -> impl IntoResponse {
    let server_count = state.servers.read().await.len();
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.started.elapsed().as_secs(),
        "server_count": server_count,
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use chrono::{Duration, Utc};
    use serde_json::{json, Map, Value};
    use tower::ServiceExt;

    use super::{router, ReceiverState, ServerRecord};

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn register_validates_and_stores() {
        let app = router(ReceiverState::new());

        let (status, _) = send(&app, Method::POST, "/register", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, Method::POST, "/register", Some(json!({"hostname": "h"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required field: server_id");

        let (status, body) = send(
            &app,
            Method::POST,
            "/register",
            Some(json!({"server_id": "acme_web1", "hostname": "web1", "database": "acme", "port": 8768})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "registered");

        let (status, record) = send(&app, Method::GET, "/servers/acme_web1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["heartbeat_count"], 0);
        assert_eq!(record["port"], 8768);
        assert!(record["registered_at"].as_str().unwrap_or_default().ends_with('Z'));
    }

    #[tokio::test]
    async fn heartbeat_merges_fields_and_counts() {
        let app = router(ReceiverState::new());
        send(
            &app,
            Method::POST,
            "/register",
            Some(json!({"server_id": "acme_web1", "hostname": "web1", "port": 8768})),
        )
        .await;

        for expected in 1..=2 {
            let (status, body) = send(
                &app,
                Method::POST,
                "/heartbeat",
                Some(json!({"server_id": "acme_web1", "status": "healthy", "port": 9000})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["heartbeat_count"], expected);
        }

        let (_, record) = send(&app, Method::GET, "/servers/acme_web1", None).await;
        assert_eq!(record["hostname"], "web1");
        assert_eq!(record["port"], 9000);
        assert_eq!(record["status"], "healthy");
        assert_eq!(record["heartbeat_count"], 2);

        let (status, body) = send(
            &app,
            Method::POST,
            "/heartbeat",
            Some(json!({"server_id": "ghost_host", "hostname": "host"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["heartbeat_count"], 1);
    }

    #[tokio::test]
    async fn listing_deleting_and_health() {
        let app = router(ReceiverState::new());
        for id in ["b_host", "a_host"] {
            send(&app, Method::POST, "/register", Some(json!({"server_id": id, "database": "db"}))).await;
        }

        let (_, listing) = send(&app, Method::GET, "/servers", None).await;
        assert_eq!(listing["count"], 2);
        assert_eq!(listing["servers"][0]["server_id"], "a_host");
        assert_eq!(listing["servers"][0]["database"], "db");
        assert_eq!(listing["servers"][0]["hostname"], "");
        assert_eq!(listing["servers"][0]["stale"], false);

        let (status, _) = send(&app, Method::DELETE, "/servers/a_host", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, Method::DELETE, "/servers/a_host", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["server_id"], "a_host");
        let (status, _) = send(&app, Method::GET, "/servers/a_host", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, health) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["server_count"], 1);
    }

    #[test]
    fn records_older_than_two_minutes_are_stale() {
        let now = Utc::now();
        let record = |age: i64| ServerRecord {
            fields: Map::new(),
            last_seen: now - Duration::seconds(age),
            heartbeat_count: 3,
        };
        assert_eq!(record(120).summary("x", now)["stale"], false);
        assert_eq!(record(121).summary("x", now)["stale"], true);
    }
}

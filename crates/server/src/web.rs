use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use meshroom_protocol::{MeshroomConfig, TurnCredentials};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::LatencyUnit;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{Level, Span};

use crate::relay::{self, RoomRegistry};

/// Shared application state.
pub struct AppState {
    pub config: MeshroomConfig,
    pub rooms: RoomRegistry,
    pub started_at: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/health", get(health_check))
        .route("/turn-credentials", get(turn_credentials))
        .layer(RequestBodyLimitLayer::new(65_536))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Tag each request with an `x-request-id`, trace it in a span carrying the
/// id, and echo the id on the response.
pub fn with_request_tracing(router: Router) -> Router {
    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(request_span).on_response(
                DefaultOnResponse::new()
                    .level(Level::DEBUG)
                    .latency_unit(LatencyUnit::Millis),
            ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn request_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id,
    )
}

/// GET /api/health - liveness plus room counts
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rooms = state.rooms.read().await;
    let participants: usize = rooms.values().map(|r| r.len()).sum();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "rooms": rooms.len(),
        "participants": participants,
    }))
}

/// GET /turn-credentials - static TURN credentials from the `ice` section
async fn turn_credentials(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ice = &state.config.ice;
    if ice.turn_urls.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no TURN server configured" })),
        )
            .into_response();
    }

    Json(TurnCredentials {
        uris: ice.turn_urls.clone(),
        username: ice.turn_username.clone().unwrap_or_default(),
        credential: ice.turn_credential.clone().unwrap_or_default(),
    })
    .into_response()
}

/// GET /ws - WebSocket upgrade for a room participant
async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rooms = Arc::clone(&state.rooms);
    let mode = state.config.session.mode;
    ws.max_message_size(65_536) // 64KB max for signaling messages
        .on_upgrade(move |socket| relay::handle_ws(socket, rooms, mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app_state(config: MeshroomConfig) -> Arc<AppState> {
        Arc::new(AppState {
            config,
            rooms: relay::new_room_registry(),
            started_at: std::time::Instant::now(),
        })
    }

    /// Helper: parse a response body as `serde_json::Value`.
    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_rooms() {
        let state = test_app_state(MeshroomConfig::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        relay::join(
            &state.rooms,
            meshroom_protocol::RoomMode::Mesh,
            "r1",
            "a",
            &tx,
        )
        .await;
        let app = build_router(state);

        let response = app.oneshot(get_request("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["rooms"], 1);
        assert_eq!(json["participants"], 1);
    }

    #[tokio::test]
    async fn turn_credentials_not_found_without_turn() {
        let app = build_router(test_app_state(MeshroomConfig::default()));
        let response = app.oneshot(get_request("/turn-credentials")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn turn_credentials_from_config() {
        let config: MeshroomConfig = toml::from_str(
            r#"
[ice]
turn_urls = ["turn:turn.example.com:3478"]
turn_username = "meshroom"
turn_credential = "s3cret"
"#,
        )
        .expect("valid config");
        let app = build_router(test_app_state(config));

        let response = app.oneshot(get_request("/turn-credentials")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["uris"][0], "turn:turn.example.com:3478");
        assert_eq!(json["username"], "meshroom");
        assert_eq!(json["credential"], "s3cret");
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let app = with_request_tracing(build_router(test_app_state(MeshroomConfig::default())));
        let response = app.oneshot(get_request("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response
            .headers()
            .get("x-request-id")
            .expect("request id echoed")
            .to_str()
            .unwrap();
        assert_eq!(id.len(), 36);
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let app = build_router(test_app_state(MeshroomConfig::default()));
        let response = app.oneshot(get_request("/ws")).await.unwrap();
        assert!(response.status().is_client_error());
    }
}

//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `*` allows any origin; otherwise a comma-separated allow list
fn cors_layer(client_origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return base.allow_origin(Any);
    }

    let allowed_origins: Vec<HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    base.allow_origin(allowed_origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

/// Body of `GET /health`, also parsed by the client probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub uptime_secs: u64,
    pub sessions: usize,
    pub tick: u64,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        uptime_secs: uptime_secs(),
        sessions: state.host.session_count(),
        tick: state.host.tick(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::game::HostSimulation;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn health_reports_host_counters() {
        let config = Config::default();
        let (_host, handle, _commands) = HostSimulation::new(&config);
        handle.stats.sessions.store(2, Ordering::Relaxed);
        handle.stats.tick.store(120, Ordering::Relaxed);

        let state = AppState::new(config, handle);
        let Json(body) = health_handler(State(state)).await;
        assert!(body.ok);
        assert_eq!(body.sessions, 2);
        assert_eq!(body.tick, 120);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json.get("uptime_secs").is_some());
    }

    #[test]
    fn router_builds_with_origin_list() {
        let config = Config {
            client_origin: "http://localhost:5173, https://example.org".into(),
            ..Config::default()
        };
        let (_host, handle, _commands) = HostSimulation::new(&config);
        let _router = build_router(AppState::new(config, handle));
    }
}

use axum::{
    extract::{FromRef, Path, State},
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use kromi_common::{is_valid_participant_id, RtcConfig};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::SignalLimits;
use crate::hub::{HubStats, SignalHub};
use crate::security;
use crate::signal;

#[derive(Clone)]
pub struct AppState {
    pub hub: SignalHub,
    pub limits: SignalLimits,
    pub rtc_config: Arc<RtcConfig>,
}

impl AppState {
    pub fn new(hub: SignalHub, limits: SignalLimits, rtc_config: RtcConfig) -> Self {
        Self {
            hub,
            limits,
            rtc_config: Arc::new(rtc_config),
        }
    }
}

impl FromRef<AppState> for SignalHub {
    fn from_ref(state: &AppState) -> Self {
        state.hub.clone()
    }
}

impl FromRef<AppState> for SignalLimits {
    fn from_ref(state: &AppState) -> Self {
        state.limits.clone()
    }
}

impl FromRef<AppState> for Arc<RtcConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.rtc_config.clone()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeMetrics {
    active_ws_connections: usize,
    #[serde(flatten)]
    hub: HubStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebRtcConfigResponse {
    ws_signaling_url: String,
    #[serde(flatten)]
    rtc: RtcConfig,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health(State(hub): State<SignalHub>) -> impl IntoResponse {
    Json(RuntimeMetrics {
        active_ws_connections: signal::active_connections(),
        hub: hub.stats().await,
    })
}

async fn prometheus_metrics(State(hub): State<SignalHub>) -> impl IntoResponse {
    let stats = hub.stats().await;
    let counts = &stats.session_states;

    let prometheus_text = format!(
        r#"# HELP kromi_signal_websocket_connections Active WebSocket connections
# TYPE kromi_signal_websocket_connections gauge
kromi_signal_websocket_connections {active}
# HELP kromi_signal_devices Registered capture devices
# TYPE kromi_signal_devices gauge
kromi_signal_devices {devices}
# HELP kromi_signal_viewers Registered viewers
# TYPE kromi_signal_viewers gauge
kromi_signal_viewers {viewers}
# HELP kromi_signal_sessions Live peer sessions by state
# TYPE kromi_signal_sessions gauge
kromi_signal_sessions{{state="new"}} {new}
kromi_signal_sessions{{state="offer_sent"}} {offer_sent}
kromi_signal_sessions{{state="answer_sent"}} {answer_sent}
kromi_signal_sessions{{state="connected"}} {connected}
"#,
        active = signal::active_connections(),
        devices = stats.devices,
        viewers = stats.viewers,
        new = counts.new,
        offer_sent = counts.offer_sent,
        answer_sent = counts.answer_sent,
        connected = counts.connected,
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus_text,
    )
}

async fn webrtc_config(State(rtc): State<Arc<RtcConfig>>) -> impl IntoResponse {
    let ws_signaling_url =
        std::env::var("WS_SIGNALING_URL").unwrap_or_else(|_| "ws://localhost:3000/ws".to_string());
    Json(WebRtcConfigResponse {
        ws_signaling_url,
        rtc: rtc.as_ref().clone(),
    })
}

/// Presence snapshot for external collaborators such as event dashboards.
async fn event_devices(
    State(hub): State<SignalHub>,
    Path(event_id): Path<String>,
) -> impl IntoResponse {
    if !is_valid_participant_id(&event_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid event id".to_string(),
            }),
        )
            .into_response();
    }
    Json(hub.snapshot(&event_id).await).into_response()
}

pub fn build_cors_layer() -> CorsLayer {
    let allow_origin = if security::cors_allow_any() {
        AllowOrigin::any()
    } else {
        let origins = security::cors_origin_values();
        if origins.is_empty() {
            tracing::warn!(
                "no valid CORS origins configured; cross-origin browser access will be blocked"
            );
            return CorsLayer::new()
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]);
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Kromi Signal Online" }))
        .route("/health", get(health))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .route("/webrtc/config", get(webrtc_config))
        .route("/events/:event_id/devices", get(event_devices))
        .route("/ws", get(signal::ws_handler))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

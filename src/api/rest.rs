// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Routes:
//   GET  /health                 liveness + uptime
//   POST /v1/stream/create       mint {channel, token} for a candle size
//   POST /v1/stream/stop         stop a stream by {channel, token}
//   GET  /v1/stream/start        WebSocket candle stream (see `ws`)
//   GET  /v1/orderbook/:pair     latest order-book snapshot
//
// CORS allows the configured origins, or any origin when none are configured.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::HeaderValue,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::ApiError;
use crate::app_state::ApiState;
use crate::config::ServerConfig;
use crate::market_data::CandleSize;
use crate::service::StreamCredentials;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with tracing, CORS and shared state.
pub fn router(state: Arc<ApiState>, server: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/stream/create", post(create_stream))
        .route("/v1/stream/stop", post(stop_stream))
        .route("/v1/stream/start", get(crate::api::ws::stream_start))
        .route("/v1/orderbook/:pair", get(orderbook))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&server.allowed_origins)),
        )
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
    orderbook_pairs: usize,
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
        orderbook_pairs: state.orderbooks.pairs().len(),
    })
}

// =============================================================================
// Candle streams
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateStreamRequest {
    candle_size: CandleSize,
}

async fn create_stream(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateStreamRequest>,
) -> Json<StreamCredentials> {
    Json(state.streamer.create_stream(req.candle_size))
}

#[derive(Debug, Deserialize)]
struct StopStreamRequest {
    channel: String,
    token: String,
}

async fn stop_stream(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<StopStreamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.streamer.stop(&req.channel, &req.token)?;
    info!(channel = %req.channel, "stream stopped via REST");
    Ok(Json(serde_json::json!({ "stopped": true })))
}

// =============================================================================
// Order books
// =============================================================================

async fn orderbook(
    State(state): State<Arc<ApiState>>,
    Path(pair): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pair = pair.to_lowercase();
    state
        .orderbooks
        .get(&pair)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no order book for {pair}")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::market_data::OrderBookStore;
    use crate::service::CandleStreamer;
    use crate::types::{BookLevel, OrderBook};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<ApiState>) {
        let state = Arc::new(ApiState::new(
            Arc::new(CandleStreamer::new(&StreamConfig::default())),
            Arc::new(OrderBookStore::new()),
        ));
        (router(state.clone(), &ServerConfig::default()), state)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn create_stream_returns_channel_and_token() {
        let (app, state) = app();
        let resp = app
            .oneshot(post_json("/v1/stream/create", serde_json::json!({"candle_size": "1m"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert!(body["channel"].as_str().unwrap().starts_with("ch:"));
        assert_eq!(body["token"].as_str().unwrap().len(), 20);
        assert_eq!(state.streamer.registration_count(), 1);
    }

    #[tokio::test]
    async fn create_stream_rejects_bad_size() {
        let (app, _) = app();
        let resp = app
            .oneshot(post_json("/v1/stream/create", serde_json::json!({"candle_size": "1x"})))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn stop_maps_stream_errors_to_status_codes() {
        let (app, state) = app();
        let creds = state.streamer.create_stream(CandleSize::ONE_MINUTE);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/v1/stream/stop",
                serde_json::json!({"channel": creds.channel, "token": "bad"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/v1/stream/stop",
                serde_json::json!({"channel": "ch:missing", "token": creds.token}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(post_json(
                "/v1/stream/stop",
                serde_json::json!({"channel": creds.channel, "token": creds.token}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.streamer.registration_count(), 0);
    }

    #[tokio::test]
    async fn orderbook_lookup() {
        let (app, state) = app();
        state.orderbooks.replace(
            "btcidr",
            OrderBook {
                pair: "btcidr".into(),
                exchange: "indodax".into(),
                bid: vec![BookLevel { price: dec!(100), qty: dec!(1) }],
                ask: vec![],
            },
        );

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/v1/orderbook/BTCIDR").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["bid"][0]["price"], "100");

        let resp = app
            .oneshot(Request::builder().uri("/v1/orderbook/ethidr").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

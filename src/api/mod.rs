//! Operational HTTP API
//!
//! REST endpoints for rebuild control, builder status and observation intake.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::service::CandleService;
use crate::types::{Candle, CandleType, Observation, PriceObservation, TradeObservation};

/// API response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(service: Arc<CandleService>) -> Router {
    Router::new()
        // Rebuild control
        .route("/api/rebuild", post(start_rebuild_all).delete(cancel_rebuild_all))
        .route(
            "/api/rebuild/:resource",
            post(start_rebuild_resource).delete(cancel_rebuild_resource),
        )
        // Status
        .route("/api/status/builder", get(get_builder_status))
        .route("/api/status/rebuild", get(get_rebuild_status))
        .route("/api/status/builders", get(get_all_builders_status))
        // Data
        .route("/api/candles", get(get_candles))
        .route("/api/observations/price", post(post_price_observation))
        .route("/api/observations/trade", post(post_trade_observation))
        // State
        .with_state(service)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve the API until `shutdown` is cancelled
pub async fn serve(service: Arc<CandleService>, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = create_router(service);
    info!("Candle API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Rebuild control
// ─────────────────────────────────────────────────────────────────

/// POST /api/rebuild
async fn start_rebuild_all(State(service): State<Arc<CandleService>>) -> impl IntoResponse {
    Json(service.start_rebuild_all())
}

/// POST /api/rebuild/:resource
async fn start_rebuild_resource(
    State(service): State<Arc<CandleService>>,
    Path(resource): Path<String>,
) -> impl IntoResponse {
    Json(service.start_rebuild_resource(&resource))
}

/// DELETE /api/rebuild
async fn cancel_rebuild_all(State(service): State<Arc<CandleService>>) -> impl IntoResponse {
    Json(service.cancel_rebuild(None))
}

/// DELETE /api/rebuild/:resource
async fn cancel_rebuild_resource(
    State(service): State<Arc<CandleService>>,
    Path(resource): Path<String>,
) -> impl IntoResponse {
    Json(service.cancel_rebuild(Some(&resource)))
}

// ─────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────

/// GET /api/status/builder
async fn get_builder_status(State(service): State<Arc<CandleService>>) -> impl IntoResponse {
    Json(ApiResponse::success(service.builder_status().await))
}

#[derive(Debug, Deserialize)]
struct RebuildStatusQuery {
    resource: Option<String>,
}

/// GET /api/status/rebuild?resource=ethereum-gas
async fn get_rebuild_status(
    Query(query): Query<RebuildStatusQuery>,
    State(service): State<Arc<CandleService>>,
) -> impl IntoResponse {
    Json(ApiResponse::success(service.rebuild_status(query.resource.as_deref())))
}

/// GET /api/status/builders
async fn get_all_builders_status(State(service): State<Arc<CandleService>>) -> impl IntoResponse {
    Json(ApiResponse::success(service.all_builders_status().await))
}

// ─────────────────────────────────────────────────────────────────
// Data
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CandlesQuery {
    #[serde(rename = "type")]
    candle_type: Option<String>,
    interval: i64,
    market: u64,
}

/// GET /api/candles?type=index&interval=3600&market=1
async fn get_candles(
    Query(query): Query<CandlesQuery>,
    State(service): State<Arc<CandleService>>,
) -> impl IntoResponse {
    let candle_type = match query.candle_type.as_deref() {
        None => CandleType::Index,
        Some(raw) => match CandleType::from_str(raw) {
            Some(candle_type) => candle_type,
            None => return Json(ApiResponse::<Vec<Candle>>::error(format!("unknown candle type '{}'", raw))),
        },
    };

    match service.candles(candle_type, query.interval, query.market).await {
        Ok(candles) => Json(ApiResponse::success(candles)),
        Err(e) => Json(ApiResponse::error(format!("{:#}", e))),
    }
}

/// POST /api/observations/price
async fn post_price_observation(
    State(service): State<Arc<CandleService>>,
    Json(observation): Json<PriceObservation>,
) -> impl IntoResponse {
    queue(&service, Observation::Price(observation)).await
}

/// POST /api/observations/trade
async fn post_trade_observation(
    State(service): State<Arc<CandleService>>,
    Json(observation): Json<TradeObservation>,
) -> impl IntoResponse {
    queue(&service, Observation::Trade(observation)).await
}

async fn queue(service: &CandleService, observation: Observation) -> Json<ApiResponse<&'static str>> {
    match service.submit(observation).await {
        Ok(()) => Json(ApiResponse::success("queued")),
        Err(e) => Json(ApiResponse::error(format!("{:#}", e))),
    }
}

//! JSON HTTP surface over `FeedService`.

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kwatera_core::{InteractionFlags, Listing};
use kwatera_storage::StoreError;
use kwatera_sync::{FeedService, RefreshError, SyncConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "kwatera-web";

/// Optional header naming the interaction partition; absent or blank means anonymous.
pub const USER_HEADER: &str = "x-kwatera-user";

#[derive(Clone)]
pub struct AppState {
    pub service: FeedService,
}

impl AppState {
    pub fn new(service: FeedService) -> Self {
        Self { service }
    }

    fn for_request(&self, headers: &HeaderMap) -> FeedService {
        let user = headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        self.service.scoped(user)
    }
}

#[derive(Debug, Deserialize)]
struct ListingIdsBody {
    listing_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ViewedBody {
    listing_id: String,
}

#[derive(Debug, Deserialize)]
struct LikedBody {
    listing_id: String,
    liked: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/refresh", post(refresh_handler))
        .route("/feeds/latest", post(latest_handler))
        .route("/feeds/liked", get(liked_handler))
        .route("/interactions/viewed", post(viewed_handler))
        .route("/interactions/liked", post(liked_toggle_handler))
        .route("/interactions/flags", post(flags_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("KWATERA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let service = FeedService::from_config(&SyncConfig::from_env()).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn refresh_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.for_request(&headers).scrape_and_refresh().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => refresh_failure(err),
    }
}

/// Every refresh failure is retryable; only the status distinguishes a storage fault.
fn refresh_failure(err: RefreshError) -> Response {
    let status = match &err {
        RefreshError::Store(_) => {
            error!(error = %err, "refresh could not write listings");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => {
            warn!(error = %err, "refresh failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    let body = json!({ "error": "listing refresh failed, try again later", "retryable": true });
    (status, Json(body)).into_response()
}

async fn latest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ListingIdsBody>,
) -> Result<Json<Vec<Listing>>, Response> {
    state
        .for_request(&headers)
        .get_latest(&body.listing_ids)
        .await
        .map(Json)
        .map_err(store_error)
}

async fn liked_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Listing>>, Response> {
    state
        .for_request(&headers)
        .get_liked()
        .await
        .map(Json)
        .map_err(store_error)
}

async fn viewed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ViewedBody>,
) -> Result<StatusCode, Response> {
    require_listing_id(&body.listing_id)?;
    state
        .for_request(&headers)
        .mark_viewed(&body.listing_id)
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn liked_toggle_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LikedBody>,
) -> Result<StatusCode, Response> {
    require_listing_id(&body.listing_id)?;
    state
        .for_request(&headers)
        .set_liked(&body.listing_id, body.liked)
        .await
        .map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn flags_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ListingIdsBody>,
) -> Result<Json<BTreeMap<String, InteractionFlags>>, Response> {
    state
        .for_request(&headers)
        .get_flags(&body.listing_ids)
        .await
        .map(Json)
        .map_err(store_error)
}

fn require_listing_id(listing_id: &str) -> Result<(), Response> {
    if listing_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "listing_id must not be empty" })),
        )
            .into_response());
    }
    Ok(())
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "storage failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal storage error" })),
    )
        .into_response()
}

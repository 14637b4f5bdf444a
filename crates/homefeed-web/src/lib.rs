//! JSON API over the listing store and the sync pipeline.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use homefeed_core::{AnnotationPatch, ListingFilter};
use homefeed_storage::{ListingStore, PgListingStore};
use homefeed_sync::{map_feed_source, SyncConfig, SyncPipeline};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "homefeed-web";

const DEFAULT_LOG_LIMIT: usize = 20;
const MAX_LOG_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub store: Arc<dyn ListingStore>,
}

impl AppState {
    pub fn new(pipeline: SyncPipeline, store: Arc<dyn ListingStore>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            store,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingsQuery {
    show_hidden: Option<String>,
    favorites: Option<String>,
    min_price: Option<i64>,
    max_price: Option<i64>,
    min_rooms: Option<f64>,
    max_rooms: Option<f64>,
}

impl From<ListingsQuery> for ListingFilter {
    fn from(q: ListingsQuery) -> Self {
        ListingFilter {
            show_hidden: is_true(q.show_hidden.as_deref()),
            favorites_only: is_true(q.favorites.as_deref()),
            min_price: q.min_price,
            max_price: q.max_price,
            min_rooms: q.min_rooms,
            max_rooms: q.max_rooms,
        }
    }
}

/// Only the literal `true` enables a flag; anything else reads as false.
fn is_true(flag: Option<&str>) -> bool {
    flag == Some("true")
}

#[derive(Debug, Default, Deserialize)]
struct SyncLogsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/cron", get(cron_handler))
        .route("/api/listings", get(listings_handler))
        .route("/api/listings/{id}", patch(annotate_handler))
        .route("/api/sync-logs", get(sync_logs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("HOMEFEED_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let store = Arc::new(
        PgListingStore::connect(&config.database_url, config.database_max_connections).await?,
    );
    let pipeline = SyncPipeline::configured(&config, map_feed_source(&config)?, store.clone());
    let state = AppState::new(pipeline, store);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving listing api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn cron_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    match state.store.list_listings(&query.into()).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => {
            error!(error = %err, "listing query failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch listings")
        }
    }
}

async fn annotate_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<AnnotationPatch>, JsonRejection>,
) -> Response {
    let patch = match body {
        Ok(Json(patch)) => patch,
        Err(rejection) => return json_error(rejection.status(), rejection.body_text()),
    };
    match state.store.update_annotations(&id, &patch).await {
        Ok(Some(listing)) => Json(listing).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Listing not found"),
        Err(err) => {
            error!(%id, error = %err, "annotation update failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update")
        }
    }
}

async fn sync_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncLogsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    match state.store.recent_sync_logs(limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => {
            error!(error = %err, "sync log query failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch sync logs")
        }
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

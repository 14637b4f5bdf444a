//! Listing persistence seams + HTTP fetch utilities for homefeed.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homefeed_core::{
    AnnotationPatch, Listing, ListingDraft, ListingFilter, ListingRefresh, SyncLog, SyncLogEntry,
    Upserted,
};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryListingStore;
pub use postgres::PgListingStore;

pub const CRATE_NAME: &str = "homefeed-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding stored value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Backend(String),
}

/// Data-access seam required by the sync core and the listing endpoints.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Atomic create-if-absent-else-update keyed by `draft.id`.
    ///
    /// A create writes every draft attribute with both provenance timestamps
    /// set to `seen_at`; an update writes only `refresh` and `last_seen_at`.
    async fn upsert_listing(
        &self,
        draft: &ListingDraft,
        refresh: ListingRefresh,
        seen_at: DateTime<Utc>,
    ) -> Result<Upserted, StoreError>;

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<SyncLog, StoreError>;

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError>;

    async fn list_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError>;

    /// Returns `None` when no listing has this id.
    async fn update_annotations(
        &self,
        id: &str,
        patch: &AnnotationPatch,
    ) -> Result<Option<Listing>, StoreError>;

    /// Newest first.
    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError>;
}

/// Longest lease either store will grant; longer requests are shortened.
pub const MAX_LEASE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Named, expiring lease used to keep sync runs from overlapping.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes the lease if it is free or expired. Returns `false` when another
    /// holder owns an unexpired lease. `ttl` is capped at [`MAX_LEASE_TTL`].
    async fn try_acquire(&self, name: &str, holder: Uuid, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Releases the lease only if `holder` still owns it.
    async fn release(&self, name: &str, holder: Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// No timeout is applied unless one is configured.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt GET client. Retries are left to whoever invokes the sync.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async move {
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched response body");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

//! PostgreSQL-backed listing store.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homefeed_core::{
    AnnotationPatch, Listing, ListingDraft, ListingFilter, ListingRefresh, SyncLog, SyncLogEntry,
    SyncStatus, UpsertKind, Upserted,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{LeaseStore, ListingStore, StoreError, MAX_LEASE_TTL};

const LISTING_COLUMNS: &str = "id, external_numeric_id, price, city, neighborhood, area, street, \
     house_number, floor, lat, lon, rooms, square_meters, property_type, cover_image, images, \
     raw_data, first_seen_at, last_seen_at, is_favorite, is_hidden";

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let images_text: String = row.try_get("images")?;
    let images: Vec<String> = serde_json::from_str(&images_text)
        .map_err(|e| StoreError::Corrupt(format!("listings.images is not a JSON array: {e}")))?;
    Ok(Listing {
        id: row.try_get("id")?,
        external_numeric_id: row.try_get("external_numeric_id")?,
        price: row.try_get("price")?,
        city: row.try_get("city")?,
        neighborhood: row.try_get("neighborhood")?,
        area: row.try_get("area")?,
        street: row.try_get("street")?,
        house_number: row.try_get("house_number")?,
        floor: row.try_get("floor")?,
        lat: row.try_get("lat")?,
        lon: row.try_get("lon")?,
        rooms: row.try_get("rooms")?,
        square_meters: row.try_get("square_meters")?,
        property_type: row.try_get("property_type")?,
        cover_image: row.try_get("cover_image")?,
        images,
        raw_data: row.try_get("raw_data")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        is_favorite: row.try_get("is_favorite")?,
        is_hidden: row.try_get("is_hidden")?,
    })
}

fn sync_log_from_row(row: &PgRow) -> Result<SyncLog, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SyncLog {
        id: row.try_get("id")?,
        status: SyncStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown sync status {status:?}")))?,
        items_count: row.try_get("items_count")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn upsert_listing(
        &self,
        draft: &ListingDraft,
        refresh: ListingRefresh,
        seen_at: DateTime<Utc>,
    ) -> Result<Upserted, StoreError> {
        let images = serde_json::to_string(&draft.images)?;
        let sql = format!(
            r#"
            INSERT INTO listings (
                id, external_numeric_id, price, city, neighborhood, area, street,
                house_number, floor, lat, lon, rooms, square_meters, property_type,
                cover_image, images, raw_data, first_seen_at, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $18)
            ON CONFLICT (id) DO UPDATE
               SET price = $19,
                   last_seen_at = GREATEST(listings.last_seen_at, EXCLUDED.last_seen_at)
            RETURNING {LISTING_COLUMNS}, (xmax = 0) AS inserted
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&draft.id)
            .bind(draft.external_numeric_id)
            .bind(draft.price)
            .bind(&draft.city)
            .bind(&draft.neighborhood)
            .bind(&draft.area)
            .bind(&draft.street)
            .bind(draft.house_number)
            .bind(draft.floor)
            .bind(draft.lat)
            .bind(draft.lon)
            .bind(draft.rooms)
            .bind(draft.square_meters)
            .bind(&draft.property_type)
            .bind(&draft.cover_image)
            .bind(images)
            .bind(&draft.raw_data)
            .bind(seen_at)
            .bind(refresh.price)
            .fetch_one(&self.pool)
            .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(Upserted {
            listing: listing_from_row(&row)?,
            kind: if inserted {
                UpsertKind::Created
            } else {
                UpsertKind::Updated
            },
        })
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<SyncLog, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_logs (status, items_count, message)
            VALUES ($1, $2, $3)
            RETURNING id, status, items_count, message, created_at
            "#,
        )
        .bind(entry.status.as_str())
        .bind(entry.items_count)
        .bind(&entry.message)
        .fetch_one(&self.pool)
        .await?;
        sync_log_from_row(&row)
    }

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn list_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM listings
             WHERE ($1 OR NOT is_hidden)
               AND (NOT $2 OR is_favorite)
               AND ($3::BIGINT IS NULL OR price >= $3)
               AND ($4::BIGINT IS NULL OR price <= $4)
               AND ($5::DOUBLE PRECISION IS NULL OR rooms >= $5)
               AND ($6::DOUBLE PRECISION IS NULL OR rooms <= $6)
             ORDER BY is_favorite DESC, first_seen_at DESC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.show_hidden)
            .bind(filter.favorites_only)
            .bind(filter.min_price)
            .bind(filter.max_price)
            .bind(filter.min_rooms)
            .bind(filter.max_rooms)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn update_annotations(
        &self,
        id: &str,
        patch: &AnnotationPatch,
    ) -> Result<Option<Listing>, StoreError> {
        let sql = format!(
            r#"
            UPDATE listings
               SET is_favorite = COALESCE($2, is_favorite),
                   is_hidden = COALESCE($3, is_hidden)
             WHERE id = $1
            RETURNING {LISTING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(patch.is_favorite)
            .bind(patch.is_hidden)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, items_count, message, created_at
              FROM sync_logs
             ORDER BY created_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sync_log_from_row).collect()
    }
}

#[async_trait]
impl LeaseStore for PgListingStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_leases (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
               SET holder = EXCLUDED.holder,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE sync_leases.expires_at <= NOW()
                OR sync_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.min(MAX_LEASE_TTL).as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release(&self, name: &str, holder: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

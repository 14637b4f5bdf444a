//! Process-local store used by tests and fixture runs.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homefeed_core::{
    listing_display_order, AnnotationPatch, Listing, ListingDraft, ListingFilter, ListingRefresh,
    SyncLog, SyncLogEntry, UpsertKind, Upserted,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{LeaseStore, ListingStore, StoreError, MAX_LEASE_TTL};

#[derive(Debug, Default)]
pub struct InMemoryListingStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    listings: BTreeMap<String, Listing>,
    logs: Vec<SyncLog>,
    leases: HashMap<String, MemoryLease>,
}

#[derive(Debug, Clone, Copy)]
struct MemoryLease {
    holder: Uuid,
    expires_at: Instant,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listing_count(&self) -> usize {
        self.state.lock().await.listings.len()
    }

    /// Oldest first, in append order.
    pub async fn sync_logs(&self) -> Vec<SyncLog> {
        self.state.lock().await.logs.clone()
    }
}

#[async_trait]
impl ListingStore for InMemoryListingStore {
    async fn upsert_listing(
        &self,
        draft: &ListingDraft,
        refresh: ListingRefresh,
        seen_at: DateTime<Utc>,
    ) -> Result<Upserted, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.listings.get_mut(&draft.id) {
            existing.apply_refresh(refresh, seen_at);
            return Ok(Upserted {
                listing: existing.clone(),
                kind: UpsertKind::Updated,
            });
        }

        let listing = Listing::from_draft(draft.clone(), seen_at);
        state.listings.insert(listing.id.clone(), listing.clone());
        Ok(Upserted {
            listing,
            kind: UpsertKind::Created,
        })
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<SyncLog, StoreError> {
        let mut state = self.state.lock().await;
        let log = SyncLog {
            id: i64::try_from(state.logs.len()).unwrap_or(i64::MAX) + 1,
            status: entry.status,
            items_count: entry.items_count,
            message: entry.message.clone(),
            created_at: Utc::now(),
        };
        state.logs.push(log.clone());
        Ok(log)
    }

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        Ok(self.state.lock().await.listings.get(id).cloned())
    }

    async fn list_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .listings
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(listing_display_order);
        Ok(rows)
    }

    async fn update_annotations(
        &self,
        id: &str,
        patch: &AnnotationPatch,
    ) -> Result<Option<Listing>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.listings.get_mut(id).map(|listing| {
            listing.apply_annotations(patch);
            listing.clone()
        }))
    }

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.logs.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl LeaseStore for InMemoryListingStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(current) = state.leases.get(name) {
            if current.holder != holder && current.expires_at > now {
                return Ok(false);
            }
        }
        state.leases.insert(
            name.to_string(),
            MemoryLease {
                holder,
                expires_at: now + ttl.min(MAX_LEASE_TTL),
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, holder: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.leases.get(name).is_some_and(|l| l.holder == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }
}

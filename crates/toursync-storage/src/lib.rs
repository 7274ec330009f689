//! Reconciliation cache persistence and the cache-writing services shared by
//! the webhook and bulk-sync ingestion paths.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use toursync_core::{
    AvailabilityCacheEntry, AvailabilitySlot, CacheRow, ProductMapping, SyncMetadata, SyncStatus,
    CANCELLED_STATUS,
};
use tracing::{debug, info, warn};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "toursync-storage";

pub const DEFAULT_AVAILABILITY_TTL_MINUTES: i64 = 15;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {table} row {key}: {reason}")]
    Corrupt {
        table: &'static str,
        key: String,
        reason: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Partial update of a product's sync bookkeeping. `None` row count or sync
/// time keeps the stored value; `last_error` is always overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMetadataUpdate {
    pub product_id: String,
    pub status: SyncStatus,
    pub row_count: Option<u64>,
    pub synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Persistence seam for every table the engine owns.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Insert-or-update keyed by external booking id. Callers must not pass
    /// the same id twice in one call.
    async fn upsert_cache_rows(&self, rows: &[CacheRow]) -> Result<usize, StoreError>;

    async fn find_cache_row(&self, external_booking_id: &str)
        -> Result<Option<CacheRow>, StoreError>;

    async fn update_cache_status(
        &self,
        external_booking_id: &str,
        status: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn count_cache_rows(&self) -> Result<u64, StoreError>;

    async fn confirmed_participants(
        &self,
        product_id: &str,
        date: NaiveDate,
        time_slot: &str,
    ) -> Result<u64, StoreError>;

    async fn load_product_mappings(&self) -> Result<Vec<ProductMapping>, StoreError>;

    async fn upsert_product_mappings(&self, mappings: &[ProductMapping])
        -> Result<usize, StoreError>;

    async fn delete_availability(&self, product_id: &str, date: NaiveDate)
        -> Result<u64, StoreError>;

    async fn upsert_availability(&self, entries: &[AvailabilityCacheEntry])
        -> Result<usize, StoreError>;

    async fn find_availability(
        &self,
        product_id: &str,
        date: NaiveDate,
        time_slot: &str,
    ) -> Result<Option<AvailabilityCacheEntry>, StoreError>;

    async fn record_sync_metadata(&self, update: &SyncMetadataUpdate) -> Result<(), StoreError>;

    async fn load_sync_metadata(&self) -> Result<Vec<SyncMetadata>, StoreError>;
}

/// Collapse repeated external ids so the last occurrence wins while keeping
/// first-seen ordering.
pub fn collapse_by_external_id(rows: &[CacheRow]) -> Vec<CacheRow> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<CacheRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(row.external_booking_id.as_str()) {
            Some(&pos) => out[pos] = row.clone(),
            None => {
                index.insert(row.external_booking_id.as_str(), out.len());
                out.push(row.clone());
            }
        }
    }
    out
}

#[derive(Debug, Default)]
struct MappingCache {
    by_upstream: HashMap<String, String>,
    by_local: HashMap<String, Vec<String>>,
    active: Vec<ProductMapping>,
}

impl MappingCache {
    fn build(mappings: Vec<ProductMapping>) -> Self {
        let mut cache = Self::default();
        for mapping in mappings.into_iter().filter(|m| m.active) {
            cache
                .by_upstream
                .insert(mapping.upstream_product_id.clone(), mapping.tour_type.clone());
            cache
                .by_local
                .entry(mapping.tour_type.clone())
                .or_default()
                .push(mapping.upstream_product_id.clone());
            cache.active.push(mapping);
        }
        cache
            .active
            .sort_by(|a, b| a.upstream_product_id.cmp(&b.upstream_product_id));
        for products in cache.by_local.values_mut() {
            products.sort();
        }
        cache
    }
}

/// Read-through cache over the product-mapping table. Only active mappings
/// resolve; a lookup miss reloads the table once before giving up.
pub struct ProductMapper {
    store: Arc<dyn BookingStore>,
    cache: RwLock<Option<MappingCache>>,
}

impl ProductMapper {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Reload mappings from the store. Returns the number of active products.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let mappings = self.store.load_product_mappings().await?;
        let cache = MappingCache::build(mappings);
        let active = cache.active.len();
        *self.cache.write().await = Some(cache);
        debug!(active, "product mapping cache refreshed");
        Ok(active)
    }

    pub async fn resolve_local_type(
        &self,
        upstream_product_id: &str,
    ) -> Result<Option<String>, StoreError> {
        self.lookup(|cache| cache.by_upstream.get(upstream_product_id).cloned())
            .await
    }

    /// First upstream product (by id) for a tour type.
    pub async fn resolve_upstream_product(
        &self,
        tour_type: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.resolve_upstream_products(tour_type).await?.into_iter().next())
    }

    /// Every active upstream product mapped to a tour type, sorted by id.
    pub async fn resolve_upstream_products(&self, tour_type: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lookup(|cache| cache.by_local.get(tour_type).cloned())
            .await?
            .unwrap_or_default())
    }

    pub async fn list_active_products(&self) -> Result<Vec<ProductMapping>, StoreError> {
        if let Some(cache) = self.cache.read().await.as_ref() {
            return Ok(cache.active.clone());
        }
        self.refresh().await?;
        Ok(self
            .cache
            .read()
            .await
            .as_ref()
            .map(|c| c.active.clone())
            .unwrap_or_default())
    }

    async fn lookup<T, F>(&self, find: F) -> Result<Option<T>, StoreError>
    where
        F: Fn(&MappingCache) -> Option<T>,
    {
        if let Some(found) = self.cache.read().await.as_ref().and_then(&find) {
            return Ok(Some(found));
        }
        self.refresh().await?;
        Ok(self.cache.read().await.as_ref().and_then(&find))
    }
}

/// Idempotent batch writer for the booking cache.
#[derive(Clone)]
pub struct CacheUpsertWriter {
    store: Arc<dyn BookingStore>,
}

impl CacheUpsertWriter {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, rows: &[CacheRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows = collapse_by_external_id(rows);
        let written = self.store.upsert_cache_rows(&rows).await?;
        debug!(written, "booking cache upsert");
        Ok(written)
    }

    pub async fn find(&self, external_booking_id: &str) -> Result<Option<CacheRow>, StoreError> {
        self.store.find_cache_row(external_booking_id).await
    }

    /// Flip an existing row to the cancelled marker, keeping it for audit.
    /// Returns the updated row, or `None` if the booking was never cached.
    pub async fn mark_cancelled(
        &self,
        external_booking_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<CacheRow>, StoreError> {
        let Some(mut row) = self.store.find_cache_row(external_booking_id).await? else {
            return Ok(None);
        };
        if !self
            .store
            .update_cache_status(external_booking_id, CANCELLED_STATUS, at)
            .await?
        {
            return Ok(None);
        }
        row.status = CANCELLED_STATUS.to_string();
        row.last_synced_at = at;
        Ok(Some(row))
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.store.count_cache_rows().await
    }
}

/// Drops or refreshes cached per-slot availability when bookings change.
pub struct AvailabilityCacheInvalidator {
    store: Arc<dyn BookingStore>,
    mapper: Arc<ProductMapper>,
    ttl: Duration,
}

impl AvailabilityCacheInvalidator {
    pub fn new(store: Arc<dyn BookingStore>, mapper: Arc<ProductMapper>, ttl: Duration) -> Self {
        Self { store, mapper, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Delete every cached slot on `date` for each upstream product mapped
    /// to the tour type.
    pub async fn invalidate(&self, tour_type: &str, date: NaiveDate) -> Result<u64, StoreError> {
        let products = self.mapper.resolve_upstream_products(tour_type).await?;
        if products.is_empty() {
            warn!(tour_type, %date, "no upstream product for tour type; nothing to invalidate");
            return Ok(0);
        }
        let mut deleted = 0;
        for product_id in &products {
            deleted += self.invalidate_product(product_id, date).await?;
        }
        Ok(deleted)
    }

    pub async fn invalidate_product(
        &self,
        product_id: &str,
        date: NaiveDate,
    ) -> Result<u64, StoreError> {
        let deleted = self.store.delete_availability(product_id, date).await?;
        info!(product_id, %date, deleted, "availability cache invalidated");
        Ok(deleted)
    }

    pub async fn refresh(
        &self,
        product_id: &str,
        date: NaiveDate,
        slots: &[AvailabilitySlot],
    ) -> Result<usize, StoreError> {
        self.refresh_at(product_id, date, slots, Utc::now()).await
    }

    pub async fn refresh_at(
        &self,
        product_id: &str,
        date: NaiveDate,
        slots: &[AvailabilitySlot],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let entries = slots
            .iter()
            .map(|slot| AvailabilityCacheEntry {
                product_id: product_id.to_string(),
                date,
                time_slot: slot.time_slot.clone(),
                available_spots: slot.available_spots,
                cached_at: now,
                expires_at: now + self.ttl,
            })
            .collect::<Vec<_>>();
        let written = self.store.upsert_availability(&entries).await?;
        info!(product_id, %date, written, "availability cache refreshed");
        Ok(written)
    }

    /// Spots left in a slot. A miss and an expired entry are treated the
    /// same: recompute from confirmed bookings and cache the result.
    pub async fn available_spots(
        &self,
        product_id: &str,
        date: NaiveDate,
        time_slot: &str,
        capacity: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        if let Some(entry) = self
            .store
            .find_availability(product_id, date, time_slot)
            .await?
            .filter(|e| e.is_fresh(now))
        {
            return Ok(entry.available_spots);
        }

        let booked = self
            .store
            .confirmed_participants(product_id, date, time_slot)
            .await?;
        let spots = u64::from(capacity).saturating_sub(booked);
        let spots = u32::try_from(spots).unwrap_or(u32::MAX);
        self.refresh_at(
            product_id,
            date,
            &[AvailabilitySlot {
                time_slot: time_slot.to_string(),
                available_spots: spots,
            }],
            now,
        )
        .await?;
        Ok(spots)
    }
}

/// Per-product sync bookkeeping for observability and health checks.
#[derive(Clone)]
pub struct SyncMetadataTracker {
    store: Arc<dyn BookingStore>,
}

impl SyncMetadataTracker {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    pub async fn mark_syncing(&self, product_id: &str) -> Result<(), StoreError> {
        self.store
            .record_sync_metadata(&SyncMetadataUpdate {
                product_id: product_id.to_string(),
                status: SyncStatus::Syncing,
                row_count: None,
                synced_at: None,
                last_error: None,
            })
            .await
    }

    pub async fn mark_completed(
        &self,
        product_id: &str,
        row_count: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .record_sync_metadata(&SyncMetadataUpdate {
                product_id: product_id.to_string(),
                status: SyncStatus::Completed,
                row_count: Some(row_count),
                synced_at: Some(at),
                last_error: None,
            })
            .await
    }

    pub async fn mark_error(
        &self,
        product_id: &str,
        row_count: u64,
        message: &str,
    ) -> Result<(), StoreError> {
        self.store
            .record_sync_metadata(&SyncMetadataUpdate {
                product_id: product_id.to_string(),
                status: SyncStatus::Error,
                row_count: Some(row_count),
                synced_at: None,
                last_error: Some(message.to_string()),
            })
            .await
    }

    pub async fn snapshot(&self) -> Result<Vec<SyncMetadata>, StoreError> {
        self.store.load_sync_metadata().await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ProductMappingsYaml {
    products: Vec<ProductMapping>,
}

/// Parse a `products.yaml` mapping file.
pub fn load_product_mappings_yaml(path: impl AsRef<Path>) -> anyhow::Result<Vec<ProductMapping>> {
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: ProductMappingsYaml =
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use toursync_core::SourceTag;

    fn mapping(product: &str, tour: &str, active: bool) -> ProductMapping {
        ProductMapping {
            upstream_product_id: product.into(),
            tour_type: tour.into(),
            active,
        }
    }

    fn row(id: &str, status: &str, participants: u32) -> CacheRow {
        CacheRow {
            external_booking_id: id.into(),
            product_id: "P-1".into(),
            booking_date: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            booking_time: "09:00".into(),
            status: status.into(),
            customer_name: None,
            customer_email: Some("guest@example.com".into()),
            customer_phone: None,
            adults: participants,
            children: 0,
            infants: 0,
            total_participants: participants,
            tour_type: "sunset-sail".into(),
            raw_payload: serde_json::json!({"id": id}),
            source: SourceTag::BulkSync,
            last_synced_at: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).single().unwrap(),
        }
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, h, m, 0).single().unwrap()
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert_product_mappings(&[
                mapping("P-1", "sunset-sail", true),
                mapping("P-2", "dolphin-watch", true),
                mapping("P-3", "private-charter", false),
            ])
            .await
            .unwrap();
        store
    }

    #[test]
    fn collapse_keeps_last_payload_in_first_position() {
        let rows = vec![row("A", "CONFIRMED", 1), row("B", "CONFIRMED", 1), row("A", "CONFIRMED", 5)];
        let collapsed = collapse_by_external_id(&rows);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].external_booking_id, "A");
        assert_eq!(collapsed[0].total_participants, 5);
        assert_eq!(collapsed[1].external_booking_id, "B");
    }

    #[tokio::test]
    async fn repeated_upserts_converge_to_one_row() {
        let store = Arc::new(MemoryStore::default());
        let writer = CacheUpsertWriter::new(store.clone());
        assert_eq!(writer.upsert(&[row("A", "CONFIRMED", 2)]).await.unwrap(), 1);
        assert_eq!(writer.upsert(&[row("A", "CONFIRMED", 3)]).await.unwrap(), 1);
        assert_eq!(writer.count().await.unwrap(), 1);
        assert_eq!(writer.find("A").await.unwrap().unwrap().total_participants, 3);
    }

    #[tokio::test]
    async fn empty_upsert_is_a_noop() {
        let store = Arc::new(MemoryStore::default());
        store.fail_cache_writes(true);
        let writer = CacheUpsertWriter::new(store);
        assert_eq!(writer.upsert(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_keeps_row_for_audit() {
        let store = Arc::new(MemoryStore::default());
        let writer = CacheUpsertWriter::new(store.clone());
        writer.upsert(&[row("A", "CONFIRMED", 2)]).await.unwrap();

        let cancelled = writer.mark_cancelled("A", ts(10, 0)).await.unwrap().unwrap();
        assert_eq!(cancelled.status, CANCELLED_STATUS);
        assert_eq!(writer.count().await.unwrap(), 1);
        assert!(!writer.find("A").await.unwrap().unwrap().counts_toward_occupancy());
        assert!(writer.mark_cancelled("missing", ts(10, 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mapper_resolves_only_active_products() {
        let mapper = ProductMapper::new(seeded_store().await);
        assert_eq!(mapper.resolve_local_type("P-1").await.unwrap().as_deref(), Some("sunset-sail"));
        assert_eq!(mapper.resolve_local_type("P-3").await.unwrap(), None);
        assert_eq!(mapper.resolve_upstream_product("dolphin-watch").await.unwrap().as_deref(), Some("P-2"));
        let active = mapper.list_active_products().await.unwrap();
        assert_eq!(
            active.iter().map(|m| m.upstream_product_id.as_str()).collect::<Vec<_>>(),
            vec!["P-1", "P-2"]
        );
    }

    #[tokio::test]
    async fn mapper_miss_reloads_new_mappings() {
        let store = seeded_store().await;
        let mapper = ProductMapper::new(store.clone());
        assert_eq!(mapper.refresh().await.unwrap(), 2);
        store
            .upsert_product_mappings(&[mapping("P-4", "kayak", true)])
            .await
            .unwrap();
        assert_eq!(mapper.resolve_local_type("P-4").await.unwrap().as_deref(), Some("kayak"));
    }

    #[tokio::test]
    async fn invalidate_removes_all_slots_for_product_date() {
        let store = seeded_store().await;
        let mapper = Arc::new(ProductMapper::new(store.clone()));
        let invalidator = AvailabilityCacheInvalidator::new(store.clone(), mapper, Duration::minutes(15));
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let slots = [
            AvailabilitySlot { time_slot: "09:00".into(), available_spots: 4 },
            AvailabilitySlot { time_slot: "14:00".into(), available_spots: 6 },
        ];
        invalidator.refresh_at("P-1", date, &slots, ts(9, 0)).await.unwrap();
        invalidator.refresh_at("P-2", date, &slots, ts(9, 0)).await.unwrap();

        assert_eq!(invalidator.invalidate("sunset-sail", date).await.unwrap(), 2);
        assert!(store.find_availability("P-1", date, "09:00").await.unwrap().is_none());
        assert!(store.find_availability("P-2", date, "09:00").await.unwrap().is_some());
        assert_eq!(invalidator.invalidate("unknown-tour", date).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shared_tour_type_invalidates_every_product() {
        let store = Arc::new(MemoryStore::with_mappings(vec![
            mapping("P-1", "sunset-sail", true),
            mapping("P-7", "sunset-sail", true),
        ]));
        let mapper = Arc::new(ProductMapper::new(store.clone()));
        let invalidator = AvailabilityCacheInvalidator::new(store.clone(), mapper.clone(), Duration::minutes(15));
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let slots = [AvailabilitySlot { time_slot: "09:00".into(), available_spots: 4 }];
        invalidator.refresh_at("P-1", date, &slots, ts(9, 0)).await.unwrap();
        invalidator.refresh_at("P-7", date, &slots, ts(9, 0)).await.unwrap();

        assert_eq!(
            mapper.resolve_upstream_products("sunset-sail").await.unwrap(),
            vec!["P-1".to_string(), "P-7".to_string()]
        );
        assert_eq!(invalidator.invalidate("sunset-sail", date).await.unwrap(), 2);
        assert!(store.find_availability("P-7", date, "09:00").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_recomputes_on_miss_and_after_expiry() {
        let store = seeded_store().await;
        let mapper = Arc::new(ProductMapper::new(store.clone()));
        let invalidator = AvailabilityCacheInvalidator::new(store.clone(), mapper, Duration::minutes(15));
        let writer = CacheUpsertWriter::new(store.clone());
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();

        writer
            .upsert(&[row("A", "confirmed", 3), row("B", "CANCELLED", 4)])
            .await
            .unwrap();
        assert_eq!(invalidator.available_spots("P-1", date, "09:00", 10, ts(9, 0)).await.unwrap(), 7);

        writer.upsert(&[row("C", "CONFIRMED", 2)]).await.unwrap();
        // still served from the fresh cache entry
        assert_eq!(invalidator.available_spots("P-1", date, "09:00", 10, ts(9, 10)).await.unwrap(), 7);
        // expired entry behaves like a miss
        assert_eq!(invalidator.available_spots("P-1", date, "09:00", 10, ts(9, 15)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn tracker_keeps_row_count_while_syncing() {
        let store = Arc::new(MemoryStore::default());
        let tracker = SyncMetadataTracker::new(store);
        tracker.mark_completed("P-1", 12, ts(8, 0)).await.unwrap();
        tracker.mark_syncing("P-1").await.unwrap();

        let meta = tracker.snapshot().await.unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].status, SyncStatus::Syncing);
        assert_eq!(meta[0].last_row_count, 12);
        assert_eq!(meta[0].last_full_sync, Some(ts(8, 0)));

        tracker.mark_error("P-1", 3, "http status 500").await.unwrap();
        let meta = tracker.snapshot().await.unwrap();
        assert_eq!(meta[0].status, SyncStatus::Error);
        assert_eq!(meta[0].last_error.as_deref(), Some("http status 500"));
        assert_eq!(meta[0].last_full_sync, Some(ts(8, 0)));
    }

    #[test]
    fn mapping_yaml_defaults_active_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("products.yaml");
        std::fs::write(
            &path,
            "products:\n  - upstream_product_id: \"1\"\n    tour_type: a\n  - upstream_product_id: \"2\"\n    tour_type: b\n    active: false\n",
        )
        .unwrap();
        let mappings = load_product_mappings_yaml(&path).unwrap();
        assert_eq!(mappings, vec![mapping("1", "a", true), mapping("2", "b", false)]);
    }
}

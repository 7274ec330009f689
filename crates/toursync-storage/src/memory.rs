use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use toursync_core::{AvailabilityCacheEntry, CacheRow, ProductMapping, SyncMetadata};

use crate::{BookingStore, StoreError, SyncMetadataUpdate};

type SlotKey = (String, NaiveDate, String);

#[derive(Debug, Default)]
struct MemoryState {
    bookings: BTreeMap<String, CacheRow>,
    mappings: BTreeMap<String, ProductMapping>,
    availability: BTreeMap<SlotKey, AvailabilityCacheEntry>,
    metadata: BTreeMap<String, SyncMetadata>,
}

/// Process-local store with the same conflict semantics as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_cache_writes: AtomicBool,
}

impl MemoryStore {
    pub fn with_mappings(mappings: Vec<ProductMapping>) -> Self {
        let state = MemoryState {
            mappings: mappings
                .into_iter()
                .map(|m| (m.upstream_product_id.clone(), m))
                .collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            fail_cache_writes: AtomicBool::new(false),
        }
    }

    /// Make booking-cache writes fail, to exercise persistence error paths.
    pub fn fail_cache_writes(&self, fail: bool) {
        self.fail_cache_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn cache_rows(&self) -> Vec<CacheRow> {
        self.state.lock().await.bookings.values().cloned().collect()
    }

    pub async fn availability_entries(&self) -> Vec<AvailabilityCacheEntry> {
        self.state.lock().await.availability.values().cloned().collect()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_cache_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("booking cache writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn upsert_cache_rows(&self, rows: &[CacheRow]) -> Result<usize, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        for row in rows {
            state
                .bookings
                .insert(row.external_booking_id.clone(), row.clone());
        }
        Ok(rows.len())
    }

    async fn find_cache_row(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<CacheRow>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .bookings
            .get(external_booking_id)
            .cloned())
    }

    async fn update_cache_status(
        &self,
        external_booking_id: &str,
        status: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let Some(row) = state.bookings.get_mut(external_booking_id) else {
            return Ok(false);
        };
        row.status = status.to_string();
        row.last_synced_at = synced_at;
        Ok(true)
    }

    async fn count_cache_rows(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.bookings.len() as u64)
    }

    async fn confirmed_participants(
        &self,
        product_id: &str,
        date: NaiveDate,
        time_slot: &str,
    ) -> Result<u64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .bookings
            .values()
            .filter(|r| {
                r.product_id == product_id
                    && r.booking_date == date
                    && r.booking_time == time_slot
                    && r.counts_toward_occupancy()
            })
            .map(|r| u64::from(r.total_participants))
            .sum())
    }

    async fn load_product_mappings(&self) -> Result<Vec<ProductMapping>, StoreError> {
        Ok(self.state.lock().await.mappings.values().cloned().collect())
    }

    async fn upsert_product_mappings(
        &self,
        mappings: &[ProductMapping],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        for mapping in mappings {
            state
                .mappings
                .insert(mapping.upstream_product_id.clone(), mapping.clone());
        }
        Ok(mappings.len())
    }

    async fn delete_availability(
        &self,
        product_id: &str,
        date: NaiveDate,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.availability.len();
        state
            .availability
            .retain(|(product, day, _), _| !(product == product_id && *day == date));
        Ok((before - state.availability.len()) as u64)
    }

    async fn upsert_availability(
        &self,
        entries: &[AvailabilityCacheEntry],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        for entry in entries {
            state.availability.insert(
                (entry.product_id.clone(), entry.date, entry.time_slot.clone()),
                entry.clone(),
            );
        }
        Ok(entries.len())
    }

    async fn find_availability(
        &self,
        product_id: &str,
        date: NaiveDate,
        time_slot: &str,
    ) -> Result<Option<AvailabilityCacheEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .availability
            .get(&(product_id.to_string(), date, time_slot.to_string()))
            .cloned())
    }

    async fn record_sync_metadata(&self, update: &SyncMetadataUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .metadata
            .entry(update.product_id.clone())
            .or_insert_with(|| SyncMetadata {
                product_id: update.product_id.clone(),
                last_full_sync: None,
                last_row_count: 0,
                status: Default::default(),
                last_error: None,
            });
        entry.status = update.status;
        entry.last_error = update.last_error.clone();
        if let Some(count) = update.row_count {
            entry.last_row_count = count;
        }
        if let Some(at) = update.synced_at {
            entry.last_full_sync = Some(at);
        }
        Ok(())
    }

    async fn load_sync_metadata(&self) -> Result<Vec<SyncMetadata>, StoreError> {
        Ok(self.state.lock().await.metadata.values().cloned().collect())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use toursync_core::{AvailabilityCacheEntry, CacheRow, ProductMapping, SourceTag, SyncMetadata, SyncStatus};

use crate::{BookingStore, StoreError, SyncMetadataUpdate};

const CACHE_COLUMNS: usize = 16;
const AVAILABILITY_COLUMNS: usize = 6;
const MAX_BIND_PARAMS: usize = 65_535;

/// Postgres-backed store; conflict handling lives in SQL.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_u32(table: &'static str, key: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        table,
        key: key.to_string(),
        reason: format!("count {value} out of range"),
    })
}

fn cache_row_from_pg(row: &PgRow) -> Result<CacheRow, StoreError> {
    let id: String = row.try_get("external_booking_id")?;
    let source: String = row.try_get("source")?;
    let source = source.parse::<SourceTag>().map_err(|e| StoreError::Corrupt {
        table: "booking_cache",
        key: id.clone(),
        reason: e.to_string(),
    })?;
    Ok(CacheRow {
        product_id: row.try_get("product_id")?,
        booking_date: row.try_get("booking_date")?,
        booking_time: row.try_get("booking_time")?,
        status: row.try_get("status")?,
        customer_name: row.try_get("customer_name")?,
        customer_email: row.try_get("customer_email")?,
        customer_phone: row.try_get("customer_phone")?,
        adults: to_u32("booking_cache", &id, row.try_get("adults")?)?,
        children: to_u32("booking_cache", &id, row.try_get("children")?)?,
        infants: to_u32("booking_cache", &id, row.try_get("infants")?)?,
        total_participants: to_u32("booking_cache", &id, row.try_get("total_participants")?)?,
        tour_type: row.try_get("tour_type")?,
        raw_payload: row.try_get("raw_payload")?,
        source,
        last_synced_at: row.try_get("last_synced_at")?,
        external_booking_id: id,
    })
}

fn availability_from_pg(row: &PgRow) -> Result<AvailabilityCacheEntry, StoreError> {
    let product_id: String = row.try_get("upstream_product_id")?;
    let spots: i64 = row.try_get("available_spots")?;
    Ok(AvailabilityCacheEntry {
        available_spots: to_u32("availability_cache", &product_id, spots)?,
        date: row.try_get("date")?,
        time_slot: row.try_get("time_slot")?,
        cached_at: row.try_get("cached_at")?,
        expires_at: row.try_get("expires_at")?,
        product_id,
    })
}

#[async_trait]
impl BookingStore for PgStore {
    async fn upsert_cache_rows(&self, rows: &[CacheRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for chunk in rows.chunks(MAX_BIND_PARAMS / CACHE_COLUMNS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO booking_cache (external_booking_id, product_id, booking_date, \
                 booking_time, status, customer_name, customer_email, customer_phone, adults, \
                 children, infants, total_participants, tour_type, raw_payload, source, \
                 last_synced_at) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(&row.external_booking_id)
                    .push_bind(&row.product_id)
                    .push_bind(row.booking_date)
                    .push_bind(&row.booking_time)
                    .push_bind(&row.status)
                    .push_bind(row.customer_name.as_deref())
                    .push_bind(row.customer_email.as_deref())
                    .push_bind(row.customer_phone.as_deref())
                    .push_bind(i64::from(row.adults))
                    .push_bind(i64::from(row.children))
                    .push_bind(i64::from(row.infants))
                    .push_bind(i64::from(row.total_participants))
                    .push_bind(&row.tour_type)
                    .push_bind(&row.raw_payload)
                    .push_bind(row.source.as_str())
                    .push_bind(row.last_synced_at);
            });
            qb.push(
                " ON CONFLICT (external_booking_id) DO UPDATE SET \
                 product_id = EXCLUDED.product_id, \
                 booking_date = EXCLUDED.booking_date, \
                 booking_time = EXCLUDED.booking_time, \
                 status = EXCLUDED.status, \
                 customer_name = EXCLUDED.customer_name, \
                 customer_email = EXCLUDED.customer_email, \
                 customer_phone = EXCLUDED.customer_phone, \
                 adults = EXCLUDED.adults, \
                 children = EXCLUDED.children, \
                 infants = EXCLUDED.infants, \
                 total_participants = EXCLUDED.total_participants, \
                 tour_type = EXCLUDED.tour_type, \
                 raw_payload = EXCLUDED.raw_payload, \
                 source = EXCLUDED.source, \
                 last_synced_at = EXCLUDED.last_synced_at",
            );
            let result = qb.build().execute(&mut *tx).await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn find_cache_row(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<CacheRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_booking_id, product_id, booking_date, booking_time, status,
                   customer_name, customer_email, customer_phone, adults, children, infants,
                   total_participants, tour_type, raw_payload, source, last_synced_at
              FROM booking_cache
             WHERE external_booking_id = $1
            "#,
        )
        .bind(external_booking_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(cache_row_from_pg).transpose()
    }

    async fn update_cache_status(
        &self,
        external_booking_id: &str,
        status: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE booking_cache
               SET status = $2,
                   last_synced_at = $3
             WHERE external_booking_id = $1
            "#,
        )
        .bind(external_booking_id)
        .bind(status)
        .bind(synced_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_cache_rows(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM booking_cache")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn confirmed_participants(
        &self,
        product_id: &str,
        date: NaiveDate,
        time_slot: &str,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(total_participants), 0)::BIGINT AS booked
              FROM booking_cache
             WHERE product_id = $1
               AND booking_date = $2
               AND booking_time = $3
               AND UPPER(TRIM(status)) = 'CONFIRMED'
            "#,
        )
        .bind(product_id)
        .bind(date)
        .bind(time_slot)
        .fetch_one(&self.pool)
        .await?;
        let booked: i64 = row.try_get("booked")?;
        Ok(booked.max(0) as u64)
    }

    async fn load_product_mappings(&self) -> Result<Vec<ProductMapping>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT upstream_product_id, tour_type, active
              FROM product_mappings
             ORDER BY upstream_product_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ProductMapping {
                upstream_product_id: row.try_get("upstream_product_id")?,
                tour_type: row.try_get("tour_type")?,
                active: row.try_get("active")?,
            });
        }
        Ok(out)
    }

    async fn upsert_product_mappings(
        &self,
        mappings: &[ProductMapping],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for mapping in mappings {
            sqlx::query(
                r#"
                INSERT INTO product_mappings (upstream_product_id, tour_type, active, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (upstream_product_id) DO UPDATE
                   SET tour_type = EXCLUDED.tour_type,
                       active = EXCLUDED.active,
                       updated_at = NOW()
                "#,
            )
            .bind(&mapping.upstream_product_id)
            .bind(&mapping.tour_type)
            .bind(mapping.active)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(mappings.len())
    }

    async fn delete_availability(
        &self,
        product_id: &str,
        date: NaiveDate,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM availability_cache WHERE upstream_product_id = $1 AND date = $2",
        )
        .bind(product_id)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_availability(
        &self,
        entries: &[AvailabilityCacheEntry],
    ) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        for chunk in entries.chunks(MAX_BIND_PARAMS / AVAILABILITY_COLUMNS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO availability_cache (upstream_product_id, date, time_slot, \
                 available_spots, cached_at, expires_at) ",
            );
            qb.push_values(chunk, |mut b, entry| {
                b.push_bind(&entry.product_id)
                    .push_bind(entry.date)
                    .push_bind(&entry.time_slot)
                    .push_bind(i64::from(entry.available_spots))
                    .push_bind(entry.cached_at)
                    .push_bind(entry.expires_at);
            });
            qb.push(
                " ON CONFLICT (upstream_product_id, date, time_slot) DO UPDATE SET \
                 available_spots = EXCLUDED.available_spots, \
                 cached_at = EXCLUDED.cached_at, \
                 expires_at = EXCLUDED.expires_at",
            );
            written += qb.build().execute(&self.pool).await?.rows_affected() as usize;
        }
        Ok(written)
    }

    async fn find_availability(
        &self,
        product_id: &str,
        date: NaiveDate,
        time_slot: &str,
    ) -> Result<Option<AvailabilityCacheEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT upstream_product_id, date, time_slot, available_spots, cached_at, expires_at
              FROM availability_cache
             WHERE upstream_product_id = $1
               AND date = $2
               AND time_slot = $3
            "#,
        )
        .bind(product_id)
        .bind(date)
        .bind(time_slot)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(availability_from_pg).transpose()
    }

    async fn record_sync_metadata(&self, update: &SyncMetadataUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (upstream_product_id, last_full_sync, last_row_count, status, last_error)
            VALUES ($1, $2, COALESCE($3, 0), $4, $5)
            ON CONFLICT (upstream_product_id) DO UPDATE
               SET last_full_sync = COALESCE(EXCLUDED.last_full_sync, sync_metadata.last_full_sync),
                   last_row_count = COALESCE($3, sync_metadata.last_row_count),
                   status = EXCLUDED.status,
                   last_error = EXCLUDED.last_error
            "#,
        )
        .bind(&update.product_id)
        .bind(update.synced_at)
        .bind(update.row_count.map(|c| i64::try_from(c).unwrap_or(i64::MAX)))
        .bind(update.status.as_str())
        .bind(update.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_sync_metadata(&self) -> Result<Vec<SyncMetadata>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT upstream_product_id, last_full_sync, last_row_count, status, last_error
              FROM sync_metadata
             ORDER BY upstream_product_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let product_id: String = row.try_get("upstream_product_id")?;
            let status: String = row.try_get("status")?;
            let status = status.parse::<SyncStatus>().map_err(|e| StoreError::Corrupt {
                table: "sync_metadata",
                key: product_id.clone(),
                reason: e.to_string(),
            })?;
            let count: i64 = row.try_get("last_row_count")?;
            out.push(SyncMetadata {
                last_full_sync: row.try_get("last_full_sync")?,
                last_row_count: count.max(0) as u64,
                status,
                last_error: row.try_get("last_error")?,
                product_id,
            });
        }
        Ok(out)
    }
}

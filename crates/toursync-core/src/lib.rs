//! Core domain model for the external-booking reconciliation engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "toursync-core";

/// Status written onto a cached booking when the upstream cancels it.
pub const CANCELLED_STATUS: &str = "CANCELLED";

/// Status filter sent to the upstream booking search.
pub const CONFIRMED_STATUS: &str = "CONFIRMED";

/// Only a case-insensitive "confirmed" counts toward occupancy.
pub fn is_confirmed(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case(CONFIRMED_STATUS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TicketCategory {
    Adult,
    Child,
    Infant,
    #[serde(other)]
    Unknown,
}

/// One line of the upstream price-category breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantCategory {
    pub category_id: Option<String>,
    pub ticket_category: Option<TicketCategory>,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticipantCounts {
    pub adults: u32,
    pub children: u32,
    pub infants: u32,
    pub total: u32,
}

/// Collapse a price-category breakdown into adult/child/infant buckets.
///
/// Unknown or missing categories count as adults so occupancy is never
/// undercounted. When the breakdown yields nobody, the upstream-reported
/// total is used instead, and a booking always occupies at least one seat.
/// Sums saturate at `u32::MAX` rather than wrapping.
pub fn extract_participants(
    breakdown: &[ParticipantCategory],
    fallback_total: Option<u32>,
) -> ParticipantCounts {
    let mut counts = ParticipantCounts::default();

    for line in breakdown {
        match line.ticket_category {
            Some(TicketCategory::Adult) => counts.adults = counts.adults.saturating_add(line.quantity),
            Some(TicketCategory::Child) => counts.children = counts.children.saturating_add(line.quantity),
            Some(TicketCategory::Infant) => counts.infants = counts.infants.saturating_add(line.quantity),
            Some(TicketCategory::Unknown) | None => {
                warn!(
                    category_id = line.category_id.as_deref().unwrap_or("<none>"),
                    quantity = line.quantity,
                    "unrecognised ticket category; counting as adult"
                );
                counts.adults = counts.adults.saturating_add(line.quantity);
            }
        }
    }

    counts.total = counts
        .adults
        .saturating_add(counts.children)
        .saturating_add(counts.infants);
    if counts.total == 0 {
        counts.total = fallback_total.filter(|t| *t > 0).unwrap_or(1);
    }
    counts
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A booking as reported by the upstream system, before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBookingRecord {
    pub external_booking_id: String,
    pub product_id: String,
    pub start: DateTime<Utc>,
    pub start_time: Option<String>,
    pub participants: Vec<ParticipantCategory>,
    pub total_participants: Option<u32>,
    pub customer: Customer,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub raw: JsonValue,
}

impl ExternalBookingRecord {
    pub fn booking_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    /// Upstream time-of-day string, or `HH:MM` of the start timestamp.
    pub fn booking_time(&self) -> String {
        self.start_time
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| self.start.format("%H:%M").to_string())
    }

    pub fn is_confirmed(&self) -> bool {
        is_confirmed(&self.status)
    }

    /// Composite key for probable-duplicate detection. Records without an
    /// email never collide.
    pub fn soft_key(&self) -> Option<(String, NaiveDate, String)> {
        let email = self
            .customer
            .email
            .as_deref()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())?;
        Some((email, self.booking_date(), self.booking_time()))
    }

    pub fn to_cache_row(
        &self,
        tour_type: &str,
        source: SourceTag,
        synced_at: DateTime<Utc>,
    ) -> CacheRow {
        let counts = extract_participants(&self.participants, self.total_participants);
        CacheRow {
            external_booking_id: self.external_booking_id.clone(),
            product_id: self.product_id.clone(),
            booking_date: self.booking_date(),
            booking_time: self.booking_time(),
            status: self.status.clone(),
            customer_name: self.customer.name.clone(),
            customer_email: self.customer.email.clone(),
            customer_phone: self.customer.phone.clone(),
            adults: counts.adults,
            children: counts.children,
            infants: counts.infants,
            total_participants: counts.total,
            tour_type: tour_type.to_string(),
            raw_payload: self.raw.clone(),
            source,
            last_synced_at: synced_at,
        }
    }
}

/// Which ingestion path last wrote a cached booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Webhook,
    BulkSync,
}

impl SourceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::BulkSync => "bulk_sync",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "bulk_sync" => Ok(Self::BulkSync),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

/// Durable cache row, unique per external booking id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub external_booking_id: String,
    pub product_id: String,
    pub booking_date: NaiveDate,
    pub booking_time: String,
    pub status: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub adults: u32,
    pub children: u32,
    pub infants: u32,
    pub total_participants: u32,
    pub tour_type: String,
    pub raw_payload: JsonValue,
    pub source: SourceTag,
    pub last_synced_at: DateTime<Utc>,
}

impl CacheRow {
    pub fn counts_toward_occupancy(&self) -> bool {
        is_confirmed(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMapping {
    pub upstream_product_id: String,
    pub tour_type: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Authoritative spot count for one time slot, as pushed by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub time_slot: String,
    pub available_spots: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityCacheEntry {
    pub product_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
    pub available_spots: u32,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AvailabilityCacheEntry {
    /// Entries at or past expiry are treated as absent.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Completed,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "syncing" => Ok(Self::Syncing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Per-product bookkeeping written by the bulk orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub product_id: String,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_row_count: u64,
    pub status: SyncStatus,
    pub last_error: Option<String>,
}

/// Inclusive date range pulled by a bulk sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SyncWindow {
    pub fn around(today: NaiveDate, months_back: u32, months_forward: u32) -> Self {
        Self {
            start: today
                .checked_sub_months(Months::new(months_back))
                .unwrap_or(NaiveDate::MIN),
            end: today
                .checked_add_months(Months::new(months_forward))
                .unwrap_or(NaiveDate::MAX),
        }
    }
}

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::Serialize;
use toursync_core::ExternalBookingRecord;
use tracing::{info, warn};

/// Identity used by the deduplicator.
pub trait BookingIdentity {
    fn external_id(&self) -> &str;
    fn soft_key(&self) -> Option<(String, NaiveDate, String)>;
}

impl BookingIdentity for ExternalBookingRecord {
    fn external_id(&self) -> &str {
        &self.external_booking_id
    }

    fn soft_key(&self) -> Option<(String, NaiveDate, String)> {
        ExternalBookingRecord::soft_key(self)
    }
}

/// A fetched booking tagged with the local tour type of the product it was
/// pulled for.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedBooking {
    pub tour_type: String,
    pub record: ExternalBookingRecord,
}

impl BookingIdentity for MappedBooking {
    fn external_id(&self) -> &str {
        &self.record.external_booking_id
    }

    fn soft_key(&self) -> Option<(String, NaiveDate, String)> {
        self.record.soft_key()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub input: usize,
    pub hard_dropped: usize,
    pub soft_flagged: usize,
    pub output: usize,
}

/// A kept record that shares (email, date, time) with an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftDuplicate {
    pub external_booking_id: String,
    pub first_seen_id: String,
    pub email: String,
    pub date: NaiveDate,
    pub time: String,
}

#[derive(Debug, Clone)]
pub struct DedupOutcome<T> {
    pub records: Vec<T>,
    pub stats: DedupStats,
    pub flagged: Vec<SoftDuplicate>,
}

/// Drops exact repeats by external id (first seen wins) and flags, without
/// dropping, distinct bookings that collide on email, date and time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator;

impl Deduplicator {
    pub fn new() -> Self {
        Self
    }

    pub fn apply<T: BookingIdentity>(&self, items: Vec<T>) -> DedupOutcome<T> {
        let input = items.len();

        let mut seen_ids: HashSet<String> = HashSet::with_capacity(input);
        let mut records = Vec::with_capacity(input);
        for item in items {
            if seen_ids.insert(item.external_id().to_string()) {
                records.push(item);
            }
        }
        let hard_dropped = input - records.len();
        if hard_dropped > 0 {
            info!(dropped = hard_dropped, "dropped repeated external booking ids");
        }

        let mut first_by_key: HashMap<(String, NaiveDate, String), String> = HashMap::new();
        let mut flagged = Vec::new();
        for item in &records {
            let Some(key) = item.soft_key() else {
                continue;
            };
            match first_by_key.get(&key) {
                Some(first) => {
                    warn!(
                        booking_id = item.external_id(),
                        first_seen = first.as_str(),
                        date = %key.1,
                        time = key.2.as_str(),
                        "probable duplicate booking (same email, date and time); keeping both"
                    );
                    flagged.push(SoftDuplicate {
                        external_booking_id: item.external_id().to_string(),
                        first_seen_id: first.clone(),
                        email: key.0.clone(),
                        date: key.1,
                        time: key.2.clone(),
                    });
                }
                None => {
                    first_by_key.insert(key, item.external_id().to_string());
                }
            }
        }

        let stats = DedupStats {
            input,
            hard_dropped,
            soft_flagged: flagged.len(),
            output: records.len(),
        };
        DedupOutcome {
            records,
            stats,
            flagged,
        }
    }
}

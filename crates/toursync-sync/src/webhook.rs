//! Single-event ingestion for upstream webhook pushes.
//!
//! A delivery moves `received -> verified -> dispatched` and ends handled,
//! skipped or failed. Skips are acknowledged so the upstream does not retry
//! events that would be ignored again; failures surface as [`IngestError`].
//! Without a configured secret nothing verifies.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use toursync_core::{ExternalBookingRecord, SourceTag};
use toursync_storage::{AvailabilityCacheInvalidator, CacheUpsertWriter, ProductMapper};
use toursync_upstream::{booking_id_of, parse_availability, parse_booking, SignatureVerifier};
use tracing::{error, info, info_span, warn, Instrument};

use crate::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    BookingCreated,
    BookingCancelled,
    BookingModified,
    AvailabilityUpdated,
}

impl EventKind {
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type.trim().to_ascii_lowercase().as_str() {
            "booking.created" => Some(Self::BookingCreated),
            "booking.cancelled" | "booking.canceled" => Some(Self::BookingCancelled),
            "booking.modified" | "booking.updated" => Some(Self::BookingModified),
            "availability.updated" => Some(Self::AvailabilityUpdated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownEventType,
    UnmappedProduct(String),
    BookingNotFound(String),
    MalformedEvent(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownEventType => f.write_str("unknown event type"),
            Self::UnmappedProduct(id) => write!(f, "product {id} is not mapped"),
            Self::BookingNotFound(id) => write!(f, "booking {id} is not cached"),
            Self::MalformedEvent(msg) => write!(f, "malformed event: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Handled { event_type: String },
    Skipped { event_type: String, reason: SkipReason },
}

impl WebhookOutcome {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Handled { event_type } | Self::Skipped { event_type, .. } => event_type,
        }
    }
}

enum Step {
    Done,
    Skip(SkipReason),
}

pub struct WebhookIngester {
    verifier: SignatureVerifier,
    mapper: Arc<ProductMapper>,
    writer: CacheUpsertWriter,
    invalidator: Arc<AvailabilityCacheInvalidator>,
}

impl WebhookIngester {
    pub fn new(
        verifier: SignatureVerifier,
        mapper: Arc<ProductMapper>,
        writer: CacheUpsertWriter,
        invalidator: Arc<AvailabilityCacheInvalidator>,
    ) -> Self {
        Self {
            verifier,
            mapper,
            writer,
            invalidator,
        }
    }

    /// Verify and process one raw delivery.
    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, IngestError> {
        if !self.verifier.is_configured() {
            error!("WEBHOOK_SECRET is not set; rejecting webhook delivery");
            return Err(IngestError::Authentication);
        }
        if !self.verifier.verify(body, signature) {
            warn!("webhook signature verification failed");
            return Err(IngestError::Authentication);
        }

        let envelope: WebhookEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "webhook body is not a valid event envelope");
                return Ok(WebhookOutcome::Skipped {
                    event_type: "unknown".to_string(),
                    reason: SkipReason::MalformedEvent(err.to_string()),
                });
            }
        };
        self.dispatch(envelope).await
    }

    /// Route an already-verified event to its handler.
    pub async fn dispatch(&self, envelope: WebhookEnvelope) -> Result<WebhookOutcome, IngestError> {
        let event_type = envelope.event_type.clone();
        let span = info_span!("webhook_event", event_type = event_type.as_str());
        async move {
            let now = Utc::now();
            let step = match EventKind::parse(&event_type) {
                Some(EventKind::BookingCreated) => self.booking_created(envelope.data, now).await?,
                Some(EventKind::BookingCancelled) => {
                    self.booking_cancelled(&envelope.data, now).await?
                }
                Some(EventKind::BookingModified) => self.booking_modified(envelope.data, now).await?,
                Some(EventKind::AvailabilityUpdated) => {
                    self.availability_updated(envelope.data).await?
                }
                None => Step::Skip(SkipReason::UnknownEventType),
            };

            Ok(match step {
                Step::Done => {
                    info!("webhook event handled");
                    WebhookOutcome::Handled { event_type }
                }
                Step::Skip(reason) => {
                    info!(%reason, "webhook event skipped");
                    WebhookOutcome::Skipped { event_type, reason }
                }
            })
        }
        .instrument(span)
        .await
    }

    /// Decode a booking payload and resolve its tour type without writing anything.
    async fn mapped_booking(
        &self,
        data: JsonValue,
    ) -> Result<Result<(ExternalBookingRecord, String), SkipReason>, IngestError> {
        let record = match parse_booking(data) {
            Ok(record) => record,
            Err(err) => return Ok(Err(SkipReason::MalformedEvent(err.to_string()))),
        };
        match self.mapper.resolve_local_type(&record.product_id).await? {
            Some(tour_type) => Ok(Ok((record, tour_type))),
            None => Ok(Err(SkipReason::UnmappedProduct(record.product_id))),
        }
    }

    async fn cache_booking(
        &self,
        record: ExternalBookingRecord,
        tour_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Step, IngestError> {
        let row = record.to_cache_row(tour_type, SourceTag::Webhook, now);
        self.writer.upsert(std::slice::from_ref(&row)).await?;
        self.invalidator
            .invalidate_product(&row.product_id, row.booking_date)
            .await?;
        info!(
            booking_id = row.external_booking_id.as_str(),
            tour_type,
            participants = row.total_participants,
            "external booking cached"
        );
        Ok(Step::Done)
    }

    async fn booking_created(&self, data: JsonValue, now: DateTime<Utc>) -> Result<Step, IngestError> {
        match self.mapped_booking(data).await? {
            Ok((record, tour_type)) => self.cache_booking(record, &tour_type, now).await,
            Err(reason) => Ok(Step::Skip(reason)),
        }
    }

    async fn booking_cancelled(&self, data: &JsonValue, now: DateTime<Utc>) -> Result<Step, IngestError> {
        let Some(booking_id) = booking_id_of(data) else {
            return Ok(Step::Skip(SkipReason::MalformedEvent(
                "cancellation without booking id".to_string(),
            )));
        };
        let Some(row) = self.writer.mark_cancelled(&booking_id, now).await? else {
            return Ok(Step::Skip(SkipReason::BookingNotFound(booking_id)));
        };
        self.invalidator
            .invalidate_product(&row.product_id, row.booking_date)
            .await?;
        info!(booking_id = booking_id.as_str(), "external booking cancelled");
        Ok(Step::Done)
    }

    /// Cancel-then-recreate from the same payload, applied only once the
    /// payload decodes and its product is mapped. The availability cache is
    /// invalidated twice, once for the old slot and once for the new one.
    async fn booking_modified(&self, data: JsonValue, now: DateTime<Utc>) -> Result<Step, IngestError> {
        let (record, tour_type) = match self.mapped_booking(data).await? {
            Ok(mapped) => mapped,
            Err(reason) => return Ok(Step::Skip(reason)),
        };
        if let Some(previous) = self
            .writer
            .mark_cancelled(&record.external_booking_id, now)
            .await?
        {
            self.invalidator
                .invalidate_product(&previous.product_id, previous.booking_date)
                .await?;
        }
        self.cache_booking(record, &tour_type, now).await
    }

    async fn availability_updated(&self, data: JsonValue) -> Result<Step, IngestError> {
        let update = match parse_availability(data) {
            Ok(update) => update,
            Err(err) => return Ok(Step::Skip(SkipReason::MalformedEvent(err.to_string()))),
        };
        if self.mapper.resolve_local_type(&update.product_id).await?.is_none() {
            return Ok(Step::Skip(SkipReason::UnmappedProduct(update.product_id)));
        }

        if update.slots.is_empty() {
            self.invalidator
                .invalidate_product(&update.product_id, update.date)
                .await?;
        } else {
            self.invalidator
                .refresh(&update.product_id, update.date, &update.slots)
                .await?;
        }
        Ok(Step::Done)
    }
}

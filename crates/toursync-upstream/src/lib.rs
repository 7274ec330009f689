//! Upstream channel-manager contracts: booking wire format, request signing,
//! webhook signature verification and the bounded paginated booking fetch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use thiserror::Error;
use toursync_core::{
    AvailabilitySlot, Customer, ExternalBookingRecord, ParticipantCategory, SyncWindow, TicketCategory,
    CONFIRMED_STATUS,
};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "toursync-upstream";

pub const SIGNATURE_PREFIX: &str = "sha256=";
pub const SEARCH_PATH: &str = "/booking.json/booking-search";
pub const HEADER_DATE: &str = "x-upstream-date";
pub const HEADER_ACCESS_KEY: &str = "x-upstream-accesskey";
pub const HEADER_SIGNATURE: &str = "x-upstream-signature";

const ERROR_BODY_LIMIT: usize = 200;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("missing upstream configuration: {0}")]
    Configuration(&'static str),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned http status {status} on page {page}: {body}")]
    HttpStatus { status: u16, page: u32, body: String },
    #[error("malformed upstream payload: {0}")]
    Decode(String),
}

fn hmac_hex(secret: &[u8], parts: &[&[u8]]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    for part in parts {
        mac.update(part);
    }
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Checks that a webhook body was signed with the shared secret.
///
/// The header carries a lowercase hex HMAC-SHA256 of the raw body, optionally
/// prefixed with `sha256=`. Anything missing fails closed.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("configured", &self.secret.is_some())
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
        hmac_hex(secret.as_bytes(), &[body])
    }

    pub fn verify(&self, body: &[u8], header: Option<&str>) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            warn!("webhook secret not configured; rejecting payload");
            return false;
        };
        let Some(supplied) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return false;
        };
        let supplied = supplied.strip_prefix(SIGNATURE_PREFIX).unwrap_or(supplied);
        let Ok(signature) = hex::decode(supplied) else {
            debug!("webhook signature is not valid hex");
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }
}

#[derive(Clone)]
pub struct UpstreamCredentials {
    pub base_url: String,
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("base_url", &self.base_url)
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl UpstreamCredentials {
    /// All three values must be present and non-empty.
    pub fn from_parts(
        base_url: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
    ) -> Result<Self, UpstreamError> {
        fn required(value: Option<String>, name: &'static str) -> Result<String, UpstreamError> {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or(UpstreamError::Configuration(name))
        }
        Ok(Self {
            base_url: required(base_url, "UPSTREAM_API_BASE_URL")?,
            access_key: required(access_key, "UPSTREAM_ACCESS_KEY")?,
            secret_key: required(secret_key, "UPSTREAM_SECRET_KEY")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub date: String,
    pub access_key: String,
    pub signature: String,
}

/// Timestamped request signature: HMAC over date, access key, method and path.
#[derive(Clone)]
pub struct RequestSigner {
    access_key: String,
    secret_key: String,
}

impl RequestSigner {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn format_date(at: DateTime<Utc>) -> String {
        at.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    pub fn signature(&self, date: &str, method: &str, path: &str) -> Result<String, UpstreamError> {
        hmac_hex(
            self.secret_key.as_bytes(),
            &[
                date.as_bytes(),
                self.access_key.as_bytes(),
                method.to_ascii_uppercase().as_bytes(),
                path.as_bytes(),
            ],
        )
        .ok_or(UpstreamError::Configuration("UPSTREAM_SECRET_KEY"))
    }

    pub fn sign(
        &self,
        at: DateTime<Utc>,
        method: &str,
        path: &str,
    ) -> Result<SignedHeaders, UpstreamError> {
        let date = Self::format_date(at);
        let signature = self.signature(&date, method, path)?;
        Ok(SignedHeaders {
            date,
            access_key: self.access_key.clone(),
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingSearchRequest {
    pub product_ids: Vec<String>,
    pub start_date_range: DateRange,
    pub page: u32,
    pub page_size: u32,
    pub booking_statuses: Vec<String>,
}

impl BookingSearchRequest {
    pub fn confirmed(product_id: &str, window: SyncWindow, page: u32, page_size: u32) -> Self {
        Self {
            product_ids: vec![product_id.to_string()],
            start_date_range: DateRange {
                from: window.start,
                to: window.end,
            },
            page,
            page_size,
            booking_statuses: vec![CONFIRMED_STATUS.to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingSearchResponse {
    #[serde(default)]
    total_hits: Option<u64>,
    #[serde(default, alias = "items")]
    results: Vec<JsonValue>,
}

/// One decoded page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub records: Vec<ExternalBookingRecord>,
    /// Results on the page including any that failed to decode.
    pub raw_count: usize,
    pub total_hits: Option<u64>,
}

impl SearchPage {
    /// Decode each result, skipping (and logging) malformed ones.
    pub fn from_results(results: Vec<JsonValue>, total_hits: Option<u64>) -> Self {
        let raw_count = results.len();
        let mut records = Vec::with_capacity(raw_count);
        for value in results {
            match parse_booking(value) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "skipping undecodable booking in search page"),
            }
        }
        Self {
            records,
            raw_count,
            total_hits,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Text(String),
}

impl WireTimestamp {
    fn to_utc(&self) -> Result<DateTime<Utc>, UpstreamError> {
        match self {
            Self::Millis(ms) => DateTime::from_timestamp_millis(*ms)
                .ok_or_else(|| UpstreamError::Decode(format!("timestamp {ms} out of range"))),
            Self::Text(text) => parse_timestamp_text(text.trim()),
        }
    }
}

fn parse_timestamp_text(text: &str) -> Result<DateTime<Utc>, UpstreamError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Some(midnight) = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }
    Err(UpstreamError::Decode(format!("unrecognised timestamp `{text}`")))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePriceCategory {
    #[serde(default)]
    price_category_id: Option<WireId>,
    #[serde(default)]
    ticket_category: Option<TicketCategory>,
    #[serde(default)]
    quantity: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCustomer {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, alias = "phone")]
    phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBooking {
    #[serde(alias = "bookingId")]
    id: WireId,
    product_id: WireId,
    #[serde(alias = "startDateTime")]
    start_date: WireTimestamp,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    price_category_bookings: Vec<WirePriceCategory>,
    #[serde(default)]
    total_participants: Option<u32>,
    #[serde(default)]
    customer: Option<WireCustomer>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    creation_date: Option<WireTimestamp>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Decode one upstream booking object, keeping the original JSON as the raw
/// audit payload. A missing status is read as confirmed.
pub fn parse_booking(value: JsonValue) -> Result<ExternalBookingRecord, UpstreamError> {
    let wire: WireBooking =
        serde_json::from_value(value.clone()).map_err(|e| UpstreamError::Decode(e.to_string()))?;

    let customer = wire.customer.unwrap_or_default();
    let name = [customer.first_name, customer.last_name]
        .into_iter()
        .filter_map(non_empty)
        .collect::<Vec<_>>()
        .join(" ");

    Ok(ExternalBookingRecord {
        external_booking_id: wire.id.into_string(),
        product_id: wire.product_id.into_string(),
        start: wire.start_date.to_utc()?,
        start_time: non_empty(wire.start_time),
        participants: wire
            .price_category_bookings
            .into_iter()
            .map(|line| ParticipantCategory {
                category_id: line.price_category_id.map(WireId::into_string),
                ticket_category: line.ticket_category,
                quantity: line.quantity,
            })
            .collect(),
        total_participants: wire.total_participants,
        customer: Customer {
            name: Some(name).filter(|n| !n.is_empty()),
            email: non_empty(customer.email),
            phone: non_empty(customer.phone_number),
        },
        status: non_empty(wire.status).unwrap_or_else(|| CONFIRMED_STATUS.to_string()),
        created_at: wire.creation_date.as_ref().map(WireTimestamp::to_utc).transpose()?,
        raw: value,
    })
}

/// Booking id carried by an event payload (`id` or `bookingId`, string or number).
pub fn booking_id_of(value: &JsonValue) -> Option<String> {
    let id = value.get("id").or_else(|| value.get("bookingId"))?;
    match id {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSlot {
    #[serde(alias = "startTime")]
    time: String,
    #[serde(alias = "availabilityCount")]
    available_spots: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAvailability {
    product_id: WireId,
    date: WireTimestamp,
    #[serde(default, alias = "availabilities")]
    slots: Vec<WireSlot>,
}

/// Availability push for one product and day. Empty `slots` means the event
/// carried no authoritative counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityUpdate {
    pub product_id: String,
    pub date: NaiveDate,
    pub slots: Vec<AvailabilitySlot>,
}

pub fn parse_availability(value: JsonValue) -> Result<AvailabilityUpdate, UpstreamError> {
    let wire: WireAvailability =
        serde_json::from_value(value).map_err(|e| UpstreamError::Decode(e.to_string()))?;
    Ok(AvailabilityUpdate {
        product_id: wire.product_id.into_string(),
        date: wire.date.to_utc()?.date_naive(),
        slots: wire
            .slots
            .into_iter()
            .map(|slot| AvailabilitySlot {
                time_slot: slot.time.trim().to_string(),
                available_spots: slot.available_spots,
            })
            .collect(),
    })
}

/// Source of booking-search pages for one product.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        product_id: &str,
        window: SyncWindow,
        page: u32,
        page_size: u32,
    ) -> Result<SearchPage, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Signed `POST` against the upstream booking-search endpoint.
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
    signer: RequestSigner,
}

impl HttpPageSource {
    pub fn new(
        credentials: UpstreamCredentials,
        config: HttpClientConfig,
    ) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            signer: RequestSigner::new(credentials.access_key, credentials.secret_key),
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(
        &self,
        product_id: &str,
        window: SyncWindow,
        page: u32,
        page_size: u32,
    ) -> Result<SearchPage, UpstreamError> {
        let span = info_span!("upstream_page", product_id, page);
        async {
            let headers = self.signer.sign(Utc::now(), "POST", SEARCH_PATH)?;
            let body = BookingSearchRequest::confirmed(product_id, window, page, page_size);

            let resp = self
                .client
                .post(format!("{}{}", self.base_url, SEARCH_PATH))
                .header(HEADER_DATE, &headers.date)
                .header(HEADER_ACCESS_KEY, &headers.access_key)
                .header(HEADER_SIGNATURE, &headers.signature)
                .json(&body)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(UpstreamError::HttpStatus {
                    status: status.as_u16(),
                    page,
                    body: text.chars().take(ERROR_BODY_LIMIT).collect(),
                });
            }

            let parsed: BookingSearchResponse = resp
                .json()
                .await
                .map_err(|e| UpstreamError::Decode(e.to_string()))?;
            let search_page = SearchPage::from_results(parsed.results, parsed.total_hits);
            debug!(
                results = search_page.raw_count,
                total_hits = ?search_page.total_hits,
                "page fetched"
            );
            Ok::<_, UpstreamError>(search_page)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PagingConfig {
    pub page_size: u32,
    /// Hard ceiling on requests per product, for upstreams that never signal completion.
    pub max_pages: u32,
    /// Politeness delay between page requests.
    pub page_delay: Duration,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 20,
            page_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EmptyPage,
    ReachedTotal,
    PageCeiling,
    Aborted,
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<ExternalBookingRecord>,
    pub pages_fetched: u32,
    pub total_hits: Option<u64>,
    pub stop: StopReason,
    /// Set when a page failed; `records` then holds the partial result.
    pub error: Option<UpstreamError>,
}

/// Bounded pagination over a [`PageSource`] for one product and window.
#[derive(Clone)]
pub struct PagedFetcher {
    source: Arc<dyn PageSource>,
    config: PagingConfig,
}

impl PagedFetcher {
    pub fn new(source: Arc<dyn PageSource>, config: PagingConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> PagingConfig {
        self.config
    }

    pub async fn fetch_all(&self, product_id: &str, window: SyncWindow) -> FetchOutcome {
        let mut records = Vec::new();
        let mut accumulated = 0u64;
        let mut total_hits = None;
        let mut pages_fetched = 0u32;
        let mut error = None;
        let mut page = 1u32;

        let stop = loop {
            if page > self.config.max_pages {
                warn!(
                    product_id,
                    max_pages = self.config.max_pages,
                    accumulated,
                    "page ceiling reached; stopping pagination"
                );
                break StopReason::PageCeiling;
            }
            if page > 1 && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }

            let result = self
                .source
                .fetch_page(product_id, window, page, self.config.page_size)
                .await;
            let fetched = match result {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(product_id, page, error = %err, accumulated, "page fetch failed; aborting product");
                    error = Some(err);
                    break StopReason::Aborted;
                }
            };

            pages_fetched += 1;
            if fetched.raw_count == 0 {
                break StopReason::EmptyPage;
            }
            accumulated += fetched.raw_count as u64;
            records.extend(fetched.records);
            if fetched.total_hits.is_some() {
                total_hits = fetched.total_hits;
            }
            if total_hits.is_some_and(|total| accumulated >= total) {
                break StopReason::ReachedTotal;
            }
            page += 1;
        };

        info!(
            product_id,
            pages_fetched,
            records = records.len(),
            stop = ?stop,
            "product pagination finished"
        );
        FetchOutcome {
            records,
            pages_fetched,
            total_hits,
            stop,
            error,
        }
    }
}

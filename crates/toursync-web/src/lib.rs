//! HTTP surface: signed webhook intake, on-demand bulk sync and health.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use toursync_sync::{BulkSyncOrchestrator, Engine, IngestError, WebhookIngester, WebhookOutcome};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "toursync-web";

/// Header carrying the webhook HMAC; `x-signature` is accepted as a fallback.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
const FALLBACK_SIGNATURE_HEADER: &str = "x-signature";

#[derive(Clone)]
pub struct AppState {
    pub ingester: Arc<WebhookIngester>,
    pub orchestrator: Arc<BulkSyncOrchestrator>,
}

impl AppState {
    pub fn new(ingester: Arc<WebhookIngester>, orchestrator: Arc<BulkSyncOrchestrator>) -> Self {
        Self {
            ingester,
            orchestrator,
        }
    }

    pub fn from_engine(engine: &Engine) -> Self {
        Self::new(
            Arc::clone(&engine.ingester),
            Arc::clone(&engine.orchestrator),
        )
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler).options(preflight_handler))
        .route("/sync-all", get(sync_all_handler).post(sync_all_handler))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

pub async fn serve(engine: &Engine) -> anyhow::Result<()> {
    let port = engine.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(AppState::from_engine(engine))).await?;
    Ok(())
}

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(FALLBACK_SIGNATURE_HEADER))
        .and_then(|value| value.to_str().ok())
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.ingester.ingest(&body, signature_header(&headers)).await {
        Ok(WebhookOutcome::Handled { event_type }) => {
            Json(json!({ "success": true, "processed": event_type })).into_response()
        }
        Ok(WebhookOutcome::Skipped { event_type, reason }) => Json(json!({
            "success": true,
            "processed": event_type,
            "skipped": reason.to_string(),
        }))
        .into_response(),
        Err(IngestError::Authentication) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid signature" })),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "webhook processing failed");
            server_error("Webhook processing failed", &err)
        }
    }
}

async fn preflight_handler() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, x-webhook-signature, x-signature"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.sync_all().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(error = %err, "bulk sync failed");
            server_error("Bulk sync failed", &err)
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.health().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            error!(error = %err, "health check failed");
            server_error("Health check failed", &err)
        }
    }
}

async fn not_found_handler() -> Response {
    warn!("request for unknown path");
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

fn server_error(message: &str, err: &IngestError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message, "details": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use toursync_core::{ProductMapping, SyncWindow};
    use toursync_storage::{BookingStore, MemoryStore};
    use toursync_sync::{ConfigError, SyncConfig};
    use toursync_upstream::{PageSource, SearchPage, SignatureVerifier, UpstreamError};
    use tower::ServiceExt;

    const SECRET: &str = "whsec_web";

    /// Product "48213" fails on its second page; every other product returns one booking.
    struct FlakySource;

    #[async_trait]
    impl PageSource for FlakySource {
        async fn fetch_page(
            &self,
            product_id: &str,
            _window: SyncWindow,
            page: u32,
            _page_size: u32,
        ) -> Result<SearchPage, UpstreamError> {
            match (product_id, page) {
                ("48213", 1) => Ok(SearchPage::from_results(
                    vec![booking_json(1, "48213"), booking_json(2, "48213")],
                    Some(10),
                )),
                ("48213", _) => Err(UpstreamError::HttpStatus {
                    status: 500,
                    page,
                    body: "upstream exploded".into(),
                }),
                (other, 1) => Ok(SearchPage::from_results(vec![booking_json(3, other)], Some(1))),
                _ => Ok(SearchPage::default()),
            }
        }
    }

    fn booking_json(id: u32, product: &str) -> JsonValue {
        json!({
            "id": id,
            "productId": product,
            "startDate": "2026-07-04T09:00:00Z",
            "priceCategoryBookings": [{"ticketCategory": "ADULT", "quantity": 2}],
            "customer": {"firstName": "Marta", "email": format!("guest{id}@example.com")},
            "status": "CONFIRMED"
        })
    }

    fn mappings() -> Vec<ProductMapping> {
        vec![
            ProductMapping {
                upstream_product_id: "48213".into(),
                tour_type: "sunset-sail".into(),
                active: true,
            },
            ProductMapping {
                upstream_product_id: "48214".into(),
                tour_type: "dolphin-watch".into(),
                active: true,
            },
        ]
    }

    fn engine_with(store: Arc<MemoryStore>, source: Result<Arc<dyn PageSource>, ConfigError>) -> Engine {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.webhook_secret = Some(SECRET.into());
        config.page_delay_ms = 0;
        Engine::from_parts(config, store, source)
    }

    fn test_app(store: Arc<MemoryStore>) -> Router {
        let engine = engine_with(store, Ok(Arc::new(FlakySource)));
        app(AppState::from_engine(&engine))
    }

    fn signed_webhook(body: &JsonValue) -> Request<Body> {
        let bytes = serde_json::to_vec(body).unwrap();
        let signature = SignatureVerifier::sign(SECRET, &bytes).unwrap();
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, format!("sha256={signature}"))
            .body(Body::from(bytes))
            .unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn webhook_for_mapped_product_is_cached() {
        let store = Arc::new(MemoryStore::with_mappings(mappings()));
        let resp = test_app(Arc::clone(&store))
            .oneshot(signed_webhook(&json!({
                "type": "booking.created",
                "data": booking_json(501, "48213"),
                "timestamp": "2026-07-01T08:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed"], "booking.created");
        let rows = store.cache_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].adults, 2);
    }

    #[tokio::test]
    async fn webhook_for_unmapped_product_is_acknowledged() {
        let store = Arc::new(MemoryStore::with_mappings(mappings()));
        let resp = test_app(Arc::clone(&store))
            .oneshot(signed_webhook(&json!({
                "type": "booking.created",
                "data": booking_json(502, "77777"),
                "timestamp": "2026-07-01T08:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["processed"], "booking.created");
        assert!(store.cache_rows().await.is_empty());
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_unauthorized() {
        let store = Arc::new(MemoryStore::with_mappings(mappings()));
        let resp = test_app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(SIGNATURE_HEADER, "sha256=deadbeef")
                    .body(Body::from(r#"{"type":"booking.created","data":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["error"], "Invalid signature");
    }

    #[tokio::test]
    async fn webhook_persistence_failure_is_a_server_error() {
        let store = Arc::new(MemoryStore::with_mappings(mappings()));
        store.fail_cache_writes(true);
        let resp = test_app(store)
            .oneshot(signed_webhook(&json!({
                "type": "booking.created",
                "data": booking_json(503, "48213"),
                "timestamp": "2026-07-01T08:00:00Z"
            })))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert!(body["error"].is_string());
        assert!(body["details"].as_str().unwrap().contains("persistence"));
    }

    #[tokio::test]
    async fn webhook_rejects_other_methods_and_answers_preflight() {
        let app = test_app(Arc::new(MemoryStore::default()));
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/webhook").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/webhook")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let resp = test_app(Arc::new(MemoryStore::default()))
            .oneshot(Request::builder().uri("/bookings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_all_reports_partial_failure() {
        let store = Arc::new(MemoryStore::with_mappings(mappings()));
        let resp = test_app(Arc::clone(&store))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync-all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["products_processed"], 2);
        assert_eq!(body["total_bookings_cached"], 3);
        let results = body["results"].as_array().unwrap();
        let failed = results.iter().find(|r| r["product_id"] == "48213").unwrap();
        assert_eq!(failed["success"], false);
        assert!(failed["error"].as_str().unwrap().contains("500"));
        let ok = results.iter().find(|r| r["product_id"] == "48214").unwrap();
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());
        assert!(body["date_range"]["start"].is_string());
    }

    #[tokio::test]
    async fn sync_all_without_credentials_fails_closed() {
        let store = Arc::new(MemoryStore::with_mappings(mappings()));
        let engine = engine_with(store, Err(ConfigError::Missing("UPSTREAM_ACCESS_KEY")));
        let resp = app(AppState::from_engine(&engine))
            .oneshot(Request::builder().uri("/sync-all").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert!(body["details"].as_str().unwrap().contains("UPSTREAM_ACCESS_KEY"));
    }

    #[tokio::test]
    async fn health_lists_cache_totals() {
        let store = Arc::new(MemoryStore::with_mappings(mappings()));
        let app = test_app(Arc::clone(&store));
        app.clone()
            .oneshot(Request::builder().uri("/sync-all").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["cache_health"]["total_cached_bookings"], 3);
        assert_eq!(
            body["cache_health"]["products_metadata"].as_array().unwrap().len(),
            2
        );
        assert_eq!(store.count_cache_rows().await.unwrap(), 3);
    }
}

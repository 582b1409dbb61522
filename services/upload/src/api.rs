use crate::auth::{require_secret, CredentialStore};
use crate::config::{ApiConfig, StatisticsConfig};
use crate::ingestion::IngestionService;
use crate::models::{Image, IncomingFile, StatisticCategory, StatisticCounter};
use crate::store::{HealthCheck, ImageStore, StatisticsStore, UploadLinkStore};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Multipart field carrying the uploaded files
pub const IMAGES_FIELD: &str = "images";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub links: Arc<dyn UploadLinkStore>,
    pub images: Arc<dyn ImageStore>,
    pub statistics: Arc<dyn StatisticsStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub health: Arc<dyn HealthCheck>,
    pub limits: StatisticsConfig,
    /// Scheme and host used in upload-link URLs
    pub public_base_url: Option<String>,
}

type ApiError = (StatusCode, String);

fn internal_error(message: &str) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
}

/// Statistics endpoint body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsResponse {
    pub most_popular_image_format: Vec<StatisticCounter>,
    pub most_popular_camera_models: Vec<StatisticCounter>,
    pub upload_frequency_per_day: Vec<StatisticCounter>,
}

#[derive(Debug, Deserialize)]
pub struct UploadLinkForm {
    /// RFC 3339 timestamp
    pub expiration: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let admin = Router::new()
        .route("/api/v1/upload-link", post(create_upload_link))
        .route("/api/v1/statistics", get(get_statistics))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_secret));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/images/:id", get(get_image).post(upload_images))
        .merge(admin)
        .layer(DefaultBodyLimit::max(config.max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "upload-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.health.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": format!("{e:#}")
            })),
        ),
    }
}

/// Accept a multipart upload for one upload link.
///
/// The link is checked before the body is touched, so a dead link answers
/// 404/403 whatever the body looks like.
#[instrument(skip(state, request))]
async fn upload_images(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Vec<Uuid>>, ApiError> {
    let upload_link_id = Uuid::parse_str(&id)
        .map_err(|_| (StatusCode::NOT_FOUND, "upload link not found".to_string()))?;

    state
        .ingestion
        .check_link(upload_link_id)
        .await
        .map_err(|e| (e.status_code(), e.public_message()))?;

    let mut multipart = Multipart::from_request(request, &state)
        .await
        .map_err(|e| (e.status(), e.body_text()))?;

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        if field.name() != Some(IMAGES_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| (e.status(), e.body_text()))?;

        files.push(IncomingFile::new(file_name, data.to_vec()));
    }

    state
        .ingestion
        .handle(upload_link_id, files)
        .await
        .map(Json)
        .map_err(|e| (e.status_code(), e.public_message()))
}

/// Get single image record
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    let not_found = || (StatusCode::NOT_FOUND, "image not found".to_string());

    let image_id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let image = state.images.get_by_id(image_id).await.map_err(|e| {
        error!(error = %format!("{e:#}"), "Failed to get image");
        internal_error("failed to load image")
    })?;

    image.map(Json).ok_or_else(not_found)
}

/// Create an upload link and return its public URL
#[instrument(skip(state, headers, form))]
async fn create_upload_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<UploadLinkForm>,
) -> Result<Json<String>, ApiError> {
    let expires_at = parse_expiration(form.expiration.as_deref(), Utc::now())
        .map_err(|message| (StatusCode::BAD_REQUEST, message))?;

    let link = state.links.create(expires_at).await.map_err(|e| {
        error!(error = %format!("{e:#}"), "Failed to create upload link");
        internal_error("failed to create upload link")
    })?;

    let base_url = match state.public_base_url {
        Some(ref url) => url.clone(),
        None => headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|host| format!("http://{host}"))
            .unwrap_or_default(),
    };

    info!(upload_link_id = %link.id, expires_at = %link.expires_at, "Upload link created");
    Ok(Json(upload_link_url(&base_url, link.id)))
}

/// Aggregated upload statistics
#[instrument(skip(state))]
async fn get_statistics(
    State(state): State<AppState>,
) -> Result<Json<StatisticsResponse>, ApiError> {
    load_statistics(state.statistics.as_ref(), &state.limits)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %format!("{e:#}"), "Failed to load statistics");
            internal_error("failed to load statistics")
        })
}

async fn load_statistics(
    store: &dyn StatisticsStore,
    limits: &StatisticsConfig,
) -> Result<StatisticsResponse> {
    Ok(StatisticsResponse {
        most_popular_image_format: store
            .top_by_count(StatisticCategory::ImageFormat, limits.format_limit)
            .await
            .context("image formats")?,
        most_popular_camera_models: store
            .top_by_count(StatisticCategory::CameraModel, limits.camera_model_limit)
            .await
            .context("camera models")?,
        upload_frequency_per_day: store
            .top_by_name(StatisticCategory::DayBucket, limits.day_limit)
            .await
            .context("upload frequency")?,
    })
}

/// Validate a requested expiration; it must parse as RFC 3339 and lie after `now`
pub fn parse_expiration(
    raw: Option<&str>,
    now: DateTime<Utc>,
) -> std::result::Result<DateTime<Utc>, String> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "expiration is required".to_string())?;

    let expires_at = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("invalid expiration {raw:?}: {e}"))?
        .with_timezone(&Utc);

    if expires_at <= now {
        return Err("expiration must be in the future".to_string());
    }
    Ok(expires_at)
}

pub fn upload_link_url(base_url: &str, id: Uuid) -> String {
    format!("{}/api/v1/images/{}", base_url.trim_end_matches('/'), id)
}

/// Start the API server; returns once `shutdown` fires and in-flight
/// requests have finished
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticCredentialStore, SECRET_HEADER};
    use crate::testing::{png_bytes, image_record, InMemoryBlobStore, InMemoryStore, RecordingPublisher};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cr3t";
    const BOUNDARY: &str = "pixtally-boundary";

    struct Harness {
        store: Arc<InMemoryStore>,
        publisher: Arc<RecordingPublisher>,
        router: Router,
    }

    fn harness() -> Harness {
        harness_with(ApiConfig::default())
    }

    fn harness_with(config: ApiConfig) -> Harness {
        let store = Arc::new(InMemoryStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let ingestion = Arc::new(IngestionService::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryBlobStore::default()),
            publisher.clone(),
            Duration::from_millis(200),
        ));
        let state = AppState {
            ingestion,
            links: store.clone(),
            images: store.clone(),
            statistics: store.clone(),
            credentials: Arc::new(StaticCredentialStore::new(HashMap::from([(
                TOKEN.to_string(),
                "admin".to_string(),
            )]))),
            health: store.clone(),
            limits: StatisticsConfig::default(),
            public_base_url: Some("https://img.example.com/".to_string()),
        };
        Harness {
            store,
            publisher,
            router: create_router(state, &config),
        }
    }

    fn multipart_body(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{IMAGES_FIELD}\"; \
                     filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(link: &str, files: &[(&str, Vec<u8>)]) -> Request<Body> {
        Request::post(format!("/api/v1/images/{link}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(files)))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_upload_returns_inserted_ids() {
        let h = harness();
        let link = h.store.valid_link();

        let (status, body) = send(
            &h.router,
            upload_request(
                &link.to_string(),
                &[("a.png", png_bytes(3, 3)), ("b.png", png_bytes(1, 1))],
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let ids: Vec<Uuid> = serde_json::from_str(&body).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(h.publisher.events(), vec![ids]);
    }

    #[tokio::test]
    async fn test_upload_error_statuses() {
        let h = harness();

        let expired = h.store.expired_link().to_string();
        let (status, body) =
            send(&h.router, upload_request(&expired, &[("a.png", png_bytes(1, 1))])).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "upload link expired");

        let (status, _) =
            send(&h.router, upload_request("not-a-uuid", &[("a.png", png_bytes(1, 1))])).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let valid = h.store.valid_link().to_string();
        let (status, body) =
            send(&h.router, upload_request(&valid, &[("a.txt", b"text".to_vec())])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("unsupported file type"));

        let (status, body) = send(&h.router, upload_request(&valid, &[])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "no images uploaded");
    }

    #[tokio::test]
    async fn test_dead_link_wins_over_bad_body() {
        let h = harness_with(ApiConfig {
            max_request_bytes: 256,
            ..ApiConfig::default()
        });
        let expired = h.store.expired_link().to_string();
        let unknown = Uuid::new_v4().to_string();

        let garbage = |link: &str| {
            Request::post(format!("/api/v1/images/{link}"))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from("this is not multipart"))
                .unwrap()
        };
        let (status, body) = send(&h.router, garbage(&expired)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "upload link expired");

        let (status, _) = send(&h.router, garbage(&unknown)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let no_content_type = Request::post(format!("/api/v1/images/{expired}"))
            .body(Body::from("x"))
            .unwrap();
        let (status, _) = send(&h.router, no_content_type).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let oversized = vec![("a.png", vec![0u8; 4096])];
        let (status, _) = send(&h.router, upload_request(&expired, &oversized)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // A live link still gets the body errors
        let valid = h.store.valid_link().to_string();
        let (status, _) = send(&h.router, garbage(&valid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&h.router, upload_request(&valid, &oversized)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_get_image() {
        let h = harness();
        let image = image_record(
            Some("JPEG"),
            Some("Canon"),
            Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap(),
        );
        let id = h.store.add_image(image);

        let (status, body) = send(
            &h.router,
            Request::get(format!("/api/v1/images/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["imageFormat"], "JPEG");

        for path in [format!("/api/v1/images/{}", Uuid::new_v4()), "/api/v1/images/xyz".to_string()] {
            let (status, _) =
                send(&h.router, Request::get(path).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_statistics_requires_secret() {
        let h = harness();

        let (status, body) = send(
            &h.router,
            Request::get("/api/v1/statistics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Unauthorized");

        let (status, _) = send(
            &h.router,
            Request::get("/api/v1/statistics")
                .header(SECRET_HEADER, "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_statistics_body() {
        let h = harness();
        h.store.set_counter(StatisticCategory::ImageFormat, "JPEG", 100);
        h.store.set_counter(StatisticCategory::ImageFormat, "PNG", 4);
        h.store.set_counter(StatisticCategory::CameraModel, "Canon", 50);
        h.store.set_counter(StatisticCategory::DayBucket, "2023-09-30", 3);
        h.store.set_counter(StatisticCategory::DayBucket, "2023-10-01", 10);

        let (status, body) = send(
            &h.router,
            Request::get("/api/v1/statistics")
                .header(SECRET_HEADER, TOKEN)
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            r#"{"mostPopularImageFormat":[{"name":"JPEG","count":100}],"mostPopularCameraModels":[{"name":"Canon","count":50}],"uploadFrequencyPerDay":[{"name":"2023-10-01","count":10},{"name":"2023-09-30","count":3}]}"#
        );
    }

    fn link_request(token: &str, form: &str) -> Request<Body> {
        Request::post("/api/v1/upload-link")
            .header(SECRET_HEADER, token)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_upload_link() {
        let h = harness();
        let expiration = (Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
        let form = format!("expiration={}", expiration.replace('+', "%2B"));

        let (status, body) = send(&h.router, link_request(TOKEN, &form)).await;
        assert_eq!(status, StatusCode::OK);

        let url: String = serde_json::from_str(&body).unwrap();
        let id = url
            .strip_prefix("https://img.example.com/api/v1/images/")
            .unwrap();
        let link = h.store.link(Uuid::parse_str(id).unwrap()).unwrap();
        assert!(link.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_create_upload_link_rejections() {
        let h = harness();

        let (status, _) = send(&h.router, link_request("nope", "expiration=x")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            send(&h.router, link_request(TOKEN, "expiration=2001-01-01T00:00:00Z")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "expiration must be in the future");

        let (status, _) = send(&h.router, link_request(TOKEN, "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_expiration() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(
            parse_expiration(Some("2024-01-02T00:00:00+02:00"), now),
            Ok(Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap())
        );
        assert!(parse_expiration(Some("2024-01-01T00:00:00Z"), now).is_err());
        assert!(parse_expiration(Some("tomorrow"), now).is_err());
        assert!(parse_expiration(None, now).is_err());
    }

    #[test]
    fn test_upload_link_url() {
        let id = Uuid::nil();
        assert_eq!(
            upload_link_url("http://localhost:8080/", id),
            format!("http://localhost:8080/api/v1/images/{id}")
        );
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let h = harness();
        for path in ["/health", "/ready"] {
            let (status, _) =
                send(&h.router, Request::get(path).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::OK);
        }
    }
}

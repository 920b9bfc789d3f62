use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::detection::DetectionService;
use crate::gallery::{DetectionView, GalleryImage, GalleryService, ListingSource};
use crate::object_store::ObjectStore;
use crate::record_store::RecordStore;
use crate::status::{ProcessingStatus, StatusTracker, UPLOAD_PROCESS};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub objects: Arc<dyn ObjectStore>,
    pub detector: Arc<dyn DetectionService>,
    pub records: Arc<dyn RecordStore>,
    pub tracker: StatusTracker,
    pub gallery: Arc<GalleryService>,
    pub region: String,
    pub upload_prefix: String,
    pub presigned_url_expiry: Duration,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Per-file outcome of an upload request. Stored files report every
/// field, with `rekognition` and `imageId` null when that stage failed;
/// files that never reached storage report only name, status, and error.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum UploadedFile {
    Uploaded {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "originalName")]
        original_name: String,
        #[serde(rename = "s3Key")]
        s3_key: String,
        bucket: String,
        status: String,
        rekognition: Option<DetectionView>,
        #[serde(rename = "uploadTime")]
        upload_time: String,
        processed_at: String,
        #[serde(rename = "imageId")]
        image_id: Option<i64>,
        #[serde(rename = "fileSize")]
        file_size: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Failed {
        #[serde(rename = "fileName")]
        file_name: String,
        status: String,
        error: String,
    },
}

impl UploadedFile {
    fn failure(file_name: String, error: String) -> Self {
        Self::Failed {
            file_name,
            status: "failed".to_string(),
            error,
        }
    }
}

/// Upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub files: Vec<UploadedFile>,
    pub bucket: String,
}

/// Image listing response
#[derive(Debug, Serialize)]
pub struct ListingResponse {
    pub success: bool,
    pub images: Vec<GalleryImage>,
    pub count: usize,
    pub bucket: String,
    pub source: ListingSource,
}

/// Presigned URL response
#[derive(Debug, Serialize)]
pub struct PresignedUrlResponse {
    pub url: String,
    pub success: bool,
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

    Router::new()
        .route("/api/upload", post(upload_images))
        .route("/api/images", get(list_images))
        .route("/api/image/*key", get(get_image_url))
        .route("/api/health", get(health_check))
        .route("/api/status/infrastructure", get(infrastructure_status))
        .route("/api/config", get(service_config))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Accept uploaded files, store each, run detection, persist results
#[instrument(skip(state, multipart))]
async fn upload_images(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut files = Vec::new();
    let mut saw_file_field = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Failed to read multipart body: {e}"),
                code: "MULTIPART_ERROR".to_string(),
            }),
        )
    })? {
        let field_name = field.name().unwrap_or_default().to_string();
        if field_name != "files" && field_name != "file" {
            continue;
        }
        saw_file_field = true;

        let original_name = field.file_name().unwrap_or_default().to_string();
        if original_name.is_empty() {
            continue;
        }

        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let data = match field.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                error!(error = %e, file = %original_name, "Failed to read uploaded file");
                files.push(UploadedFile::failure(original_name, e.to_string()));
                continue;
            }
        };

        files.push(process_upload(&state, original_name, content_type, data).await);
    }

    if !saw_file_field {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "No files provided".to_string(),
                code: "NO_FILES".to_string(),
            }),
        ));
    }

    info!(count = files.len(), "Handled upload request");

    Ok(Json(UploadResponse {
        success: true,
        files,
        bucket: state.objects.bucket().to_string(),
    }))
}

/// Store one uploaded file and run it through the pipeline. Record-store
/// failures degrade the result instead of failing the upload; the object
/// is already durable in storage at that point.
async fn process_upload(
    state: &AppState,
    original_name: String,
    content_type: String,
    data: Vec<u8>,
) -> UploadedFile {
    let file_size = data.len() as i64;
    let key = upload_key(&state.upload_prefix, &original_name);

    if let Err(e) = state
        .objects
        .put_image(&key, data, &content_type, &original_name)
        .await
    {
        error!(error = %e, file = %original_name, "Upload to object storage failed");
        return UploadedFile::failure(original_name, e.to_string());
    }

    metrics::counter!("pictor.uploads.stored").increment(1);
    let upload_time = Utc::now();

    let image_id = match state
        .records
        .resolve_or_create_image(&key, &original_name, file_size, upload_time)
        .await
    {
        Ok(resolved) => {
            state
                .tracker
                .log_event(
                    resolved.id,
                    UPLOAD_PROCESS,
                    "completed",
                    Some(&format!("Uploaded to S3: {key}")),
                )
                .await;
            Some(resolved.id)
        }
        Err(e) => {
            error!(error = %e, key = %key, "Failed to create image record");
            None
        }
    };

    let (rekognition, detection_error) = match state
        .detector
        .analyze_image(state.objects.bucket(), &key)
        .await
    {
        Ok(analysis) => {
            if let Some(id) = image_id {
                match state.records.save_analysis(id, &analysis).await {
                    Ok(()) => {
                        state
                            .tracker
                            .record(
                                id,
                                ProcessingStatus::Completed,
                                Some("Processing completed successfully"),
                                Some(Utc::now()),
                            )
                            .await;
                    }
                    Err(e) => {
                        error!(error = %e, image_id = id, "Failed to save detection results");
                        state
                            .tracker
                            .record(
                                id,
                                ProcessingStatus::Failed,
                                Some(&format!("Processing failed: {e}")),
                                None,
                            )
                            .await;
                    }
                }
            }
            (Some(DetectionView::from_analysis(&analysis)), None)
        }
        Err(e) => {
            error!(error = %e, key = %key, "Detection failed for uploaded image");
            if let Some(id) = image_id {
                state
                    .tracker
                    .record(
                        id,
                        ProcessingStatus::Failed,
                        Some(&format!("Processing failed: {e}")),
                        None,
                    )
                    .await;
            }
            (None, Some(e.to_string()))
        }
    };

    UploadedFile::Uploaded {
        file_name: key.clone(),
        original_name,
        s3_key: key,
        bucket: state.objects.bucket().to_string(),
        status: "uploaded".to_string(),
        rekognition,
        upload_time: upload_time.to_rfc3339(),
        processed_at: Utc::now().to_rfc3339(),
        image_id,
        file_size,
        error: detection_error,
    }
}

/// List all images with their detections
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
) -> Result<Json<ListingResponse>, (StatusCode, Json<ErrorResponse>)> {
    let listing = state.gallery.list_images().await.map_err(|e| {
        error!(error = %e, "Failed to list images");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to list images".to_string(),
                code: "LISTING_ERROR".to_string(),
            }),
        )
    })?;

    Ok(Json(ListingResponse {
        success: true,
        count: listing.images.len(),
        images: listing.images,
        bucket: state.objects.bucket().to_string(),
        source: listing.source,
    }))
}

/// Generate a presigned URL for direct image access
#[instrument(skip(state))]
async fn get_image_url(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<PresignedUrlResponse>, (StatusCode, Json<ErrorResponse>)> {
    let url = state
        .objects
        .presign_get(&key, state.presigned_url_expiry)
        .await
        .map_err(|e| {
            error!(error = %e, key = %key, "Failed to generate presigned URL");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to generate presigned URL".to_string(),
                    code: "PRESIGN_ERROR".to_string(),
                }),
            )
        })?;

    Ok(Json(PresignedUrlResponse { url, success: true }))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "bucket": state.objects.bucket(),
    }))
}

/// Per-component infrastructure status
#[instrument(skip(state))]
async fn infrastructure_status(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = serde_json::Map::new();

    let s3 = match state.objects.health_check().await {
        Ok(()) => serde_json::json!({
            "status": "healthy",
            "message": format!("Bucket {} accessible", state.objects.bucket()),
        }),
        Err(e) => serde_json::json!({
            "status": "unhealthy",
            "message": e.to_string(),
        }),
    };
    components.insert("s3".to_string(), s3);

    let detection = match state.detector.health_check().await {
        Ok(()) => serde_json::json!({
            "status": "healthy",
            "message": "Detection service accessible",
        }),
        Err(e) => serde_json::json!({
            "status": "unhealthy",
            "message": e.to_string(),
        }),
    };
    components.insert("detection".to_string(), detection);

    let database = match state.records.health_check().await {
        Ok(()) => serde_json::json!({
            "status": "healthy",
            "message": "Database reachable",
        }),
        Err(e) => serde_json::json!({
            "status": "unhealthy",
            "message": e.to_string(),
        }),
    };
    components.insert("database".to_string(), database);

    components.insert(
        "api".to_string(),
        serde_json::json!({
            "status": "healthy",
            "message": "API running",
        }),
    );

    let overall = if components.values().any(|c| c["status"] != "healthy") {
        "unhealthy"
    } else {
        "healthy"
    };

    Json(serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "components": components,
        "overall": overall,
    }))
}

/// Non-sensitive service configuration for UI consumption
async fn service_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "s3Bucket": state.objects.bucket(),
        "region": state.region,
        "uploadPrefix": state.upload_prefix,
        "presignedUrlExpirySecs": state.presigned_url_expiry.as_secs(),
    }))
}

/// Unique storage key preserving the original file extension
fn upload_key(prefix: &str, original_name: &str) -> String {
    let extension = std::path::Path::new(original_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    format!("{}{}{}", prefix, Uuid::new_v4(), extension)
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

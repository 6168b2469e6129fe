// Nutrition label scanning service

use nutrition_scanner::{
    core::{types::AppState, Config},
    orchestration::pipeline::{ScanOutcome, ScanPipeline},
    utils::Metrics,
};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

type ApiError = (StatusCode, Json<serde_json::Value>);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "nutrition_scanner={},tower_http=info,ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== NUTRITION LABEL SCANNER ===");
    info!(
        "Config: conf={} iou={} size={} pool={} binarizer={:?}/{:?} llm_key={}",
        config.confidence_threshold(),
        config.iou_threshold(),
        config.target_size(),
        config.onnx_pool_size(),
        config.binarization.strategy,
        config.binarization.threshold_method,
        if config.has_api_key() { "set" } else { "MISSING" }
    );

    #[cfg(not(feature = "tesseract"))]
    warn!("Built without the `tesseract` feature; text recognition is unavailable and startup will fail");

    let metrics = Metrics::new();

    // Model loading is blocking work
    let pipeline = {
        let config = Arc::clone(&config);
        tokio::task::spawn_blocking(move || ScanPipeline::from_config(&config, metrics))
            .await
            .context("Pipeline initialization task failed")?
            .context("Failed to initialize scan pipeline")?
    };

    let state = AppState {
        config: config.clone(),
        pipeline: Arc::new(pipeline),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/scan", post(scan_label))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /         - Root endpoint");
    info!("  GET  /health   - Health check");
    info!("  GET  /metrics  - Prometheus metrics");
    info!("  GET  /stats    - Detailed statistics");
    info!("  POST /scan     - Scan a label photo (multipart field `image`)");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Nutrition Label Scanner"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "detector_backend": state.pipeline.detector_backend(),
        "binarizer": state.pipeline.binarizer_name(),
        "grade_prediction": state.pipeline.grading_available(),
        "extraction_configured": state.config.has_api_key(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.pipeline.metrics().to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    serde_json::to_value(state.pipeline.metrics().snapshot())
        .map(Json)
        .map_err(|e| {
            error!("Failed to serialize metrics: {}", e);
            internal_error()
        })
}

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal_error" })),
    )
}

fn bad_request(message: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "invalid_image", "message": message })),
    )
}

/// Scan endpoint
///
/// # Request Format:
/// - multipart/form-data, field "image": one PNG/JPEG photo
///
/// # Response:
/// - 200 `{success, data, diagnostics}` with the nutrient record
/// - 404 `{error, message}` when no panel, no text or no record was found
/// - 400 for a missing or undecodable image, 500 for internal faults
async fn scan_label(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.pipeline.metrics().record_endpoint_request("/scan");

    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("image") {
            continue;
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("Read error: {}", e)))?;
        if data.is_empty() {
            return Err(bad_request("Uploaded image is empty".to_string()));
        }

        info!("Received image ({} bytes)", data.len());
        upload = Some(store_upload(&data).await?);
        break;
    }

    let upload = upload.ok_or_else(|| bad_request("No image provided".to_string()))?;
    scan_upload(&state.pipeline, upload).await
}

/// Write an upload to a temp file that is removed when dropped
async fn store_upload(data: &[u8]) -> Result<NamedTempFile, ApiError> {
    let file = tempfile::Builder::new()
        .prefix("scan-")
        .suffix(".upload")
        .tempfile()
        .map_err(|e| {
            error!("Failed to create temp file: {}", e);
            internal_error()
        })?;
    tokio::fs::write(file.path(), data).await.map_err(|e| {
        error!("Failed to write upload: {}", e);
        internal_error()
    })?;
    Ok(file)
}

/// Scan a stored upload; the file is gone once this returns, on every path
async fn scan_upload(
    pipeline: &ScanPipeline,
    upload: NamedTempFile,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = pipeline
        .scan_file(upload.path().to_path_buf())
        .await
        .map_err(|e| {
            if e.is_bad_input() {
                warn!("Rejected upload: {}", e);
                bad_request(e.to_string())
            } else {
                error!("Scan failed: {:?}", e);
                internal_error()
            }
        });
    drop(upload);

    match outcome? {
        ScanOutcome::Found(report) => Ok(Json(json!({
            "success": true,
            "data": report.record,
            "diagnostics": {
                "bbox": report.bbox,
                "confidence": report.confidence,
                "polarity": report.polarity,
                "raw_text": report.raw_text,
                "candidate_index": report.candidate_index,
                "regions_detected": report.regions_detected,
                "elapsed_ms": report.elapsed_ms,
            },
        }))),
        other => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": other.label(), "message": other.message() })),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::{ImageFormat, Rgb, RgbImage};
    use nutrition_scanner::core::errors::{DetectionResult, ExtractionResult, RecognitionResult};
    use nutrition_scanner::core::types::{PreparedCrop, Region};
    use nutrition_scanner::services::{
        CompletionBackend, NutrientExtractor, RegionDetector, TextRecognizer,
    };
    use std::io::Cursor;

    struct StubDetector(Vec<Region>);

    impl RegionDetector for StubDetector {
        fn detect(&self, _: &RgbImage) -> DetectionResult<Vec<Region>> {
            Ok(self.0.clone())
        }
    }

    struct StubRecognizer;

    impl TextRecognizer for StubRecognizer {
        fn recognize(&self, _: &PreparedCrop) -> RecognitionResult<String> {
            Ok("Sodium 500mg".to_string())
        }
    }

    struct StubBackend;

    #[async_trait]
    impl CompletionBackend for StubBackend {
        async fn complete(&self, _: &str, _: &str) -> ExtractionResult<String> {
            Ok(r#"{"sodium_100g": 0.5}"#.to_string())
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn pipeline(regions: Vec<Region>) -> ScanPipeline {
        ScanPipeline::builder(
            Arc::new(StubDetector(regions)),
            Arc::new(StubRecognizer),
            Arc::new(NutrientExtractor::new(Arc::new(StubBackend), None)),
        )
        .build()
    }

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(80, 60, Rgb([240, 240, 240]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[tokio::test]
    async fn test_upload_removed_after_found() {
        let pipeline = pipeline(vec![Region::new([5.0, 5.0, 70.0, 50.0], 0.9)]);
        let upload = store_upload(&png_bytes()).await.unwrap();
        let path = upload.path().to_path_buf();
        assert!(path.exists());

        let Json(body) = scan_upload(&pipeline, upload).await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["sodium_100g"], 0.5);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_upload_removed_after_not_found() {
        let pipeline = pipeline(Vec::new());
        let upload = store_upload(&png_bytes()).await.unwrap();
        let path = upload.path().to_path_buf();

        let (status, Json(body)) = scan_upload(&pipeline, upload).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no_regions_found");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_upload_removed_after_bad_image() {
        let pipeline = pipeline(Vec::new());
        let upload = store_upload(b"not an image").await.unwrap();
        let path = upload.path().to_path_buf();

        let (status, Json(body)) = scan_upload(&pipeline, upload).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_image");
        assert!(!path.exists());
    }
}

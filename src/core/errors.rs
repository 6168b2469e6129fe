// Error types for each pipeline stage
//
// Per-candidate errors (decode, geometry, binarization, recognition,
// extraction) are caught by the pipeline and logged; only startup errors are
// fatal.

use thiserror::Error;

/// Region detection errors
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image is empty ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Unexpected detector output shape: {0:?}")]
    UnexpectedOutput(Vec<i64>),

    #[error("ONNX session pool unavailable: {0}")]
    SessionUnavailable(String),
}

/// Perspective rectification errors
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("Region degenerates to a line or point ({width}x{height})")]
    Degenerate { width: u32, height: u32 },

    #[error("Region lies outside the image ({image_width}x{image_height})")]
    OutOfBounds { image_width: u32, image_height: u32 },

    #[error("No projective transform maps the region onto the output canvas")]
    SingularTransform,
}

/// Binarization errors
#[derive(Debug, Error)]
pub enum BinarizationError {
    #[error("Crop is empty or invalid ({width}x{height})")]
    InvalidCrop { width: u32, height: u32 },
}

/// Text recognition errors
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("Recognition model unavailable at {path}")]
    ModelUnavailable { path: String },

    #[error("Recognition engine failed: {0}")]
    EngineFailed(String),

    #[error("Failed to encode crop for the recognizer: {0}")]
    Encode(#[from] image::ImageError),
}

/// Nutrient extraction errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Text-understanding request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Text-understanding service returned {status}: {body}")]
    ServiceStatus { status: u16, body: String },

    #[error("Text-understanding call timed out after {0}s")]
    Timeout(u64),

    #[error("Circuit breaker is open, text-understanding service unavailable")]
    CircuitOpen,

    #[error("No API key configured for the text-understanding service")]
    MissingApiKey,

    #[error("Response carried no message content")]
    EmptyResponse,

    #[error("Response is not valid nutrient JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Grade prediction errors
#[derive(Debug, Error)]
pub enum GradingError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Classifier produced no usable output")]
    NoOutput,

    #[error("Class index {index} is outside the label encoder ({classes} classes)")]
    UnknownClass { index: i64, classes: usize },

    #[error("Label {0:?} is not a grade A-E")]
    InvalidLabel(String),

    #[error("Failed to read label encoder: {0}")]
    EncoderIo(#[from] std::io::Error),

    #[error("Failed to parse label encoder: {0}")]
    EncoderFormat(#[from] serde_json::Error),
}

/// Startup errors for artifacts that must be present
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Model artifact '{artifact}' unavailable at {path}: {reason}")]
    ModelUnavailable {
        artifact: &'static str,
        path: String,
        reason: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Why one candidate region produced no text (logged, never propagated)
#[derive(Debug, Error)]
pub enum CandidateError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Binarization(#[from] BinarizationError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),
}

/// Per-request pipeline errors (surface as "internal error")
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error("Failed to read uploaded image: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid binarization config: {0}")]
    InvalidBinarizationConfig(String),

    #[error("Invalid extraction config: {0}")]
    InvalidExtractionConfig(String),

    #[error("Pool size must be > 0, got {0}")]
    InvalidPoolSize(usize),

    #[error("Unknown value {value:?} for {key}")]
    UnknownVariant { key: &'static str, value: String },
}

pub type DetectionResult<T> = Result<T, DetectionError>;
pub type GeometryResult<T> = Result<T, GeometryError>;
pub type RecognitionResult<T> = Result<T, RecognitionError>;
pub type ExtractionResult<T> = Result<T, ExtractionError>;
pub type GradingResult<T> = Result<T, GradingError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

impl PipelineError {
    /// Whether the caller sent something that is not a usable image
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            Self::Detection(DetectionError::Decode(_) | DetectionError::EmptyImage { .. })
        )
    }
}

impl ExtractionError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::ServiceStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

// Library exports for the nutrition label scanning pipeline

// Core modules
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{
        ConfigError, DetectionError, ExtractionError, GradingError, PipelineError, StartupError,
    },
    types::{Grade, NutrientRecord, PreparedCrop, Region, TextPolarity, NUTRIENT_FIELDS},
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use orchestration::pipeline::{ScanOutcome, ScanPipeline, ScanReport};

pub use services::{
    Binarizer, CompletionBackend, GradePredictor, NutrientExtractor, OpenAiChatClient,
    RegionDetector, TextRecognizer,
};

pub use utils::{decode_rgb, Metrics};

pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    BinarizationError, CandidateError, ConfigError, DetectionError, ExtractionError, GeometryError,
    GradingError, PipelineError, RecognitionError, StartupError,
};
pub use types::{Grade, NutrientRecord, PreparedCrop, Region, TextPolarity, NUTRIENT_FIELDS};

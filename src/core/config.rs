use crate::core::errors::ConfigError;
use std::env;
use std::str::FromStr;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Detection configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub target_size: u32,
    pub inference_backend: Option<String>,
    pub detector_model_path: String,
    /// Number of ONNX sessions for the detector (controls inference parallelism)
    pub onnx_pool_size: usize,
}

/// Text recognition configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Directory holding `<language>.traineddata`
    pub tessdata_dir: String,
    pub language: String,
    pub user_words_file: String,
    pub user_patterns_file: String,
    /// Tesseract page segmentation mode (6 = single uniform block)
    pub page_seg_mode: u32,
}

/// Binarization strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarizationStrategy {
    /// Fixed contrast/glare/CLAHE/denoise/threshold chain
    Fixed,
    /// Polarity-branching top-hat/black-hat chain
    Morphological,
}

impl FromStr for BinarizationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" | "fixed_chain" => Ok(Self::Fixed),
            "morphological" | "morph" => Ok(Self::Morphological),
            other => Err(ConfigError::UnknownVariant {
                key: "BINARIZATION_STRATEGY",
                value: other.to_string(),
            }),
        }
    }
}

/// Final thresholding method of the fixed chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMethod {
    Otsu,
    Adaptive,
}

impl FromStr for ThresholdMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "otsu" => Ok(Self::Otsu),
            "adaptive" | "gaussian" => Ok(Self::Adaptive),
            other => Err(ConfigError::UnknownVariant {
                key: "THRESHOLD_METHOD",
                value: other.to_string(),
            }),
        }
    }
}

/// Binarization configuration
#[derive(Debug, Clone)]
pub struct BinarizationConfig {
    pub strategy: BinarizationStrategy,
    pub threshold_method: ThresholdMethod,
    /// Number of color clusters for polarity detection
    pub cluster_count: usize,
    /// Side of the square canvas the center crop is resampled to
    pub polarity_sample_size: u32,
}

/// Text-understanding (LLM) configuration
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub cache_capacity: usize,
}

/// Grade classifier configuration
#[derive(Debug, Clone)]
pub struct GradingConfig {
    pub classifier_model_path: String,
    pub label_encoder_path: String,
}

/// Upload boundary configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_upload_bytes: usize,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
    pub binarization: BinarizationConfig,
    pub extraction: ExtractionConfig,
    pub grading: GradingConfig,
    pub upload: UploadConfig,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn load_with<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Parse log level
        let log_level = get("LOG_LEVEL")
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let strategy = match get("BINARIZATION_STRATEGY") {
            Some(s) => s.parse()?,
            None => BinarizationStrategy::Fixed,
        };
        let threshold_method = match get("THRESHOLD_METHOD") {
            Some(s) => s.parse()?,
            None => ThresholdMethod::Otsu,
        };

        // Injected secret, never compiled in
        let api_key = get("LLM_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        Ok(Self {
            server: ServerConfig {
                port: get("SERVER_PORT")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8000),
                host: get("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                log_level,
            },
            detection: DetectionConfig {
                confidence_threshold: get("CONFIDENCE_THRESHOLD")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.25),
                iou_threshold: get("IOU_THRESHOLD")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.7),
                target_size: get("TARGET_SIZE")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(640),
                inference_backend: get("INFERENCE_BACKEND")
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                detector_model_path: get("DETECTOR_MODEL_PATH")
                    .unwrap_or_else(|| "models/nutrition_panel.onnx".to_string()),
                onnx_pool_size: get("ONNX_POOL_SIZE")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| std::cmp::max(num_cpus::get() / 4, 2)),
            },
            recognition: RecognitionConfig {
                tessdata_dir: get("TESSDATA_DIR").unwrap_or_else(|| "tessdata".to_string()),
                language: get("OCR_LANGUAGE").unwrap_or_else(|| "nuttrition1000".to_string()),
                user_words_file: get("OCR_USER_WORDS")
                    .unwrap_or_else(|| "resources/user-words.txt".to_string()),
                user_patterns_file: get("OCR_USER_PATTERNS")
                    .unwrap_or_else(|| "resources/user-patterns.txt".to_string()),
                page_seg_mode: get("OCR_PSM")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(6),
            },
            binarization: BinarizationConfig {
                strategy,
                threshold_method,
                cluster_count: get("POLARITY_CLUSTERS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
                polarity_sample_size: get("POLARITY_SAMPLE_SIZE")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
            },
            extraction: ExtractionConfig {
                api_base: get("LLM_API_BASE")
                    .map(|s| s.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key,
                model: get("LLM_MODEL").unwrap_or_else(|| "gpt-4-turbo".to_string()),
                timeout_secs: get("LLM_TIMEOUT_SECS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
                max_retries: get("LLM_MAX_RETRIES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
                cache_capacity: get("EXTRACTION_CACHE_CAPACITY")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(256),
            },
            grading: GradingConfig {
                classifier_model_path: get("GRADE_MODEL_PATH")
                    .unwrap_or_else(|| "models/grade_classifier.onnx".to_string()),
                label_encoder_path: get("LABEL_ENCODER_PATH")
                    .unwrap_or_else(|| "models/label_encoder.json".to_string()),
            },
            upload: UploadConfig {
                max_upload_bytes: get("MAX_UPLOAD_BYTES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(20 * 1024 * 1024),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate detection thresholds
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.detection.confidence_threshold,
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigError::InvalidIoUThreshold(
                self.detection.iou_threshold,
            ));
        }

        // Validate target size
        if !(320..=2048).contains(&self.detection.target_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "target_size must be between 320 and 2048, got {}",
                self.detection.target_size
            )));
        }

        if self.detection.onnx_pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(self.detection.onnx_pool_size));
        }

        if self.binarization.cluster_count < 2 {
            return Err(ConfigError::InvalidBinarizationConfig(format!(
                "cluster_count must be at least 2, got {}",
                self.binarization.cluster_count
            )));
        }

        if !(16..=1024).contains(&self.binarization.polarity_sample_size) {
            return Err(ConfigError::InvalidBinarizationConfig(format!(
                "polarity_sample_size must be between 16 and 1024, got {}",
                self.binarization.polarity_sample_size
            )));
        }

        if self.extraction.timeout_secs == 0 {
            return Err(ConfigError::InvalidExtractionConfig(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self.extraction.cache_capacity == 0 {
            return Err(ConfigError::InvalidExtractionConfig(
                "cache_capacity must be > 0".to_string(),
            ));
        }

        if self.extraction.max_retries > 10 {
            return Err(ConfigError::InvalidExtractionConfig(format!(
                "max_retries must be at most 10, got {}",
                self.extraction.max_retries
            )));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.detection.confidence_threshold
    }

    pub fn iou_threshold(&self) -> f32 {
        self.detection.iou_threshold
    }

    pub fn target_size(&self) -> u32 {
        self.detection.target_size
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.detection.onnx_pool_size
    }

    pub fn has_api_key(&self) -> bool {
        !self.extraction.api_key.is_empty()
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.upload.max_upload_bytes
    }
}

// Note: No Default implementation because Config::new() can fail

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::load_with(|key| vars.get(key).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.server_port(), 8000);
        assert_eq!(config.confidence_threshold(), 0.25);
        assert_eq!(config.target_size(), 640);
        assert_eq!(config.recognition.language, "nuttrition1000");
        assert_eq!(config.recognition.page_seg_mode, 6);
        assert_eq!(config.binarization.strategy, BinarizationStrategy::Fixed);
        assert_eq!(config.binarization.threshold_method, ThresholdMethod::Otsu);
        assert_eq!(config.binarization.cluster_count, 3);
        assert_eq!(config.extraction.model, "gpt-4-turbo");
        assert!(!config.has_api_key());
    }

    #[test]
    fn test_api_key_fallback() {
        let config = load(&[("OPENAI_API_KEY", " sk-test ")]).unwrap();
        assert_eq!(config.extraction.api_key, "sk-test");

        let config = load(&[("OPENAI_API_KEY", "old"), ("LLM_API_KEY", "new")]).unwrap();
        assert_eq!(config.extraction.api_key, "new");
    }

    #[test]
    fn test_strategy_selection() {
        let config = load(&[
            ("BINARIZATION_STRATEGY", "Morphological"),
            ("THRESHOLD_METHOD", "adaptive"),
        ])
        .unwrap();
        assert_eq!(
            config.binarization.strategy,
            BinarizationStrategy::Morphological
        );
        assert_eq!(config.binarization.threshold_method, ThresholdMethod::Adaptive);

        assert!(matches!(
            load(&[("BINARIZATION_STRATEGY", "sauvola")]),
            Err(ConfigError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        assert!(matches!(
            load(&[("CONFIDENCE_THRESHOLD", "1.5")]),
            Err(ConfigError::InvalidConfidenceThreshold(_))
        ));
        assert!(matches!(
            load(&[("IOU_THRESHOLD", "-0.1")]),
            Err(ConfigError::InvalidIoUThreshold(_))
        ));
        assert!(matches!(
            load(&[("ONNX_POOL_SIZE", "0")]),
            Err(ConfigError::InvalidPoolSize(0))
        ));
        assert!(matches!(
            load(&[("POLARITY_CLUSTERS", "1")]),
            Err(ConfigError::InvalidBinarizationConfig(_))
        ));
        assert!(matches!(
            load(&[("LLM_TIMEOUT_SECS", "0")]),
            Err(ConfigError::InvalidExtractionConfig(_))
        ));
    }

    #[test]
    fn test_api_base_trailing_slash() {
        let config = load(&[("LLM_API_BASE", "http://localhost:8080/v1/")]).unwrap();
        assert_eq!(config.extraction.api_base, "http://localhost:8080/v1");
    }
}

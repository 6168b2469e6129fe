pub mod binarization;
pub mod detection;
pub mod extraction;
pub mod grading;
pub mod ocr;
pub mod onnx_builder; // Shared ONNX session builder for detector and grade classifier
pub mod rectification;

// Re-export commonly used services
pub use binarization::{build_binarizer, Binarizer, FixedChainBinarizer, MorphologicalBinarizer};
pub use detection::{RegionDetector, YoloRegionDetector};
pub use extraction::{CompletionBackend, ExtractionCache, NutrientExtractor, OpenAiChatClient};
pub use grading::{GradeClassifier, GradePredictor, LabelEncoder, OnnxGradeClassifier};
pub use ocr::{build_recognizer, TextRecognizer};

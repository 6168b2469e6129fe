// Scan pipeline: detect -> (per candidate) rectify -> binarize -> recognize
// -> extract -> grade
//
// Candidates are tried in detector order and the first one that yields a
// record wins. Per-candidate failures are logged and skipped; only internal
// faults surface as `PipelineError`.

use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{CandidateError, PipelineError, PipelineResult, StartupError};
use crate::core::types::{NutrientRecord, Region, TextPolarity};
use crate::services::binarization::{
    build_binarizer, Binarizer, FixedChainBinarizer, FixedChainParams, PolarityConfig,
};
use crate::services::detection::{RegionDetector, YoloRegionDetector};
use crate::services::extraction::NutrientExtractor;
use crate::services::grading::GradePredictor;
use crate::services::ocr::{build_recognizer, TextRecognizer};
use crate::services::rectification::rectify;
use crate::utils::{decode_rgb_async, open_rgb_async, Metrics, Stage};

/// A successful scan with diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub record: NutrientRecord,
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub polarity: TextPolarity,
    pub raw_text: String,
    pub candidate_index: usize,
    pub regions_detected: usize,
    pub elapsed_ms: u64,
}

/// Result of one scan
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    Found(ScanReport),
    NoRegions,
    NoText,
    ExtractionFailed,
}

impl ScanOutcome {
    /// Stable label, shared by metrics and API error codes
    pub fn label(&self) -> &'static str {
        match self {
            Self::Found(_) => "found",
            Self::NoRegions => "no_regions_found",
            Self::NoText => "no_text_recognized",
            Self::ExtractionFailed => "extraction_failed",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Found(_) => "Nutrition facts extracted",
            Self::NoRegions => "No nutrition panel was found in the image",
            Self::NoText => "No text could be recognized on the nutrition panel",
            Self::ExtractionFailed => "Text was recognized but nutrition facts could not be extracted",
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// What the CPU stages produced for one candidate
struct PreparedText {
    polarity: TextPolarity,
    text: String,
    preparation: Duration,
    recognition: Duration,
}

/// Immutable context holding every stage; share it behind an `Arc`
pub struct ScanPipeline {
    detector: Arc<dyn RegionDetector>,
    binarizer: Arc<dyn Binarizer>,
    recognizer: Arc<dyn TextRecognizer>,
    extractor: Arc<NutrientExtractor>,
    grader: Arc<GradePredictor>,
    metrics: Metrics,
}

impl ScanPipeline {
    /// Build every stage from configuration
    ///
    /// Fails when the detector or recognizer artifacts are missing; a missing
    /// grade model only disables grade prediction.
    pub fn from_config(config: &Config, metrics: Metrics) -> Result<Self, StartupError> {
        info!("Initializing scan pipeline...");

        let detector = YoloRegionDetector::new(&config.detection)?;
        let recognizer = build_recognizer(&config.recognition)?;
        let binarizer = build_binarizer(&config.binarization);
        let extractor = NutrientExtractor::from_config(&config.extraction, metrics.clone())?;
        let grader = GradePredictor::load(&config.grading);

        info!(
            "✓ Ready (detector: {}, binarizer: {}, extractor: {}, grades: {})",
            detector.device_type(),
            binarizer.name(),
            extractor.backend_name(),
            if grader.is_available() { "predicted" } else { "extracted only" }
        );

        Ok(Self {
            detector: Arc::new(detector),
            binarizer,
            recognizer,
            extractor: Arc::new(extractor),
            grader: Arc::new(grader),
            metrics,
        })
    }

    /// Assemble a pipeline from injected stages
    pub fn builder(
        detector: Arc<dyn RegionDetector>,
        recognizer: Arc<dyn TextRecognizer>,
        extractor: Arc<NutrientExtractor>,
    ) -> ScanPipelineBuilder {
        ScanPipelineBuilder {
            detector,
            recognizer,
            extractor,
            binarizer: None,
            grader: None,
            metrics: None,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn detector_backend(&self) -> &str {
        self.detector.backend()
    }

    pub fn binarizer_name(&self) -> &'static str {
        self.binarizer.name()
    }

    pub fn grading_available(&self) -> bool {
        self.grader.is_available()
    }

    /// Scan encoded image bytes
    pub async fn scan_bytes(&self, bytes: Vec<u8>) -> PipelineResult<ScanOutcome> {
        let image = decode_rgb_async(bytes).await?;
        self.scan_image(Arc::new(image)).await
    }

    /// Scan an image file (format sniffed from content)
    pub async fn scan_file(&self, path: PathBuf) -> PipelineResult<ScanOutcome> {
        let image = open_rgb_async(path).await?;
        self.scan_image(Arc::new(image)).await
    }

    /// Scan a decoded image
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn scan_image(&self, image: Arc<RgbImage>) -> PipelineResult<ScanOutcome> {
        let start = Instant::now();
        let outcome = self.run(image, start).await;

        match &outcome {
            Ok(outcome) => {
                self.metrics.record_scan(outcome.label());
                info!(
                    "Scan finished: {} in {:.2}ms",
                    outcome.label(),
                    start.elapsed().as_secs_f64() * 1000.0
                );
            }
            Err(e) => {
                self.metrics.record_scan("internal_error");
                warn!("Scan failed: {}", e);
            }
        }
        outcome
    }

    async fn run(&self, image: Arc<RgbImage>, start: Instant) -> PipelineResult<ScanOutcome> {
        let detection_start = Instant::now();
        let regions = {
            let detector = Arc::clone(&self.detector);
            let image = Arc::clone(&image);
            tokio::task::spawn_blocking(move || detector.detect(&image))
                .await
                .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))??
        };
        self.metrics.record_stage(Stage::Detection, detection_start.elapsed());
        self.metrics.record_regions(regions.len());

        if regions.is_empty() {
            return Ok(ScanOutcome::NoRegions);
        }
        debug!("{} candidate regions", regions.len());

        let mut saw_text = false;

        for (index, region) in regions.iter().enumerate() {
            self.metrics.record_candidate();

            let prepared = match self.prepare_text(Arc::clone(&image), *region).await? {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!("Candidate {} {:?} skipped: {}", index, region.bbox, e);
                    continue;
                }
            };
            self.metrics.record_stage(Stage::Preparation, prepared.preparation);
            self.metrics.record_stage(Stage::Recognition, prepared.recognition);

            if prepared.text.trim().is_empty() {
                debug!("Candidate {} produced no text", index);
                continue;
            }
            saw_text = true;

            let extraction_start = Instant::now();
            let extracted = self.extractor.extract(&prepared.text).await;
            self.metrics.record_stage(Stage::Extraction, extraction_start.elapsed());

            let record = match extracted {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        "Candidate {} {:?} extraction failed: {}",
                        index, region.bbox, e
                    );
                    continue;
                }
            };

            let record = self.grade(record).await?;

            return Ok(ScanOutcome::Found(ScanReport {
                record,
                bbox: region.bbox,
                confidence: region.confidence,
                polarity: prepared.polarity,
                raw_text: prepared.text,
                candidate_index: index,
                regions_detected: regions.len(),
                elapsed_ms: start.elapsed().as_millis() as u64,
            }));
        }

        Ok(if saw_text {
            ScanOutcome::ExtractionFailed
        } else {
            ScanOutcome::NoText
        })
    }

    /// Rectify, binarize and recognize one candidate on the blocking pool
    async fn prepare_text(
        &self,
        image: Arc<RgbImage>,
        region: Region,
    ) -> PipelineResult<Result<PreparedText, CandidateError>> {
        let binarizer = Arc::clone(&self.binarizer);
        let recognizer = Arc::clone(&self.recognizer);

        tokio::task::spawn_blocking(move || -> Result<PreparedText, CandidateError> {
            let preparation_start = Instant::now();
            let rectified = rectify(&image, &region)?;
            let crop = binarizer.binarize(&rectified)?;
            let preparation = preparation_start.elapsed();

            let recognition_start = Instant::now();
            let text = recognizer.recognize(&crop)?;

            Ok(PreparedText {
                polarity: crop.polarity,
                text,
                preparation,
                recognition: recognition_start.elapsed(),
            })
        })
        .await
        .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))
    }

    async fn grade(&self, mut record: NutrientRecord) -> PipelineResult<NutrientRecord> {
        let grader = Arc::clone(&self.grader);
        let grading_start = Instant::now();

        let (record, predicted) = tokio::task::spawn_blocking(move || {
            let predicted = grader.apply(&mut record);
            (record, predicted)
        })
        .await
        .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?;

        self.metrics.record_stage(Stage::Grading, grading_start.elapsed());
        if predicted {
            self.metrics.record_grade_predicted();
        }
        Ok(record)
    }
}

/// Builder for `ScanPipeline` with injected stages
pub struct ScanPipelineBuilder {
    detector: Arc<dyn RegionDetector>,
    recognizer: Arc<dyn TextRecognizer>,
    extractor: Arc<NutrientExtractor>,
    binarizer: Option<Arc<dyn Binarizer>>,
    grader: Option<Arc<GradePredictor>>,
    metrics: Option<Metrics>,
}

impl ScanPipelineBuilder {
    pub fn binarizer(mut self, binarizer: Arc<dyn Binarizer>) -> Self {
        self.binarizer = Some(binarizer);
        self
    }

    pub fn grader(mut self, grader: Arc<GradePredictor>) -> Self {
        self.grader = Some(grader);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Defaults: Otsu fixed chain, no grade prediction, fresh metrics
    pub fn build(self) -> ScanPipeline {
        ScanPipeline {
            detector: self.detector,
            binarizer: self.binarizer.unwrap_or_else(|| {
                Arc::new(FixedChainBinarizer::new(
                    FixedChainParams::otsu(),
                    PolarityConfig::default(),
                ))
            }),
            recognizer: self.recognizer,
            extractor: self.extractor,
            grader: self
                .grader
                .unwrap_or_else(|| Arc::new(GradePredictor::unavailable())),
            metrics: self.metrics.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{
        DetectionError, DetectionResult, ExtractionError, ExtractionResult, GradingResult,
        RecognitionError, RecognitionResult,
    };
    use crate::core::types::{Grade, PreparedCrop};
    use crate::services::extraction::CompletionBackend;
    use crate::services::grading::{GradeClassifier, LabelEncoder};
    use async_trait::async_trait;
    use image::Rgb;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDetector(Vec<Region>);

    impl RegionDetector for StubDetector {
        fn detect(&self, _: &RgbImage) -> DetectionResult<Vec<Region>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    impl RegionDetector for BrokenDetector {
        fn detect(&self, _: &RgbImage) -> DetectionResult<Vec<Region>> {
            Err(DetectionError::SessionUnavailable("pool closed".into()))
        }
    }

    /// Scripted entry that makes the engine fail for that call
    const ENGINE_FAILURE: &str = "<engine failure>";

    /// Returns the scripted texts in call order, then empty strings
    struct ScriptedRecognizer {
        texts: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn new(texts: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                texts: texts.to_vec(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl TextRecognizer for ScriptedRecognizer {
        fn recognize(&self, crop: &PreparedCrop) -> RecognitionResult<String> {
            assert!(crop.image.width() > 0 && crop.image.height() > 0);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.texts.get(n).copied().unwrap_or_default() {
                ENGINE_FAILURE => Err(RecognitionError::EngineFailed("corrupt input".into())),
                text => Ok(text.to_string()),
            }
        }
    }

    /// Answers label text mentioning sodium; anything else is not JSON
    struct LabelBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for LabelBackend {
        async fn complete(&self, _: &str, prompt: &str) -> ExtractionResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.contains("Sodium") {
                Ok("```json\n{\"sodium_100g\": \"500mg\", \"sugars_100g\": 22, \"nutri_score\": \"a\"}\n```".into())
            } else if prompt.contains("offline") {
                Err(ExtractionError::Timeout(30))
            } else {
                Ok("I could not find nutrition facts.".into())
            }
        }

        fn name(&self) -> &str {
            "label-stub"
        }
    }

    struct SugarClassifier;

    impl GradeClassifier for SugarClassifier {
        fn classify(&self, features: &[f32; 9]) -> GradingResult<i64> {
            Ok(if features[7] > 20.0 { 3 } else { 0 })
        }
    }

    fn panel_image() -> Arc<RgbImage> {
        let mut image = RgbImage::from_pixel(240, 200, Rgb([250, 250, 250]));
        for row in 0..6 {
            draw_filled_rect_mut(
                &mut image,
                Rect::at(30, 30 + row * 22).of_size(150, 8),
                Rgb([20, 20, 20]),
            );
        }
        Arc::new(image)
    }

    fn regions(n: usize) -> Vec<Region> {
        (0..n)
            .map(|i| {
                let offset = i as f32 * 10.0;
                Region::new([20.0 + offset, 20.0, 200.0 + offset, 170.0], 0.9 - i as f32 * 0.1)
            })
            .collect()
    }

    struct Fixture {
        pipeline: ScanPipeline,
        recognizer: Arc<ScriptedRecognizer>,
        backend: Arc<LabelBackend>,
    }

    fn fixture(detected: Vec<Region>, texts: &[&'static str], grader: Option<GradePredictor>) -> Fixture {
        let recognizer = ScriptedRecognizer::new(texts);
        let backend = Arc::new(LabelBackend {
            calls: AtomicUsize::new(0),
        });
        let extractor = Arc::new(NutrientExtractor::new(backend.clone(), None));

        let mut builder = ScanPipeline::builder(
            Arc::new(StubDetector(detected)),
            recognizer.clone(),
            extractor,
        );
        if let Some(grader) = grader {
            builder = builder.grader(Arc::new(grader));
        }

        Fixture {
            pipeline: builder.build(),
            recognizer,
            backend,
        }
    }

    fn found(outcome: ScanOutcome) -> ScanReport {
        match outcome {
            ScanOutcome::Found(report) => report,
            other => panic!("expected a record, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn test_no_regions() {
        let f = fixture(Vec::new(), &["Sodium 500mg"], None);
        let outcome = f.pipeline.scan_image(panel_image()).await.unwrap();

        assert!(matches!(outcome, ScanOutcome::NoRegions));
        assert_eq!(f.recognizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_text_never_calls_extractor() {
        let f = fixture(regions(1), &["  \n "], None);
        let outcome = f.pipeline.scan_image(panel_image()).await.unwrap();

        assert!(matches!(outcome, ScanOutcome::NoText));
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_found_record() {
        let f = fixture(regions(1), &["Sodium 500mg\nSugars 22g"], None);
        let report = found(f.pipeline.scan_image(panel_image()).await.unwrap());

        assert!((report.record.sodium_100g - 0.5).abs() < 0.01);
        assert_eq!(report.record.sugars_100g, 22.0);
        assert_eq!(report.candidate_index, 0);
        assert_eq!(report.regions_detected, 1);
        assert_eq!(report.bbox, regions(1)[0].bbox);
        assert_eq!(report.raw_text, "Sodium 500mg\nSugars 22g");
        // Extracted grade kept when no classifier is loaded
        assert_eq!(report.record.nutri_score, Some(Grade::A));
        assert!(!report.record.nutri_score_predicted);
    }

    #[tokio::test]
    async fn test_predicted_grade_overrides_extracted() {
        let grader = GradePredictor::new(
            Arc::new(SugarClassifier),
            LabelEncoder::new(["A", "B", "C", "D", "E"].map(String::from).to_vec()),
        );
        let f = fixture(regions(1), &["Sodium 500mg"], Some(grader));
        let report = found(f.pipeline.scan_image(panel_image()).await.unwrap());

        assert_eq!(report.record.nutri_score, Some(Grade::D));
        assert!(report.record.nutri_score_predicted);
        assert_eq!(f.pipeline.metrics().snapshot().grades_predicted, 1);
    }

    #[tokio::test]
    async fn test_first_candidate_wins() {
        let f = fixture(regions(3), &["Sodium 140mg", "Sodium 900mg", "Sodium 10mg"], None);
        let report = found(f.pipeline.scan_image(panel_image()).await.unwrap());

        assert_eq!(report.candidate_index, 0);
        // Later candidates are never evaluated
        assert_eq!(f.recognizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_through_to_later_candidate() {
        let f = fixture(regions(3), &["", "Net Wt 12oz", "Sodium 500mg"], None);
        let report = found(f.pipeline.scan_image(panel_image()).await.unwrap());

        assert_eq!(report.candidate_index, 2);
        assert_eq!(report.bbox, regions(3)[2].bbox);
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recognizer_failure_skips_candidate() {
        let f = fixture(regions(2), &[ENGINE_FAILURE, "Sodium 500mg"], None);
        let report = found(f.pipeline.scan_image(panel_image()).await.unwrap());

        assert_eq!(report.candidate_index, 1);
        assert_eq!(f.recognizer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recognizer_failure_counts_as_no_text() {
        let f = fixture(regions(2), &[ENGINE_FAILURE, ENGINE_FAILURE], None);
        let outcome = f.pipeline.scan_image(panel_image()).await.unwrap();

        assert!(matches!(outcome, ScanOutcome::NoText));
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extraction_failed() {
        let f = fixture(regions(2), &["Net Wt 12oz", "service offline"], None);
        let outcome = f.pipeline.scan_image(panel_image()).await.unwrap();

        assert!(matches!(outcome, ScanOutcome::ExtractionFailed));
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_out_of_bounds_candidate_is_skipped() {
        let mut detected = vec![Region::new([500.0, 500.0, 600.0, 600.0], 0.95)];
        detected.extend(regions(1));
        let f = fixture(detected, &["Sodium 500mg"], None);
        let report = found(f.pipeline.scan_image(panel_image()).await.unwrap());

        assert_eq!(report.candidate_index, 1);
        assert_eq!(f.recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scan_is_idempotent() {
        let backend = Arc::new(LabelBackend {
            calls: AtomicUsize::new(0),
        });

        struct Fixed;
        impl TextRecognizer for Fixed {
            fn recognize(&self, _: &PreparedCrop) -> RecognitionResult<String> {
                Ok("Sodium 500mg".into())
            }
        }

        let pipeline = ScanPipeline::builder(
            Arc::new(StubDetector(regions(1))),
            Arc::new(Fixed),
            Arc::new(NutrientExtractor::new(backend, None)),
        )
        .build();

        let first = found(pipeline.scan_image(panel_image()).await.unwrap());
        let second = found(pipeline.scan_image(panel_image()).await.unwrap());
        assert_eq!(first.record, second.record);
        assert_eq!(first.polarity, second.polarity);
    }

    #[tokio::test]
    async fn test_detector_failure_is_internal() {
        let pipeline = ScanPipeline::builder(
            Arc::new(BrokenDetector),
            ScriptedRecognizer::new(&[]),
            Arc::new(NutrientExtractor::new(
                Arc::new(LabelBackend {
                    calls: AtomicUsize::new(0),
                }),
                None,
            )),
        )
        .build();

        let err = pipeline.scan_image(panel_image()).await.unwrap_err();
        assert!(!err.is_bad_input());
        assert_eq!(pipeline.metrics().snapshot().scans.get("internal_error"), Some(&1));
    }

    #[tokio::test]
    async fn test_undecodable_bytes_are_bad_input() {
        let f = fixture(regions(1), &["Sodium 500mg"], None);
        let err = f.pipeline.scan_bytes(b"not an image".to_vec()).await.unwrap_err();
        assert!(err.is_bad_input());
    }

    #[tokio::test]
    async fn test_outcomes_are_counted() {
        let f = fixture(regions(1), &["Sodium 500mg"], None);
        f.pipeline.scan_image(panel_image()).await.unwrap();
        let snapshot = f.pipeline.metrics().snapshot();

        assert_eq!(snapshot.scans.get("found"), Some(&1));
        assert_eq!(snapshot.regions_detected, 1);
        assert_eq!(snapshot.candidates_evaluated, 1);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(ScanOutcome::NoText).unwrap();
        assert_eq!(json["outcome"], "no_text");
        assert_eq!(ScanOutcome::NoText.label(), "no_text_recognized");
    }
}

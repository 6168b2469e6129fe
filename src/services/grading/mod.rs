// Grade prediction from the nine per-100g nutrient values
//
// A pre-trained classifier (ONNX export) maps the canonical feature vector to
// a class index; a label encoder maps the index to a grade letter. Both
// artifacts are optional at startup: without them no grade is predicted.

use ndarray::Array2;
use ort::value::Value;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::GradingConfig;
use crate::core::errors::{GradingError, GradingResult};
use crate::core::types::{Grade, NutrientRecord};
use crate::services::onnx_builder::{build_session_pool, OnnxSessionPool};

/// Maps a canonical nutrient vector to a class index
pub trait GradeClassifier: Send + Sync {
    fn classify(&self, features: &[f32; 9]) -> GradingResult<i64>;
}

/// ONNX-exported classifier
///
/// Reads an int64 label output when the model has one, otherwise the argmax
/// of a float probability output.
pub struct OnnxGradeClassifier {
    session_pool: OnnxSessionPool,
    input_name: String,
    output_names: Vec<String>,
}

impl OnnxGradeClassifier {
    pub fn new(model_path: &Path) -> anyhow::Result<Self> {
        let (_, session_pool) = build_session_pool(model_path, "grade classifier", None, 1)?;

        let (input_name, output_names) = {
            let session = session_pool.acquire()?;
            let input = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .ok_or_else(|| anyhow::anyhow!("grade classifier has no inputs"))?;
            let outputs = session.outputs.iter().map(|o| o.name.clone()).collect();
            (input, outputs)
        };
        debug!("Grade classifier input={} outputs={:?}", input_name, output_names);

        Ok(Self {
            session_pool,
            input_name,
            output_names,
        })
    }
}

fn argmax(values: &[f32]) -> Option<i64> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as i64)
}

impl GradeClassifier for OnnxGradeClassifier {
    fn classify(&self, features: &[f32; 9]) -> GradingResult<i64> {
        let array = Array2::from_shape_fn((1, 9), |(_, j)| features[j]);
        let input = Value::from_array(array)?;

        let mut session = self
            .session_pool
            .acquire()
            .map_err(|_| GradingError::NoOutput)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;

        for name in &self.output_names {
            let output = &outputs[name.as_str()];
            if let Ok((_, labels)) = output.try_extract_tensor::<i64>() {
                if let Some(&label) = labels.first() {
                    return Ok(label);
                }
            } else if let Ok((_, probabilities)) = output.try_extract_tensor::<f32>() {
                if let Some(index) = argmax(probabilities) {
                    return Ok(index);
                }
            }
        }
        Err(GradingError::NoOutput)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EncoderFile {
    Plain(Vec<String>),
    Wrapped { classes: Vec<String> },
}

/// Class index -> grade label table
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn new(classes: Vec<String>) -> Self {
        Self { classes }
    }

    /// Load from JSON: either `["A", "B", ...]` or `{"classes": [...]}`
    pub fn load(path: &Path) -> GradingResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let classes = match serde_json::from_str::<EncoderFile>(&data)? {
            EncoderFile::Plain(classes) | EncoderFile::Wrapped { classes } => classes,
        };
        if classes.is_empty() {
            return Err(GradingError::InvalidLabel(String::new()));
        }
        Ok(Self::new(classes))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn decode(&self, index: i64) -> GradingResult<Grade> {
        let label = usize::try_from(index)
            .ok()
            .and_then(|i| self.classes.get(i))
            .ok_or(GradingError::UnknownClass {
                index,
                classes: self.classes.len(),
            })?;
        label
            .parse::<Grade>()
            .map_err(|_| GradingError::InvalidLabel(label.clone()))
    }
}

/// Predicts a grade for a record, or nothing when the artifacts are missing
pub struct GradePredictor {
    classifier: Option<Arc<dyn GradeClassifier>>,
    encoder: Option<LabelEncoder>,
}

impl GradePredictor {
    pub fn new(classifier: Arc<dyn GradeClassifier>, encoder: LabelEncoder) -> Self {
        Self {
            classifier: Some(classifier),
            encoder: Some(encoder),
        }
    }

    /// A predictor that never predicts
    pub fn unavailable() -> Self {
        Self {
            classifier: None,
            encoder: None,
        }
    }

    /// Load both artifacts; failures are logged and leave the predictor
    /// unavailable
    pub fn load(config: &GradingConfig) -> Self {
        let classifier = match OnnxGradeClassifier::new(Path::new(&config.classifier_model_path)) {
            Ok(classifier) => Some(Arc::new(classifier) as Arc<dyn GradeClassifier>),
            Err(e) => {
                warn!("Grade classifier unavailable, grades will not be predicted: {:#}", e);
                None
            }
        };

        let encoder = match LabelEncoder::load(Path::new(&config.label_encoder_path)) {
            Ok(encoder) => Some(encoder),
            Err(e) => {
                warn!(
                    "Label encoder unavailable at {}, grades will not be predicted: {}",
                    config.label_encoder_path, e
                );
                None
            }
        };

        if classifier.is_some() && encoder.is_some() {
            info!("✓ Grade predictor loaded");
        }
        Self { classifier, encoder }
    }

    pub fn is_available(&self) -> bool {
        self.classifier.is_some() && self.encoder.is_some()
    }

    /// Predict a grade from the record's nine nutrient values
    pub fn predict(&self, record: &NutrientRecord) -> Option<Grade> {
        let (classifier, encoder) = match (&self.classifier, &self.encoder) {
            (Some(c), Some(e)) => (c, e),
            _ => return None,
        };

        let features = record.feature_vector();
        match classifier.classify(&features).and_then(|index| encoder.decode(index)) {
            Ok(grade) => {
                debug!("Predicted grade {} for {:?}", grade, features);
                Some(grade)
            }
            Err(e) => {
                warn!("Grade prediction failed: {}", e);
                None
            }
        }
    }

    /// Predict and apply in place; returns whether a grade was applied
    pub fn apply(&self, record: &mut NutrientRecord) -> bool {
        match self.predict(record) {
            Some(grade) => {
                record.apply_predicted_grade(grade);
                true
            }
            None => false,
        }
    }
}

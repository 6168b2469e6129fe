// Detection Service Module - Locates nutrition panels in product photos
//
// YOLO-style ONNX export: input [1, 3, S, S] RGB/255, output [1, 4+C, N]
// rows of (cx, cy, w, h, class scores...). Boxes are filtered by confidence,
// reduced with class-agnostic NMS and rescaled to source pixels.

use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::value::Value;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, trace};

use crate::core::config::DetectionConfig;
use crate::core::errors::{DetectionError, DetectionResult, StartupError};
use crate::core::types::Region;
use crate::services::onnx_builder::{build_session_pool, OnnxSessionPool};

const INPUT_NAME: &str = "images";
const OUTPUT_NAME: &str = "output0";

/// Finds candidate nutrition-panel regions in an image
pub trait RegionDetector: Send + Sync {
    /// Candidate regions in descending confidence order
    fn detect(&self, image: &RgbImage) -> DetectionResult<Vec<Region>>;

    /// Execution backend, for health reporting
    fn backend(&self) -> &str {
        "custom"
    }
}

pub struct YoloRegionDetector {
    session_pool: OnnxSessionPool,
    target_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
    device_type: String,
}

impl YoloRegionDetector {
    /// Load the detector model; failure is fatal for the service
    pub fn new(config: &DetectionConfig) -> Result<Self, StartupError> {
        let path = Path::new(&config.detector_model_path);
        let (device_type, session_pool) = build_session_pool(
            path,
            "detector",
            config.inference_backend.as_deref(),
            config.onnx_pool_size,
        )
        .map_err(|e| StartupError::ModelUnavailable {
            artifact: "detector",
            path: config.detector_model_path.clone(),
            reason: format!("{:#}", e),
        })?;

        Ok(Self {
            session_pool,
            target_size: config.target_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            device_type,
        })
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    fn preprocess_image(&self, img: &RgbImage) -> Array4<f32> {
        let target_size = self.target_size;
        trace!(
            "Preprocessing image: {}x{} → {}x{}",
            img.width(),
            img.height(),
            target_size,
            target_size
        );

        let resized = image::imageops::resize(img, target_size, target_size, FilterType::Triangle);

        let target = target_size as usize;
        let mut array = Array4::<f32>::zeros((1, 3, target, target));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }
        array
    }
}

impl RegionDetector for YoloRegionDetector {
    fn backend(&self) -> &str {
        &self.device_type
    }

    fn detect(&self, image: &RgbImage) -> DetectionResult<Vec<Region>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectionError::EmptyImage { width, height });
        }

        let detection_start = Instant::now();
        let input = Value::from_array(self.preprocess_image(image))?;

        let (shape, data) = {
            let mut session = self
                .session_pool
                .acquire()
                .map_err(|e| DetectionError::SessionUnavailable(format!("{:#}", e)))?;
            let outputs = session.run(ort::inputs![INPUT_NAME => input])?;
            let (shape, data) = outputs[OUTPUT_NAME].try_extract_tensor::<f32>()?;
            (shape.to_vec(), data.to_vec())
        };

        debug!(
            "Inference on {} completed in {:.2}ms",
            self.device_type,
            detection_start.elapsed().as_secs_f64() * 1000.0
        );

        let scale = (
            width as f32 / self.target_size as f32,
            height as f32 / self.target_size as f32,
        );
        let candidates = decode_predictions(
            &shape,
            &data,
            self.confidence_threshold,
            scale,
            (width, height),
        )?;
        let regions = nms(candidates, self.iou_threshold);

        debug!(
            "Detection completed in {:.2}ms: {} regions",
            detection_start.elapsed().as_secs_f64() * 1000.0,
            regions.len()
        );
        Ok(regions)
    }
}

/// Decode raw detector output into regions in source-image pixels
///
/// Accepts both `[1, 4+C, N]` and the transposed `[1, N, 4+C]` layout.
pub fn decode_predictions(
    shape: &[i64],
    data: &[f32],
    confidence_threshold: f32,
    scale: (f32, f32),
    image_size: (u32, u32),
) -> DetectionResult<Vec<Region>> {
    if shape.len() != 3 || shape[0] != 1 || shape.iter().any(|&d| d <= 0) {
        return Err(DetectionError::UnexpectedOutput(shape.to_vec()));
    }

    let (a, b) = (shape[1] as usize, shape[2] as usize);
    let transposed = a > b && b >= 5;
    let (features, count) = if transposed { (b, a) } else { (a, b) };
    if features < 5 || data.len() < features * count {
        return Err(DetectionError::UnexpectedOutput(shape.to_vec()));
    }

    let at = |f: usize, i: usize| {
        if transposed {
            data[i * features + f]
        } else {
            data[f * count + i]
        }
    };

    let (max_x, max_y) = (image_size.0 as f32, image_size.1 as f32);
    let mut regions = Vec::new();
    for i in 0..count {
        let score = (4..features).map(|f| at(f, i)).fold(f32::MIN, f32::max);
        if score < confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let bbox = [
            ((cx - w / 2.0) * scale.0).clamp(0.0, max_x),
            ((cy - h / 2.0) * scale.1).clamp(0.0, max_y),
            ((cx + w / 2.0) * scale.0).clamp(0.0, max_x),
            ((cy + h / 2.0) * scale.1).clamp(0.0, max_y),
        ];
        trace!("Detection {}: bbox={:?}, conf={:.3}", i, bbox, score);
        regions.push(Region::new(bbox, score));
    }

    debug!(
        "Filtered {} detections above confidence threshold {:.2}",
        regions.len(),
        confidence_threshold
    );
    Ok(regions)
}

fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Class-agnostic non-maximum suppression, highest confidence first
pub fn nms(detections: Vec<Region>, iou_threshold: f32) -> Vec<Region> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections;
    sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Region> = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if !suppressed[j] {
                let iou = calculate_iou(&sorted[i].bbox, &sorted[j].bbox);
                if iou > iou_threshold {
                    suppressed[j] = true;
                    trace!("NMS: Suppressed detection {} (IoU={:.3} with {})", j, iou, i);
                }
            }
        }
    }

    debug!("NMS: Kept {}/{} detections", keep.len(), sorted.len());
    keep
}

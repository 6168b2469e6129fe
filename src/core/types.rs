// Domain types shared across the scan pipeline

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::core::config::Config;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<crate::orchestration::pipeline::ScanPipeline>,
}

/// A 2D point in source-image pixel coordinates
pub type Point = [f32; 2];

/// Candidate nutrition-panel region produced by the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// [xmin, ymin, xmax, ymax]
    pub bbox: [f32; 4],
    pub confidence: f32,
}

impl Region {
    pub fn new(bbox: [f32; 4], confidence: f32) -> Self {
        Self { bbox, confidence }
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    /// Four corners of the box, unordered (clockwise from top-left)
    pub fn corners(&self) -> [Point; 4] {
        let [x1, y1, x2, y2] = self.bbox;
        [[x1, y1], [x2, y1], [x2, y2], [x1, y2]]
    }
}

/// Whether printed text is darker or lighter than its background
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextPolarity {
    DarkOnLight,
    LightOnDark,
    Ambiguous,
}

impl TextPolarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DarkOnLight => "dark_on_light",
            Self::LightOnDark => "light_on_dark",
            Self::Ambiguous => "ambiguous",
        }
    }
}

impl fmt::Display for TextPolarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binarized crop ready for text recognition
///
/// The image holds a single binary channel replicated into R, G and B.
#[derive(Debug, Clone)]
pub struct PreparedCrop {
    pub image: RgbImage,
    pub polarity: TextPolarity,
}

/// Quality grade A (best) to E (worst)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            "E" => Ok(Self::E),
            other => Err(other.to_string()),
        }
    }
}

/// Canonical order of the per-100g nutrient fields, as fed to the grade
/// classifier and as named in the extraction schema.
pub const NUTRIENT_FIELDS: [&str; 9] = [
    "fat_100g",
    "saturated-fat_100g",
    "trans-fat_100g",
    "cholesterol_100g",
    "sodium_100g",
    "carbohydrates_100g",
    "fiber_100g",
    "sugars_100g",
    "proteins_100g",
];

/// Structured nutrition facts, all quantities in grams per 100g
///
/// Every numeric field is always present; absent source values are zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NutrientRecord {
    pub serving_size: Option<String>,
    pub servings_per_container: Option<f64>,
    pub fat_100g: f64,
    #[serde(rename = "saturated-fat_100g")]
    pub saturated_fat_100g: f64,
    #[serde(rename = "trans-fat_100g")]
    pub trans_fat_100g: f64,
    pub cholesterol_100g: f64,
    pub sodium_100g: f64,
    pub carbohydrates_100g: f64,
    pub fiber_100g: f64,
    pub sugars_100g: f64,
    pub proteins_100g: f64,
    pub nutri_score: Option<Grade>,
    #[serde(default)]
    pub nutri_score_predicted: bool,
}

impl NutrientRecord {
    /// The 9 nutrient values in `NUTRIENT_FIELDS` order
    pub fn feature_vector(&self) -> [f32; 9] {
        [
            self.fat_100g as f32,
            self.saturated_fat_100g as f32,
            self.trans_fat_100g as f32,
            self.cholesterol_100g as f32,
            self.sodium_100g as f32,
            self.carbohydrates_100g as f32,
            self.fiber_100g as f32,
            self.sugars_100g as f32,
            self.proteins_100g as f32,
        ]
    }

    /// Mutable access to a nutrient field by its schema name
    pub fn field_mut(&mut self, name: &str) -> Option<&mut f64> {
        match name {
            "fat_100g" => Some(&mut self.fat_100g),
            "saturated-fat_100g" => Some(&mut self.saturated_fat_100g),
            "trans-fat_100g" => Some(&mut self.trans_fat_100g),
            "cholesterol_100g" => Some(&mut self.cholesterol_100g),
            "sodium_100g" => Some(&mut self.sodium_100g),
            "carbohydrates_100g" => Some(&mut self.carbohydrates_100g),
            "fiber_100g" => Some(&mut self.fiber_100g),
            "sugars_100g" => Some(&mut self.sugars_100g),
            "proteins_100g" => Some(&mut self.proteins_100g),
            _ => None,
        }
    }

    /// Apply a predicted grade, replacing any grade asserted by extraction
    pub fn apply_predicted_grade(&mut self, grade: Grade) {
        self.nutri_score = Some(grade);
        self.nutri_score_predicted = true;
    }
}

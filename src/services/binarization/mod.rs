// Binarization Service Module - Prepares rectified crops for text recognition
//
// Two interchangeable strategies share the polarity classifier:
// - FixedChainBinarizer: contrast, glare suppression, CLAHE, denoise, threshold
// - MorphologicalBinarizer: polarity-branching top-hat/black-hat chain

pub mod filters;
pub mod polarity;

use image::{GrayImage, RgbImage};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::{BinarizationConfig, BinarizationStrategy, ThresholdMethod};
use crate::core::errors::BinarizationError;
use crate::core::types::{PreparedCrop, TextPolarity};

pub use polarity::{classify_polarity, PolarityConfig};

/// Turns a rectified color crop into a binary, recognizer-ready crop
pub trait Binarizer: Send + Sync {
    /// Fails with `InvalidCrop` on an empty image; never panics
    fn binarize(&self, image: &RgbImage) -> Result<PreparedCrop, BinarizationError>;

    fn name(&self) -> &'static str;
}

fn ensure_non_empty(image: &RgbImage) -> Result<(), BinarizationError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(BinarizationError::InvalidCrop { width, height });
    }
    Ok(())
}

/// Final thresholding step of the fixed chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdStep {
    Otsu,
    AdaptiveGaussian { block_size: u32, c: f32 },
}

/// Parameters of the fixed enhancement chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedChainParams {
    pub alpha: f32,
    pub beta: f32,
    pub glare_blur_kernel: u32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub denoise_strength: f32,
    pub threshold: ThresholdStep,
}

impl FixedChainParams {
    /// Global Otsu preset
    pub fn otsu() -> Self {
        Self {
            alpha: 0.6,
            beta: 50.0,
            glare_blur_kernel: 5,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            denoise_strength: 10.0,
            threshold: ThresholdStep::Otsu,
        }
    }

    /// Local Gaussian adaptive threshold preset
    pub fn adaptive() -> Self {
        Self {
            alpha: 0.8,
            beta: 30.0,
            glare_blur_kernel: 3,
            clahe_clip_limit: 1.5,
            clahe_tiles: 8,
            denoise_strength: 7.0,
            threshold: ThresholdStep::AdaptiveGaussian {
                block_size: 11,
                c: 2.0,
            },
        }
    }

    pub fn for_method(method: ThresholdMethod) -> Self {
        match method {
            ThresholdMethod::Otsu => Self::otsu(),
            ThresholdMethod::Adaptive => Self::adaptive(),
        }
    }
}

/// Fixed-order chain, identical for every polarity
pub struct FixedChainBinarizer {
    params: FixedChainParams,
    polarity: PolarityConfig,
}

impl FixedChainBinarizer {
    pub fn new(params: FixedChainParams, polarity: PolarityConfig) -> Self {
        Self { params, polarity }
    }

    /// Run the enhancement chain on a luminance image
    pub fn enhance(&self, gray: &GrayImage) -> GrayImage {
        let p = &self.params;
        let adjusted = filters::scale_abs(gray, p.alpha, p.beta);
        let deglared = filters::suppress_highlights(&adjusted, p.glare_blur_kernel);
        let equalized = filters::clahe(&deglared, p.clahe_clip_limit, p.clahe_tiles);
        let denoised = filters::denoise(&equalized, p.denoise_strength);

        match p.threshold {
            ThresholdStep::Otsu => filters::otsu_threshold(&denoised),
            ThresholdStep::AdaptiveGaussian { block_size, c } => {
                filters::adaptive_gaussian_threshold(&denoised, block_size, c)
            }
        }
    }
}

impl Binarizer for FixedChainBinarizer {
    fn binarize(&self, image: &RgbImage) -> Result<PreparedCrop, BinarizationError> {
        ensure_non_empty(image)?;

        let polarity = classify_polarity(image, &self.polarity);
        let binary = self.enhance(&filters::to_luma(image));

        debug!(
            "Fixed-chain binarization: {}x{}, polarity={}",
            image.width(),
            image.height(),
            polarity
        );

        Ok(PreparedCrop {
            image: filters::replicate_to_rgb(&binary),
            polarity,
        })
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Parameters of the morphological chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphologicalParams {
    pub kernel_size: u32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
}

impl Default for MorphologicalParams {
    fn default() -> Self {
        Self {
            kernel_size: 51,
            clahe_clip_limit: 3.0,
            clahe_tiles: 8,
        }
    }
}

/// Polarity-branching chain: top-hat for dark text, black-hat otherwise
pub struct MorphologicalBinarizer {
    params: MorphologicalParams,
    polarity: PolarityConfig,
}

impl MorphologicalBinarizer {
    pub fn new(params: MorphologicalParams, polarity: PolarityConfig) -> Self {
        Self { params, polarity }
    }
}

impl Binarizer for MorphologicalBinarizer {
    fn binarize(&self, image: &RgbImage) -> Result<PreparedCrop, BinarizationError> {
        ensure_non_empty(image)?;

        let polarity = classify_polarity(image, &self.polarity);
        let gray = filters::to_luma(image);
        let p = &self.params;

        let extracted = match polarity {
            TextPolarity::DarkOnLight => filters::top_hat(&gray, p.kernel_size),
            TextPolarity::LightOnDark | TextPolarity::Ambiguous => {
                filters::black_hat(&gray, p.kernel_size)
            }
        };
        let equalized = filters::clahe(&extracted, p.clahe_clip_limit, p.clahe_tiles);
        let binary = filters::otsu_threshold(&equalized);

        debug!(
            "Morphological binarization: {}x{}, polarity={}",
            image.width(),
            image.height(),
            polarity
        );

        Ok(PreparedCrop {
            image: filters::replicate_to_rgb(&binary),
            polarity,
        })
    }

    fn name(&self) -> &'static str {
        "morphological"
    }
}

/// Build the configured binarization strategy
pub fn build_binarizer(config: &BinarizationConfig) -> Arc<dyn Binarizer> {
    let polarity = PolarityConfig {
        cluster_count: config.cluster_count,
        sample_size: config.polarity_sample_size,
    };

    match config.strategy {
        BinarizationStrategy::Fixed => Arc::new(FixedChainBinarizer::new(
            FixedChainParams::for_method(config.threshold_method),
            polarity,
        )),
        BinarizationStrategy::Morphological => {
            // Which chain is intended for production is unresolved; the fixed
            // chain stays the default until that is settled.
            warn!("Using the morphological binarization strategy (non-default)");
            Arc::new(MorphologicalBinarizer::new(
                MorphologicalParams::default(),
                polarity,
            ))
        }
    }
}

// Text polarity classification via color clustering
//
// The crop center is resampled to a small canvas, converted to HSV, and its
// pixels are clustered. The brightest cluster is taken as background and the
// second brightest as text; the text cluster's value channel decides polarity.

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::trace;

use crate::core::types::TextPolarity;

/// Text brighter than this is light-on-dark
pub const LIGHT_TEXT_LEVEL: f32 = 120.0;
/// Text darker than this is dark-on-light
pub const DARK_TEXT_LEVEL: f32 = 80.0;
/// Center zoom factor excluding border noise
pub const CENTER_ZOOM: f32 = 1.1;

const KMEANS_SEED: u64 = 0;
const MAX_KMEANS_ITERATIONS: usize = 100;
const CONVERGENCE_THRESHOLD: f32 = 1e-4;

/// Polarity classifier parameters
#[derive(Debug, Clone, Copy)]
pub struct PolarityConfig {
    pub cluster_count: usize,
    pub sample_size: u32,
}

impl Default for PolarityConfig {
    fn default() -> Self {
        Self {
            cluster_count: 3,
            sample_size: 200,
        }
    }
}

/// HSV on the 8-bit scale: H in [0, 180), S and V in [0, 255]
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [f32; 3] {
    let [r, g, b] = rgb.map(|c| c as f32);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = v - min;

    let s = if v > 0.0 { 255.0 * delta / v } else { 0.0 };
    let h = if delta == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / delta
    } else if v == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    [h / 2.0, s, v]
}

/// Classify the value of the text cluster
pub fn classify_brightness(text_value: f32) -> TextPolarity {
    if text_value > LIGHT_TEXT_LEVEL {
        TextPolarity::LightOnDark
    } else if text_value < DARK_TEXT_LEVEL {
        TextPolarity::DarkOnLight
    } else {
        TextPolarity::Ambiguous
    }
}

/// Center region of the crop, shrunk by `CENTER_ZOOM` on each axis
fn center_crop(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let cw = ((w as f32 / CENTER_ZOOM) as u32).clamp(1, w);
    let ch = ((h as f32 / CENTER_ZOOM) as u32).clamp(1, h);
    imageops::crop_imm(image, (w - cw) / 2, (h - ch) / 2, cw, ch).to_image()
}

/// Cluster centers sorted by brightness (V) descending
pub fn dominant_colors(image: &RgbImage, config: &PolarityConfig) -> Vec<[f32; 3]> {
    let center = center_crop(image);
    let sample = imageops::resize(
        &center,
        config.sample_size,
        config.sample_size,
        FilterType::Triangle,
    );

    let points: Vec<[f32; 3]> = sample.pixels().map(|p| rgb_to_hsv(p.0)).collect();
    let mut centers = kmeans(&points, config.cluster_count);
    centers.sort_by(|a, b| b[2].total_cmp(&a[2]));
    centers
}

/// Classify text polarity of a non-empty crop
///
/// Deterministic for a fixed image and cluster count.
pub fn classify_polarity(image: &RgbImage, config: &PolarityConfig) -> TextPolarity {
    let centers = dominant_colors(image, config);
    // Uniform crops collapse to one color; treat background and text as equal
    let text = centers.get(1).or_else(|| centers.first());

    let polarity = match text {
        Some(c) => classify_brightness(c[2]),
        None => TextPolarity::Ambiguous,
    };
    trace!(?centers, %polarity, "Polarity classified");
    polarity
}

fn squared_distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

fn nearest(point: &[f32; 3], centroids: &[[f32; 3]]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// Seeded k-means (k-means++ initialization, Lloyd iterations)
fn kmeans(data: &[[f32; 3]], k: usize) -> Vec<[f32; 3]> {
    if data.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);
    let mut centroids = initialize_centroids(data, k, &mut rng);
    let mut prev_inertia = f32::INFINITY;

    for _iter in 0..MAX_KMEANS_ITERATIONS {
        let assignments: Vec<usize> = data.par_iter().map(|p| nearest(p, &centroids)).collect();

        let mut sums = vec![[0.0f32; 3]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (point, &cluster) in data.iter().zip(assignments.iter()) {
            for j in 0..3 {
                sums[cluster][j] += point[j];
            }
            counts[cluster] += 1;
        }

        // Empty clusters keep their previous center
        for ((centroid, sum), &count) in centroids.iter_mut().zip(&sums).zip(&counts) {
            if count > 0 {
                *centroid = sum.map(|s| s / count as f32);
            }
        }

        let inertia: f32 = data
            .iter()
            .zip(assignments.iter())
            .map(|(p, &c)| squared_distance(p, &centroids[c]))
            .sum();

        if (prev_inertia - inertia).abs() <= CONVERGENCE_THRESHOLD * prev_inertia.max(1.0) {
            break;
        }
        prev_inertia = inertia;
    }

    centroids
}

fn initialize_centroids(data: &[[f32; 3]], k: usize, rng: &mut StdRng) -> Vec<[f32; 3]> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.gen_range(0..data.len())]);

    while centroids.len() < k {
        let distances: Vec<f32> = data
            .par_iter()
            .map(|p| squared_distance(p, &centroids[nearest(p, &centroids)]))
            .collect();

        let total: f32 = distances.iter().sum();
        if total == 0.0 {
            // Fewer distinct colors than clusters
            break;
        }

        let target = rng.gen::<f32>() * total;
        let mut cumsum = 0.0;
        let mut chosen = data.len() - 1;
        for (i, &d) in distances.iter().enumerate() {
            cumsum += d;
            if cumsum >= target && d > 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(data[chosen]);
    }

    centroids
}

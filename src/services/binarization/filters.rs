// Grayscale filters used by the binarization chains
//
// All functions take and return 8-bit single-channel images and never change
// the image dimensions.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::filter::{bilateral_filter, gaussian_blur_f32};
use imageproc::morphology::{grayscale_close, grayscale_open, Mask};
use rayon::prelude::*;

/// Pixels strictly above this value count as glare
pub const GLARE_THRESHOLD: u8 = 240;

/// Gaussian sigma equivalent to a square kernel of `ksize` with automatic sigma
pub fn sigma_for_kernel(ksize: u32) -> f32 {
    0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Luminance with BT.601 weights
pub fn to_luma(image: &RgbImage) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut out = GrayImage::new(w, h);
    for (src, dst) in image.pixels().zip(out.pixels_mut()) {
        let [r, g, b] = src.0;
        let y = (r as u32 * 299 + g as u32 * 587 + b as u32 * 114 + 500) / 1000;
        *dst = Luma([y.min(255) as u8]);
    }
    out
}

/// Replicate a single channel into R, G and B without altering values
pub fn replicate_to_rgb(gray: &GrayImage) -> RgbImage {
    let (w, h) = gray.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let v = gray.get_pixel(x, y)[0];
        image::Rgb([v, v, v])
    })
}

/// Linear contrast/brightness: |alpha * v + beta| saturated to u8
pub fn scale_abs(gray: &GrayImage, alpha: f32, beta: f32) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        let v = (p[0] as f32 * alpha + beta).abs().round();
        p[0] = v.clamp(0.0, 255.0) as u8;
    }
    out
}

/// Replace glare pixels with a Gaussian-blurred version of the image
pub fn suppress_highlights(gray: &GrayImage, blur_kernel: u32) -> GrayImage {
    let blurred = gaussian_blur_f32(gray, sigma_for_kernel(blur_kernel));
    let mut out = gray.clone();
    for (p, b) in out.pixels_mut().zip(blurred.pixels()) {
        if p[0] > GLARE_THRESHOLD {
            *p = *b;
        }
    }
    out
}

/// Contrast-limited adaptive histogram equalization
///
/// Tile histograms are clipped at `clip_limit * tile_area / 256`, the excess
/// is spread evenly, and per-pixel values are bilinearly interpolated between
/// the four nearest tile mappings.
pub fn clahe(gray: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }

    let tiles_x = tiles.clamp(1, w);
    let tiles_y = tiles.clamp(1, h);
    let x_edge = |t: u32| (t as u64 * w as u64 / tiles_x as u64) as u32;
    let y_edge = |t: u32| (t as u64 * h as u64 / tiles_y as u64) as u32;

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let mut hist = [0u32; 256];
            for y in y_edge(ty)..y_edge(ty + 1) {
                for x in x_edge(tx)..x_edge(tx + 1) {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = (x_edge(tx + 1) - x_edge(tx)) * (y_edge(ty + 1) - y_edge(ty));
            luts[(ty * tiles_x + tx) as usize] = clipped_equalization(&mut hist, area, clip_limit);
        }
    }

    // Continuous tile coordinate of a pixel center, split into the two
    // neighbouring tiles and the blend factor between them.
    let locate = |p: u32, size: u32, count: u32| -> (usize, usize, f32) {
        let f = (p as f32 + 0.5) / size as f32 * count as f32 - 0.5;
        let lo = f.floor().clamp(0.0, (count - 1) as f32);
        let hi = (lo + 1.0).min((count - 1) as f32);
        let a = (f - lo).clamp(0.0, 1.0);
        (lo as usize, hi as usize, a)
    };

    let mut out = GrayImage::new(w, h);
    let stride = w as usize;
    let tiles_x = tiles_x as usize;
    out.as_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(y, row)| {
            let (ty0, ty1, ay) = locate(y as u32, h, tiles_y);
            for (x, dst) in row.iter_mut().enumerate() {
                let (tx0, tx1, ax) = locate(x as u32, w, tiles_x as u32);
                let v = gray.get_pixel(x as u32, y as u32)[0] as usize;

                let top = luts[ty0 * tiles_x + tx0][v] as f32 * (1.0 - ax)
                    + luts[ty0 * tiles_x + tx1][v] as f32 * ax;
                let bottom = luts[ty1 * tiles_x + tx0][v] as f32 * (1.0 - ax)
                    + luts[ty1 * tiles_x + tx1][v] as f32 * ax;
                *dst = (top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8;
            }
        });
    out
}

fn clipped_equalization(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if area == 0 {
        return lut;
    }

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }

        let per_bin = excess / 256;
        let remainder = (excess % 256) as usize;
        for bin in hist.iter_mut() {
            *bin += per_bin;
        }
        if remainder > 0 {
            let step = (256 / remainder).max(1);
            for bin in hist.iter_mut().step_by(step).take(remainder) {
                *bin += 1;
            }
        }
    }

    let scale = 255.0 / area as f32;
    let mut cdf = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[i] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Edge-preserving denoise
///
/// Bilateral filter over a 7x7 window; `strength` is the intensity sigma, so
/// edges between text and background survive while sensor noise is flattened.
pub fn denoise(gray: &GrayImage, strength: f32) -> GrayImage {
    if gray.width() == 0 || gray.height() == 0 || strength <= 0.0 {
        return gray.clone();
    }
    bilateral_filter(gray, 7, strength, 3.0)
}

/// Binary threshold: 255 where the value is above `level`, else 0
pub fn threshold_binary(gray: &GrayImage, level: u8) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p[0] = if p[0] > level { 255 } else { 0 };
    }
    out
}

/// Global Otsu threshold
pub fn otsu_threshold(gray: &GrayImage) -> GrayImage {
    threshold_binary(gray, otsu_level(gray))
}

/// Local threshold against a Gaussian-weighted neighbourhood mean minus `c`
pub fn adaptive_gaussian_threshold(gray: &GrayImage, block_size: u32, c: f32) -> GrayImage {
    let mean = gaussian_blur_f32(gray, sigma_for_kernel(block_size));
    let mut out = gray.clone();
    for (p, m) in out.pixels_mut().zip(mean.pixels()) {
        p[0] = if p[0] as f32 > m[0] as f32 - c { 255 } else { 0 };
    }
    out
}

/// Square structuring element with side `size` (rounded down to odd)
fn square_mask(size: u32) -> Mask {
    Mask::square((size / 2).min(u8::MAX as u32) as u8)
}

/// White top-hat: image minus its opening (bright details smaller than the kernel)
pub fn top_hat(gray: &GrayImage, size: u32) -> GrayImage {
    let opened = grayscale_open(gray, &square_mask(size));
    let mut out = gray.clone();
    for (p, o) in out.pixels_mut().zip(opened.pixels()) {
        p[0] = p[0].saturating_sub(o[0]);
    }
    out
}

/// Black top-hat: closing minus image (dark details smaller than the kernel)
pub fn black_hat(gray: &GrayImage, size: u32) -> GrayImage {
    let mut out = grayscale_close(gray, &square_mask(size));
    for (c, p) in out.pixels_mut().zip(gray.pixels()) {
        c[0] = c[0].saturating_sub(p[0]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([((x * 255) / (w - 1)) as u8]))
    }

    #[test]
    fn test_sigma_for_kernel_matches_auto_sigma() {
        assert!((sigma_for_kernel(3) - 0.8).abs() < 1e-6);
        assert!((sigma_for_kernel(5) - 1.1).abs() < 1e-6);
        assert!((sigma_for_kernel(11) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_scale_abs_saturates() {
        let img = GrayImage::from_raw(3, 1, vec![0, 100, 255]).unwrap();
        let out = scale_abs(&img, 0.6, 50.0);
        assert_eq!(out.as_raw(), &vec![50, 110, 203]);

        let out = scale_abs(&img, 2.0, 0.0);
        assert_eq!(out.as_raw(), &vec![0, 200, 255]);
    }

    #[test]
    fn test_replicate_is_lossless() {
        let img = gradient(16, 4);
        let rgb = replicate_to_rgb(&img);
        for (g, c) in img.pixels().zip(rgb.pixels()) {
            assert_eq!(c.0, [g[0], g[0], g[0]]);
        }
    }

    #[test]
    fn test_suppress_highlights_only_touches_glare() {
        let mut img = GrayImage::from_pixel(20, 20, Luma([100]));
        img.put_pixel(10, 10, Luma([255]));

        let out = suppress_highlights(&img, 5);
        assert_eq!(out.get_pixel(0, 0)[0], 100);
        assert!(out.get_pixel(10, 10)[0] < 255);
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let img = GrayImage::from_fn(64, 64, |x, _| Luma([100 + (x % 2) as u8 * 10]));
        let out = clahe(&img, 2.0, 8);

        let spread = |g: &GrayImage| {
            let max = g.pixels().map(|p| p[0]).max().unwrap();
            let min = g.pixels().map(|p| p[0]).min().unwrap();
            max - min
        };
        assert_eq!(out.dimensions(), img.dimensions());
        assert!(spread(&out) > spread(&img));
    }

    #[test]
    fn test_clahe_tiny_image() {
        let img = GrayImage::from_pixel(3, 2, Luma([42]));
        let out = clahe(&img, 2.0, 8);
        assert_eq!(out.dimensions(), (3, 2));
    }

    #[test]
    fn test_denoise_preserves_edges() {
        let img = GrayImage::from_fn(30, 10, |x, _| Luma([if x < 15 { 20 } else { 230 }]));
        let out = denoise(&img, 10.0);
        assert_eq!(out.get_pixel(14, 5)[0], 20);
        assert_eq!(out.get_pixel(15, 5)[0], 230);
    }

    #[test]
    fn test_denoise_flattens_speckle() {
        let mut img = GrayImage::from_pixel(15, 15, Luma([128]));
        img.put_pixel(7, 7, Luma([136]));
        let out = denoise(&img, 10.0);
        assert!(out.get_pixel(7, 7)[0] < 136);
    }

    #[test]
    fn test_otsu_splits_bimodal() {
        let img = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 30 } else { 220 }]));
        let out = otsu_threshold(&img);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(19, 0)[0], 255);
    }

    #[test]
    fn test_adaptive_threshold_is_binary() {
        let img = gradient(40, 40);
        let out = adaptive_gaussian_threshold(&img, 11, 2.0);
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn test_morphology_extracts_small_features() {
        // Dark 3px line on white
        let img = GrayImage::from_fn(40, 40, |x, _| Luma([if (18..21).contains(&x) { 10 } else { 240 }]));

        let bh = black_hat(&img, 9);
        assert!(bh.get_pixel(19, 20)[0] > 200);
        assert_eq!(bh.get_pixel(5, 20)[0], 0);

        let th = top_hat(&img, 9);
        assert_eq!(th.get_pixel(19, 20)[0], 0);
    }

    #[test]
    fn test_top_hat_keeps_bright_specks() {
        let mut img = GrayImage::from_pixel(21, 21, Luma([60]));
        img.put_pixel(10, 10, Luma([200]));

        let th = top_hat(&img, 5);
        assert_eq!(th.get_pixel(10, 10)[0], 140);
        assert_eq!(th.get_pixel(2, 2)[0], 0);
        assert_eq!(black_hat(&img, 5).get_pixel(10, 10)[0], 0);
    }

    #[test]
    fn test_denoise_empty_image() {
        let img = GrayImage::new(0, 0);
        assert_eq!(denoise(&img, 10.0).dimensions(), (0, 0));
    }
}

// Perspective rectification of detected regions
//
// Orders a region's corners canonically and warps the enclosed quadrilateral
// onto a fronto-parallel canvas.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use tracing::{debug, trace};

use crate::core::errors::{GeometryError, GeometryResult};
use crate::core::types::{Point, Region};

/// Order four points as [top-left, top-right, bottom-right, bottom-left]
///
/// top-left minimizes x+y, bottom-right maximizes it; top-right minimizes
/// y-x, bottom-left maximizes it.
pub fn order_points(points: &[Point; 4]) -> [Point; 4] {
    let sum = |p: &Point| p[0] + p[1];
    let diff = |p: &Point| p[1] - p[0];

    let by = |key: &dyn Fn(&Point) -> f32, max: bool| -> Point {
        let mut best = points[0];
        for p in &points[1..] {
            let better = if max { key(p) > key(&best) } else { key(p) < key(&best) };
            if better {
                best = *p;
            }
        }
        best
    };

    [
        by(&sum, false),
        by(&diff, false),
        by(&sum, true),
        by(&diff, true),
    ]
}

fn distance(a: Point, b: Point) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

/// Output canvas size for an ordered quadrilateral
///
/// Width is the longer of the top and bottom edges, height the longer of the
/// left and right edges, each truncated to whole pixels with a 1px floor.
pub fn output_dimensions(ordered: &[Point; 4]) -> GeometryResult<(u32, u32)> {
    let [tl, tr, br, bl] = *ordered;

    let width = distance(br, bl).max(distance(tr, tl));
    let height = distance(tr, br).max(distance(tl, bl));

    if width <= f32::EPSILON || height <= f32::EPSILON || !width.is_finite() || !height.is_finite()
    {
        return Err(GeometryError::Degenerate {
            width: width as u32,
            height: height as u32,
        });
    }

    Ok(((width as u32).max(1), (height as u32).max(1)))
}

/// Warp the quadrilateral `points` of `image` onto an upright rectangle
pub fn four_point_transform(image: &RgbImage, points: &[Point; 4]) -> GeometryResult<RgbImage> {
    let ordered = order_points(points);
    let (width, height) = output_dimensions(&ordered)?;

    let w = (width - 1) as f32;
    let h = (height - 1) as f32;
    let destination = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
    let source = ordered.map(|p| (p[0], p[1]));

    // A 1px-wide target collapses the destination rectangle; fall back to a
    // pure translation so thin strips still warp.
    let projection = if width == 1 || height == 1 {
        Some(Projection::translate(-ordered[0][0], -ordered[0][1]))
    } else {
        Projection::from_control_points(source, destination)
    }
    .ok_or(GeometryError::SingularTransform)?;

    trace!(?ordered, width, height, "Warping region");

    let mut out = RgbImage::new(width, height);
    warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
    Ok(out)
}

/// Clamp a region's box to the image and rectify it
pub fn rectify(image: &RgbImage, region: &Region) -> GeometryResult<RgbImage> {
    let (img_w, img_h) = image.dimensions();
    let [x1, y1, x2, y2] = region.bbox;

    // Box edges are pixel-edge coordinates: x2 == width is the right border
    let clamp_x = |v: f32| v.clamp(0.0, img_w as f32);
    let clamp_y = |v: f32| v.clamp(0.0, img_h as f32);

    if img_w == 0 || img_h == 0 || x1 >= img_w as f32 || y1 >= img_h as f32 || x2 < 0.0 || y2 < 0.0 {
        return Err(GeometryError::OutOfBounds {
            image_width: img_w,
            image_height: img_h,
        });
    }

    let clamped = Region::new([clamp_x(x1), clamp_y(y1), clamp_x(x2), clamp_y(y2)], region.confidence);
    debug!(bbox = ?clamped.bbox, confidence = clamped.confidence, "Rectifying region");

    four_point_transform(image, &clamped.corners())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_points_canonical() {
        let pts = [[100.0, 10.0], [0.0, 0.0], [10.0, 80.0], [110.0, 90.0]];
        let ordered = order_points(&pts);
        assert_eq!(ordered, [[0.0, 0.0], [100.0, 10.0], [110.0, 90.0], [10.0, 80.0]]);
    }

    #[test]
    fn test_order_points_rotation_invariant() {
        let quad = [[12.0, 8.0], [95.0, 15.0], [90.0, 70.0], [5.0, 60.0]];
        let expected = order_points(&quad);

        for shift in 1..4 {
            let mut rotated = quad;
            rotated.rotate_left(shift);
            assert_eq!(order_points(&rotated), expected, "shift {}", shift);
        }

        let mut reversed = quad;
        reversed.reverse();
        assert_eq!(order_points(&reversed), expected);
    }

    #[test]
    fn test_output_dimensions_for_rectangles() {
        for &(x1, y1, x2, y2) in &[
            (0.0, 0.0, 100.0, 50.0),
            (10.5, 20.25, 40.75, 200.0),
            (3.0, 3.0, 4.0, 300.0),
        ] {
            let region = Region::new([x1, y1, x2, y2], 1.0);
            let (w, h) = output_dimensions(&order_points(&region.corners())).unwrap();
            assert_eq!(w, ((x2 - x1) as u32).max(1));
            assert_eq!(h, ((y2 - y1) as u32).max(1));
            assert!(w >= 1 && h >= 1);
        }
    }

    #[test]
    fn test_sub_pixel_region_gets_one_pixel() {
        let region = Region::new([5.0, 5.0, 5.5, 30.0], 1.0);
        let (w, h) = output_dimensions(&order_points(&region.corners())).unwrap();
        assert_eq!((w, h), (1, 25));
    }

    #[test]
    fn test_degenerate_region_rejected() {
        let image = RgbImage::new(50, 50);

        let line = Region::new([10.0, 10.0, 10.0, 40.0], 0.9);
        assert!(matches!(
            rectify(&image, &line),
            Err(GeometryError::Degenerate { .. })
        ));

        let point = Region::new([10.0, 10.0, 10.0, 10.0], 0.9);
        assert!(matches!(
            rectify(&image, &point),
            Err(GeometryError::Degenerate { .. })
        ));
    }

    #[test]
    fn test_region_outside_image_rejected() {
        let image = RgbImage::new(50, 50);
        let region = Region::new([60.0, 60.0, 90.0, 90.0], 0.9);
        assert!(matches!(
            rectify(&image, &region),
            Err(GeometryError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_rectify_axis_aligned_copies_content() {
        // Left half black, right half white
        let image = RgbImage::from_fn(100, 60, |x, _| {
            if x < 50 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let region = Region::new([20.0, 10.0, 80.0, 50.0], 0.8);

        let warped = rectify(&image, &region).unwrap();
        assert_eq!(warped.dimensions(), (60, 40));
        assert_eq!(warped.get_pixel(5, 20)[0], 0);
        assert_eq!(warped.get_pixel(55, 20)[0], 255);
    }

    #[test]
    fn test_region_is_clamped_to_image() {
        let image = RgbImage::from_pixel(40, 30, Rgb([200, 200, 200]));
        let region = Region::new([-10.0, -5.0, 100.0, 100.0], 0.5);

        let warped = rectify(&image, &region).unwrap();
        assert_eq!(warped.dimensions(), (40, 30));
    }

    #[test]
    fn test_full_frame_region_keeps_dimensions() {
        let image = RgbImage::from_pixel(40, 30, Rgb([90, 90, 90]));
        let region = Region::new([0.0, 0.0, 40.0, 30.0], 0.9);

        let warped = rectify(&image, &region).unwrap();
        assert_eq!(warped.dimensions(), (40, 30));
        assert_eq!(warped.get_pixel(0, 0)[0], 90);
        assert_eq!(warped.get_pixel(20, 15)[0], 90);
    }
}

use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use tracing::{debug, instrument};

use crate::error::{PrepError, Result};
use crate::geometry::{estimate_homography, BoundingBox, Corners, Homography, Point};

/// Reprojection tolerance absorbing small annotation imprecision
pub const DEFAULT_RANSAC_THRESHOLD: f64 = 3.0;

/// Size of the rectified rectangle: the longer of each pair of opposite
/// edges, floored.
pub fn target_size(corners: &Corners) -> (i64, i64) {
    let top = corners.upper_left.distance(&corners.upper_right);
    let bottom = corners.lower_left.distance(&corners.lower_right);
    let left = corners.upper_left.distance(&corners.lower_left);
    let right = corners.upper_right.distance(&corners.lower_right);
    (top.max(bottom).floor() as i64, left.max(right).floor() as i64)
}

/// Rectangle corners in UL, UR, LL, LR order
pub fn target_corners(width: i64, height: i64) -> [Point; 4] {
    let (w, h) = ((width - 1) as f64, (height - 1) as f64);
    [
        Point::new(0.0, 0.0),
        Point::new(w, 0.0),
        Point::new(0.0, h),
        Point::new(w, h),
    ]
}

/// Estimate the transform taking the quadrilateral onto the origin-anchored
/// target rectangle.
///
/// Returns the transform with the size actually rendered: the target
/// rectangle clipped to the source canvas, so the output never outgrows the
/// image it was warped from.
pub fn rectifying_homography(
    corners: &Corners,
    threshold: f64,
    image_size: (u32, u32),
) -> Result<(Homography, u32, u32)> {
    let (width, height) = target_size(corners);
    if width <= 0 || height <= 0 {
        return Err(PrepError::EmptyRegion {
            width,
            height,
            image_width: image_size.0,
            image_height: image_size.1,
        });
    }
    let homography = estimate_homography(
        &corners.to_array(),
        &target_corners(width, height),
        threshold,
    )?;

    let clip = |extent: i64, limit: u32| u32::try_from(extent).map_or(limit, |e| e.min(limit));
    let (render_width, render_height) = (clip(width, image_size.0), clip(height, image_size.1));
    if render_width == 0 || render_height == 0 {
        return Err(PrepError::EmptyRegion {
            width: render_width.into(),
            height: render_height.into(),
            image_width: image_size.0,
            image_height: image_size.1,
        });
    }
    if i64::from(render_width) != width || i64::from(render_height) != height {
        debug!(
            width,
            height,
            render_width,
            render_height,
            "Target rectangle clipped to source canvas"
        );
    }
    Ok((homography, render_width, render_height))
}

fn to_projection(homography: &Homography) -> Result<Projection> {
    Projection::from_matrix(homography.to_row_major()).ok_or_else(|| {
        PrepError::HomographyEstimationFailed("estimated transform is not invertible".to_string())
    })
}

/// Correct the perspective of the quadrilateral described by `corners`.
///
/// Pixels are resampled bilinearly. The target rectangle follows the longer
/// edges of the quadrilateral, but only its overlap with a source-sized canvas
/// at the origin is rendered, the same block a crop of a full-canvas warp
/// keeps. Samples falling outside the source are black (transparent for
/// images with alpha).
#[instrument(skip(img), fields(src_width = img.width(), src_height = img.height()))]
pub fn rectify(img: &DynamicImage, corners: &Corners, threshold: f64) -> Result<DynamicImage> {
    let (homography, width, height) =
        rectifying_homography(corners, threshold, (img.width(), img.height()))?;
    let projection = to_projection(&homography)?;

    debug!(width, height, "Warping quadrilateral onto target rectangle");

    let rectified = if img.color().has_alpha() {
        let mut out = RgbaImage::new(width, height);
        warp_into(
            &img.to_rgba8(),
            &projection,
            Interpolation::Bilinear,
            Rgba([0, 0, 0, 0]),
            &mut out,
        );
        DynamicImage::ImageRgba8(out)
    } else {
        let mut out = RgbImage::new(width, height);
        warp_into(
            &img.to_rgb8(),
            &projection,
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
            &mut out,
        );
        DynamicImage::ImageRgb8(out)
    };

    Ok(rectified)
}

/// Composite an RGBA image over an opaque background colour
pub fn flatten_alpha(img: &RgbaImage, background: Rgb<u8>) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let Rgba([r, g, b, a]) = *img.get_pixel(x, y);
        let alpha = a as f32 / 255.0;
        let mix = |fg: u8, bg: u8| -> u8 {
            (fg as f32 * alpha + bg as f32 * (1.0 - alpha))
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb([
            mix(r, background[0]),
            mix(g, background[1]),
            mix(b, background[2]),
        ])
    })
}

/// Clamp a box to the image, returning `(x, y, width, height)` of the overlap
pub fn clamp_box(bbox: &BoundingBox, image_width: u32, image_height: u32) -> Result<(u32, u32, u32, u32)> {
    let x0 = bbox.left.max(0);
    let y0 = bbox.top.max(0);
    let x1 = bbox.left.saturating_add(bbox.width).min(image_width as i64);
    let y1 = bbox.top.saturating_add(bbox.height).min(image_height as i64);

    if x1 <= x0 || y1 <= y0 {
        return Err(PrepError::EmptyRegion {
            width: (x1 - x0).max(0),
            height: (y1 - y0).max(0),
            image_width,
            image_height,
        });
    }
    Ok((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Crop a labeled box out of a rectangled image.
///
/// Boxes reaching past the image are clamped to it. Transparent pixels are
/// composited over `background`, so the region is always opaque RGB.
pub fn extract_region(img: &DynamicImage, bbox: &BoundingBox, background: Rgb<u8>) -> Result<RgbImage> {
    let (x, y, width, height) = clamp_box(bbox, img.width(), img.height())?;
    let cropped = img.crop_imm(x, y, width, height);

    debug!(
        label = %bbox.label,
        x, y, width, height,
        "Extracted region"
    );

    if cropped.color().has_alpha() {
        Ok(flatten_alpha(&cropped.to_rgba8(), background))
    } else {
        Ok(cropped.to_rgb8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{resolve_corners, CornerSet};

    const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

    fn corners(coords: [(f64, f64); 4]) -> Corners {
        let set = CornerSet::new(coords.map(|(x, y)| Point::new(x, y))).unwrap();
        resolve_corners(&set).unwrap()
    }

    /// Four flat colour quadrants split at (60, 40)
    fn quadrant_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| match (x < 60, y < 40) {
            (true, true) => Rgb([200, 30, 30]),
            (false, true) => Rgb([30, 200, 30]),
            (true, false) => Rgb([30, 30, 200]),
            (false, false) => Rgb([220, 220, 40]),
        })
    }

    /// Bilinear weights are summed in f32, so flat regions may land one level low
    fn assert_close(actual: &Rgb<u8>, expected: &Rgb<u8>) {
        for c in 0..3 {
            let diff = (actual[c] as i32 - expected[c] as i32).abs();
            assert!(diff <= 1, "{:?} differs from {:?}", actual, expected);
        }
    }

    fn bbox(top: i64, left: i64, width: i64, height: i64) -> BoundingBox {
        BoundingBox {
            top,
            left,
            width,
            height,
            label: "Empty".to_string(),
        }
    }

    #[test]
    fn test_target_size_uses_longer_edges() {
        let c = corners([(0.0, 0.0), (100.0, 2.0), (1.0, 50.0), (99.0, 52.0)]);
        assert_eq!(target_size(&c), (100, 50));
    }

    #[test]
    fn test_rectify_axis_aligned_quad() {
        let img = DynamicImage::ImageRgb8(quadrant_image(160, 120));
        let c = corners([(0.0, 0.0), (100.0, 0.0), (0.0, 50.0), (100.0, 50.0)]);
        let out = rectify(&img, &c, DEFAULT_RANSAC_THRESHOLD).unwrap();
        assert_eq!(out.width(), 100);
        assert_eq!(out.height(), 50);

        // Near-identity: flat regions keep their colours away from the seams.
        let rgb = out.to_rgb8();
        assert_close(rgb.get_pixel(10, 10), &Rgb([200, 30, 30]));
        assert_close(rgb.get_pixel(90, 10), &Rgb([30, 200, 30]));
        assert_close(rgb.get_pixel(10, 45), &Rgb([30, 30, 200]));
        assert_close(rgb.get_pixel(90, 45), &Rgb([220, 220, 40]));
    }

    #[test]
    fn test_rectify_reannotated_crop_matches_source() {
        let src = quadrant_image(160, 120);
        let img = DynamicImage::ImageRgb8(src.clone());
        let c = corners([(20.0, 10.0), (120.0, 10.0), (20.0, 90.0), (120.0, 90.0)]);
        let out = rectify(&img, &c, DEFAULT_RANSAC_THRESHOLD).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (100, 80));

        for &(x, y) in &[(5u32, 5u32), (70, 5), (5, 60), (70, 60)] {
            assert_close(out.get_pixel(x, y), src.get_pixel(x + 20, y + 10));
        }
    }

    #[test]
    fn test_rectify_matches_cropped_full_canvas_warp() {
        let src = quadrant_image(160, 120);
        let img = DynamicImage::ImageRgb8(src.clone());
        let c = corners([(15.0, 12.0), (140.0, 5.0), (10.0, 100.0), (150.0, 110.0)]);

        let out = rectify(&img, &c, DEFAULT_RANSAC_THRESHOLD).unwrap().to_rgb8();

        let (homography, width, height) =
            rectifying_homography(&c, DEFAULT_RANSAC_THRESHOLD, src.dimensions()).unwrap();
        let projection = to_projection(&homography).unwrap();
        let mut full = RgbImage::new(src.width(), src.height());
        warp_into(&src, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut full);
        let cropped = image::imageops::crop_imm(&full, 0, 0, width, height).to_image();

        assert_eq!(out, cropped);
    }

    #[test]
    fn test_rectify_degenerate_width_is_empty_region() {
        // Resolvable corners whose opposite edges are both shorter than a pixel.
        let c = Corners {
            upper_left: Point::new(0.0, 0.0),
            upper_right: Point::new(0.5, 0.0),
            lower_left: Point::new(0.0, 10.0),
            lower_right: Point::new(0.5, 10.0),
        };
        let img = DynamicImage::ImageRgb8(RgbImage::new(20, 20));
        assert!(matches!(
            rectify(&img, &c, DEFAULT_RANSAC_THRESHOLD),
            Err(PrepError::EmptyRegion { width: 0, .. })
        ));
    }

    #[test]
    fn test_rectify_target_wider_than_u32_is_clipped() {
        let far = 4_294_967_306.0;
        let c = corners([(0.0, 0.0), (far, 0.0), (0.0, far), (far, far)]);
        assert_eq!(target_size(&c), (4_294_967_306, 4_294_967_306));

        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([50, 100, 150])));
        let out = rectify(&img, &c, DEFAULT_RANSAC_THRESHOLD).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (20, 20));
        assert_close(out.get_pixel(10, 10), &Rgb([50, 100, 150]));
    }

    #[test]
    fn test_rectify_never_exceeds_source_canvas() {
        let src = quadrant_image(100, 100);
        let img = DynamicImage::ImageRgb8(src.clone());
        let c = corners([(0.0, 0.0), (99.0, 60.0), (0.0, 70.0), (99.0, 99.0)]);
        assert_eq!(target_size(&c), (115, 70));

        let out = rectify(&img, &c, DEFAULT_RANSAC_THRESHOLD).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (100, 70));

        let (homography, _, _) =
            rectifying_homography(&c, DEFAULT_RANSAC_THRESHOLD, src.dimensions()).unwrap();
        let projection = to_projection(&homography).unwrap();
        let mut full = RgbImage::new(src.width(), src.height());
        warp_into(&src, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut full);
        let cropped = image::imageops::crop_imm(&full, 0, 0, 100, 70).to_image();
        assert_eq!(out, cropped);
    }

    #[test]
    fn test_rectify_keeps_alpha_channel() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(50, 50, Rgba([9, 9, 9, 255])));
        let c = corners([(0.0, 0.0), (30.0, 0.0), (0.0, 20.0), (30.0, 20.0)]);
        let out = rectify(&img, &c, DEFAULT_RANSAC_THRESHOLD).unwrap();
        assert!(out.color().has_alpha());
    }

    #[test]
    fn test_extract_exact_box() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(200, 200));
        let region = extract_region(&img, &bbox(10, 20, 30, 15), WHITE).unwrap();
        assert_eq!(region.dimensions(), (30, 15));
    }

    #[test]
    fn test_extract_clamps_partial_box() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(50, 40));
        let region = extract_region(&img, &bbox(-5, 30, 100, 20), WHITE).unwrap();
        assert_eq!(region.dimensions(), (20, 15));

        let everything = extract_region(&img, &bbox(-10, -10, 500, 500), WHITE).unwrap();
        assert_eq!(everything.dimensions(), (50, 40));
    }

    #[test]
    fn test_extract_outside_image_is_empty_region() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(50, 40));
        assert!(matches!(
            extract_region(&img, &bbox(100, 100, 10, 10), WHITE),
            Err(PrepError::EmptyRegion { .. })
        ));
        assert!(matches!(
            extract_region(&img, &bbox(5, 5, 0, 10), WHITE),
            Err(PrepError::EmptyRegion { .. })
        ));
    }

    #[test]
    fn test_extract_flattens_transparency() {
        let mut rgba = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 1, Rgba([10, 20, 30, 255]));
        let img = DynamicImage::ImageRgba8(rgba);
        let region = extract_region(&img, &bbox(0, 0, 4, 4), WHITE).unwrap();
        assert_eq!(*region.get_pixel(0, 0), WHITE);
        assert_eq!(*region.get_pixel(1, 1), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_flatten_half_alpha() {
        let rgba = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128]));
        let flat = flatten_alpha(&rgba, WHITE);
        let v = flat.get_pixel(0, 0)[0];
        assert!((126..=128).contains(&v));
    }
}

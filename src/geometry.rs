use nalgebra::{DMatrix, Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{PrepError, Result};

/// Twice the triangle area below which three points count as collinear
const COLLINEAR_EPSILON: f64 = 1e-6;

/// A point in image pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Four corner annotations of a quadrilateral, in no particular order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerSet {
    points: [Point; 4],
}

impl CornerSet {
    /// Validate four annotated points. Coordinates must be finite and no two
    /// points may coincide.
    pub fn new(points: [Point; 4]) -> Result<Self> {
        if let Some(p) = points.iter().find(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(PrepError::InvalidCornerGeometry(format!(
                "non-finite corner ({}, {})",
                p.x, p.y
            )));
        }
        for i in 0..4 {
            for j in (i + 1)..4 {
                if points[i] == points[j] {
                    return Err(PrepError::InvalidCornerGeometry(format!(
                        "corners {} and {} coincide at ({}, {})",
                        i, j, points[i].x, points[i].y
                    )));
                }
            }
        }
        Ok(Self { points })
    }

    pub fn from_slice(points: &[Point]) -> Result<Self> {
        let points: [Point; 4] = points.try_into().map_err(|_| {
            PrepError::InvalidCornerGeometry(format!(
                "expected exactly 4 vertices, got {}",
                points.len()
            ))
        })?;
        Self::new(points)
    }

    pub fn points(&self) -> &[Point; 4] {
        &self.points
    }
}

/// Corners assigned to their semantic roles
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corners {
    pub upper_left: Point,
    pub upper_right: Point,
    pub lower_left: Point,
    pub lower_right: Point,
}

impl Corners {
    /// Corners in UL, UR, LL, LR order
    pub fn to_array(&self) -> [Point; 4] {
        [
            self.upper_left,
            self.upper_right,
            self.lower_left,
            self.lower_right,
        ]
    }
}

/// Indices of the two points ranked first by `key`.
///
/// Equal keys are ranked by input index, so a tie at the cut-off always keeps
/// the point that was annotated first.
fn extremal_pair(points: &[Point; 4], key: impl Fn(&Point) -> f64, descending: bool) -> [usize; 2] {
    let mut order = [0usize, 1, 2, 3];
    order.sort_by(|&a, &b| {
        let (ka, kb) = (key(&points[a]), key(&points[b]));
        let by_key = if descending {
            kb.total_cmp(&ka)
        } else {
            ka.total_cmp(&kb)
        };
        by_key.then(a.cmp(&b))
    });
    [order[0], order[1]]
}

fn shared_point(a: [usize; 2], b: [usize; 2], role: &str) -> Result<usize> {
    let shared: Vec<usize> = a.iter().copied().filter(|i| b.contains(i)).collect();
    match shared.as_slice() {
        [index] => Ok(*index),
        [] => Err(PrepError::InvalidCornerGeometry(format!(
            "no point qualifies as the {} corner",
            role
        ))),
        _ => Err(PrepError::InvalidCornerGeometry(format!(
            "{} corner is ambiguous between points {:?}",
            role, shared
        ))),
    }
}

/// Assign each of the four points to UL, UR, LL or LR.
///
/// The upper-left corner is the one point that is both among the two leftmost
/// and among the two topmost points, and likewise for the other roles. The
/// result depends only on geometry, except for ties on an extremal coordinate,
/// which are broken by input order (see [`extremal_pair`]). Any role left empty
/// or shared by two points is an [`PrepError::InvalidCornerGeometry`].
pub fn resolve_corners(set: &CornerSet) -> Result<Corners> {
    let points = set.points();
    let leftmost = extremal_pair(points, |p| p.x, false);
    let topmost = extremal_pair(points, |p| p.y, false);
    let rightmost = extremal_pair(points, |p| p.x, true);
    let bottommost = extremal_pair(points, |p| p.y, true);

    let roles = [
        shared_point(leftmost, topmost, "upper-left")?,
        shared_point(rightmost, topmost, "upper-right")?,
        shared_point(leftmost, bottommost, "lower-left")?,
        shared_point(rightmost, bottommost, "lower-right")?,
    ];

    let mut seen = roles;
    seen.sort_unstable();
    if seen.windows(2).any(|w| w[0] == w[1]) {
        return Err(PrepError::InvalidCornerGeometry(format!(
            "roles do not partition the corners: {:?}",
            roles
        )));
    }

    Ok(Corners {
        upper_left: points[roles[0]],
        upper_right: points[roles[1]],
        lower_left: points[roles[2]],
        lower_right: points[roles[3]],
    })
}

/// A planar projective transform, `dst ~ H * src`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    /// Map a point through the transform. Points sent to infinity come back
    /// with non-finite coordinates.
    pub fn apply(&self, p: Point) -> Point {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        Point::new(v.x / v.z, v.y / v.z)
    }

    pub fn reprojection_error(&self, src: Point, dst: Point) -> f64 {
        self.apply(src).distance(&dst)
    }

    /// Row-major `f32` coefficients, the layout `imageproc` projections expect
    pub fn to_row_major(&self) -> [f32; 9] {
        let mut out = [0.0f32; 9];
        for row in 0..3 {
            for col in 0..3 {
                out[row * 3 + col] = self.h[(row, col)] as f32;
            }
        }
        out
    }
}

fn is_collinear(a: Point, b: Point, c: Point) -> bool {
    let cross = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    cross.abs() < COLLINEAR_EPSILON
}

fn is_degenerate(pts: &[Point; 4]) -> bool {
    is_collinear(pts[0], pts[1], pts[2])
        || is_collinear(pts[0], pts[1], pts[3])
        || is_collinear(pts[0], pts[2], pts[3])
        || is_collinear(pts[1], pts[2], pts[3])
}

/// Translate to the centroid and scale so the mean distance is sqrt(2)
fn normalize_points(pts: &[Point]) -> (Vec<Point>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy))
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(
        s, 0.0, -s * cx,
        0.0, s, -s * cy,
        0.0, 0.0, 1.0,
    );

    let normalized = pts
        .iter()
        .map(|p| Point::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    (normalized, t)
}

fn denormalize(hn: Matrix3<f64>, t_src: &Matrix3<f64>, t_dst: &Matrix3<f64>) -> Option<Homography> {
    let h = t_dst.try_inverse()? * hn * t_src;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 || !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Homography::new(h / scale))
}

/// Exact homography through four correspondences, with h33 fixed to 1
fn homography_from_4pt(src: &[Point; 4], dst: &[Point; 4]) -> Option<Homography> {
    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for k in 0..4 {
        let (x, y) = (src_n[k].x, src_n[k].y);
        let (u, v) = (dst_n[k].x, dst_n[k].y);

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;
    let hn = Matrix3::new(
        x[0], x[1], x[2], //
        x[3], x[4], x[5], //
        x[6], x[7], 1.0,
    );
    denormalize(hn, &t_src, &t_dst)
}

/// Least-squares homography over five or more correspondences (normalized DLT)
fn homography_dlt(src: &[Point], dst: &[Point]) -> Option<Homography> {
    let (s, t_src) = normalize_points(src);
    let (d, t_dst) = normalize_points(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for k in 0..n {
        let (x, y) = (s[k].x, s[k].y);
        let (u, v) = (d[k].x, d[k].y);

        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let h = v_t.row(v_t.nrows().checked_sub(1)?);
    let hn = Matrix3::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);
    denormalize(hn, &t_src, &t_dst)
}

fn four_point_samples(n: usize) -> Vec<[usize; 4]> {
    let mut samples = Vec::new();
    for a in 0..n {
        for b in (a + 1)..n {
            for c in (b + 1)..n {
                for d in (c + 1)..n {
                    samples.push([a, b, c, d]);
                }
            }
        }
    }
    samples
}

/// Fit `dst ~ H * src` with a RANSAC-style consensus search.
///
/// Every 4-point sample is tried in index order (four correspondences give
/// exactly one sample), non-degenerate samples are solved exactly, and the
/// model with the most correspondences within `threshold` pixels of
/// reprojection error wins. With more than four inliers the winner is refined
/// by least squares over the inlier set.
pub fn estimate_homography(src: &[Point], dst: &[Point], threshold: f64) -> Result<Homography> {
    if src.len() != dst.len() {
        return Err(PrepError::HomographyEstimationFailed(format!(
            "{} source points but {} target points",
            src.len(),
            dst.len()
        )));
    }
    if src.len() < 4 {
        return Err(PrepError::HomographyEstimationFailed(format!(
            "need at least 4 correspondences, got {}",
            src.len()
        )));
    }

    let n = src.len();
    let mut best: Option<(Homography, Vec<usize>)> = None;

    for sample in four_point_samples(n) {
        let s = sample.map(|i| src[i]);
        let d = sample.map(|i| dst[i]);
        if is_degenerate(&s) || is_degenerate(&d) {
            continue;
        }
        let Some(model) = homography_from_4pt(&s, &d) else {
            continue;
        };

        let inliers: Vec<usize> = (0..n)
            .filter(|&i| model.reprojection_error(src[i], dst[i]) <= threshold)
            .collect();
        let consensus = inliers.len();
        let improves = best
            .as_ref()
            .map_or(true, |(_, current)| consensus > current.len());
        if improves {
            best = Some((model, inliers));
        }
        if consensus == n {
            break;
        }
    }

    let (model, inliers) = best.ok_or_else(|| {
        PrepError::HomographyEstimationFailed(
            "every 4-point sample is collinear or singular".to_string(),
        )
    })?;
    if inliers.len() < 4 {
        return Err(PrepError::HomographyEstimationFailed(format!(
            "only {} of {} correspondences within {:.1}px",
            inliers.len(),
            n,
            threshold
        )));
    }
    if inliers.len() == 4 {
        return Ok(model);
    }

    let in_src: Vec<Point> = inliers.iter().map(|&i| src[i]).collect();
    let in_dst: Vec<Point> = inliers.iter().map(|&i| dst[i]).collect();
    Ok(homography_dlt(&in_src, &in_dst).unwrap_or(model))
}

/// Accept integral or fractional pixel values, rounding to the nearest pixel
fn pixel<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() {
        return Err(serde::de::Error::custom("pixel value must be finite"));
    }
    Ok(value.round() as i64)
}

/// An axis-aligned labeled box, `[left, left + width) x [top, top + height)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(deserialize_with = "pixel")]
    pub top: i64,
    #[serde(deserialize_with = "pixel")]
    pub left: i64,
    #[serde(deserialize_with = "pixel")]
    pub width: i64,
    #[serde(deserialize_with = "pixel")]
    pub height: i64,
    pub label: String,
}

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shared::geometry::Point;

const EPS: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("source quadrilateral is degenerate; no homography exists")]
    DegenerateQuad,
    #[error("target size must be positive, got {width}x{height}")]
    InvalidTargetSize { width: f64, height: f64 },
    #[error("point ({x}, {y}) maps to infinity under the perspective transform")]
    PointAtInfinity { x: f64, y: f64 },
}

/// Source quadrilateral and the rectangle it is rectified onto.
///
/// Corners are ordered top-left, top-right, bottom-right, bottom-left as seen
/// in the camera image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveConfig {
    pub source_quad: [Point; 4],
    pub target_size: [f64; 2],
}

/// Fixed homography mapping image-space points into a top-down frame where
/// pixel displacement approximates ground displacement.
#[derive(Clone, Debug, PartialEq)]
pub struct PerspectiveTransform {
    matrix: Matrix3<f64>,
}

impl PerspectiveTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Solves the 8-unknown DLT system for the quad → rectangle mapping.
    pub fn new(source_quad: &[Point; 4], target_size: [f64; 2]) -> Result<Self, GeometryError> {
        let [width, height] = target_size;
        if !(width > 0.0 && height > 0.0) {
            return Err(GeometryError::InvalidTargetSize { width, height });
        }

        let target = [
            Point::new(0.0, 0.0),
            Point::new(width, 0.0),
            Point::new(width, height),
            Point::new(0.0, height),
        ];

        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for (i, (src, dst)) in source_quad.iter().zip(target.iter()).enumerate() {
            let r = 2 * i;
            a[(r, 0)] = src.x;
            a[(r, 1)] = src.y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -dst.x * src.x;
            a[(r, 7)] = -dst.x * src.y;
            b[r] = dst.x;

            a[(r + 1, 3)] = src.x;
            a[(r + 1, 4)] = src.y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -dst.y * src.x;
            a[(r + 1, 7)] = -dst.y * src.y;
            b[r + 1] = dst.y;
        }

        let h = a.lu().solve(&b).ok_or(GeometryError::DegenerateQuad)?;
        if h.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::DegenerateQuad);
        }

        let matrix = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        if matrix.determinant().abs() <= EPS {
            return Err(GeometryError::DegenerateQuad);
        }
        Ok(Self { matrix })
    }

    pub fn from_config(config: Option<&PerspectiveConfig>) -> Result<Self, GeometryError> {
        match config {
            Some(c) => Self::new(&c.source_quad, c.target_size),
            None => Ok(Self::identity()),
        }
    }

    pub fn apply(&self, point: &Point) -> Result<Point, GeometryError> {
        let v = self.matrix * Vector3::new(point.x, point.y, 1.0);
        let w = v[2];
        if !w.is_finite() || w.abs() <= EPS || !v[0].is_finite() || !v[1].is_finite() {
            return Err(GeometryError::PointAtInfinity {
                x: point.x,
                y: point.y,
            });
        }
        Ok(Point::new(v[0] / w, v[1] / w))
    }

    pub fn apply_all(&self, points: &[Point]) -> Result<Vec<Point>, GeometryError> {
        points.iter().map(|p| self.apply(p)).collect()
    }
}

impl Default for PerspectiveTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// One-shot rectification: builds the transform and maps `points` through it.
///
/// Empty input is a no-op, even for a quad that would fail to solve.
pub fn rectify(
    points: &[Point],
    source_quad: &[Point; 4],
    target_size: [f64; 2],
) -> Result<Vec<Point>, GeometryError> {
    if points.is_empty() {
        return Ok(Vec::new());
    }
    PerspectiveTransform::new(source_quad, target_size)?.apply_all(points)
}

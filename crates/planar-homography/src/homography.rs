use crate::HomographyError;
use nalgebra::{Matrix3, Point2, Vector3};
use serde::{Deserialize, Serialize};

/// 2D point with `f64` coordinates, used for both scene and image points.
pub type Pt2 = Point2<f64>;

/// Smallest accepted perspective divisor `w = h20·x + h21·y + h22`, relative
/// to `|h20·x| + |h21·y| + |h22|`.
///
/// Being relative, the test gives the same answer for `H` and `s·H`.
pub const DIVISOR_EPS: f64 = 1e-12;

/// Smallest accepted reciprocal condition number `σ_min / σ_max` of `H`.
///
/// Scale-free like [`DIVISOR_EPS`]. Pixel-scale homographies with large
/// translations are ill-conditioned but still well inside this bound.
pub const SINGULAR_EPS: f64 = 1e-14;

/// True when `w` is numerically zero next to the terms it was summed from.
#[inline]
pub(crate) fn divisor_vanishes(w: f64, magnitude: f64) -> bool {
    !w.is_finite() || w.abs() <= DIVISOR_EPS * magnitude
}

/// Planar projective transform `p' ~ H p`, defined up to a nonzero scale.
///
/// This is a plain value: no normalization is applied behind the caller's
/// back. Use [`Homography::normalized`] to pick the `h22 == 1` representative.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn from_array(rows: [[f64; 3]; 3]) -> Self {
        Self::new(Matrix3::from_row_slice(&[
            rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
            rows[2][1], rows[2][2],
        ]))
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        [
            [self.h[(0, 0)], self.h[(0, 1)], self.h[(0, 2)]],
            [self.h[(1, 0)], self.h[(1, 1)], self.h[(1, 2)]],
            [self.h[(2, 0)], self.h[(2, 1)], self.h[(2, 2)]],
        ]
    }

    /// Build from the 9 entries in row-major order `[h0 .. h8]`.
    pub fn from_row_slice(h: &[f64; 9]) -> Self {
        Self::new(Matrix3::from_row_slice(h))
    }

    /// The 9 entries in row-major order.
    pub fn to_row_slice(&self) -> [f64; 9] {
        let mut out = [0.0; 9];
        for r in 0..3 {
            for c in 0..3 {
                out[3 * r + c] = self.h[(r, c)];
            }
        }
        out
    }

    /// Scaled representative with `h22 == 1`.
    ///
    /// Falls back to unit Frobenius norm when `h22` is too small to divide by,
    /// and returns `self` unchanged for the zero matrix.
    pub fn normalized(&self) -> Self {
        let norm = self.h.norm();
        if norm <= 0.0 || !norm.is_finite() {
            return *self;
        }
        let s = self.h[(2, 2)];
        if s.abs() > DIVISOR_EPS * norm {
            Self::new(self.h / s)
        } else {
            Self::new(self.h / norm)
        }
    }

    /// True when `H` has no usable inverse: non-finite entries, an exactly
    /// zero determinant, or `σ_min / σ_max` below [`SINGULAR_EPS`].
    pub fn is_singular(&self) -> bool {
        if !self.h.iter().all(|v| v.is_finite()) {
            return true;
        }
        let sv = self.h.singular_values();
        let max = sv.iter().copied().fold(0.0, f64::max);
        let min = sv.iter().copied().fold(f64::INFINITY, f64::min);
        max <= 0.0 || min / max < SINGULAR_EPS || self.h.try_inverse().is_none()
    }

    /// Matrix inverse, i.e. the image-to-scene mapping.
    pub fn inverse(&self) -> Result<Self, HomographyError> {
        if self.is_singular() {
            return Err(HomographyError::SingularMatrix);
        }
        match self.h.try_inverse() {
            Some(inv) if inv.iter().all(|v| v.is_finite()) => Ok(Self::new(inv)),
            _ => Err(HomographyError::SingularMatrix),
        }
    }

    /// Map `p` through `H` with the perspective divide.
    #[inline]
    pub fn apply(&self, p: Pt2) -> Result<Pt2, HomographyError> {
        if !p.x.is_finite() || !p.y.is_finite() {
            return Err(HomographyError::invalid(format!(
                "non-finite point ({}, {})",
                p.x, p.y
            )));
        }
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        let w = v[2];
        let magnitude =
            (self.h[(2, 0)] * p.x).abs() + (self.h[(2, 1)] * p.y).abs() + self.h[(2, 2)].abs();
        if divisor_vanishes(w, magnitude) {
            return Err(HomographyError::DegenerateTransform { x: p.x, y: p.y, w });
        }
        let out = Pt2::new(v[0] / w, v[1] / w);
        if !out.x.is_finite() || !out.y.is_finite() {
            return Err(HomographyError::DegenerateTransform { x: p.x, y: p.y, w });
        }
        Ok(out)
    }

    /// Map every point; fails on the first degenerate one.
    pub fn apply_all(&self, pts: &[Pt2]) -> Result<Vec<Pt2>, HomographyError> {
        pts.iter().map(|&p| self.apply(p)).collect()
    }
}

impl Default for Homography {
    fn default() -> Self {
        Self::identity()
    }
}

/// Map a scene point to the image: `(u, v) = (H·[x, y, 1]ᵀ)` after the
/// perspective divide.
pub fn transform_scene_to_image(point: Pt2, h: &Homography) -> Result<Pt2, HomographyError> {
    h.apply(point)
}

/// Map an image point back to the scene through `H⁻¹`.
///
/// The inverse is computed on every call. When mapping many points, invert
/// once with [`Homography::inverse`] and reuse it.
pub fn transform_image_to_scene(point: Pt2, h: &Homography) -> Result<Pt2, HomographyError> {
    h.inverse()?.apply(point)
}

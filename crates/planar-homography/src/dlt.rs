//! Homography estimation with the Direct Linear Transform.
//!
//! Every correspondence `(x, y) -> (u, v)` contributes two rows to the
//! `2N x 9` design matrix `A`:
//!
//! ```text
//! [ x  y  1  0  0  0  -u*x  -u*y  -u ]
//! [ 0  0  0  x  y  1  -v*x  -v*y  -v ]
//! ```
//!
//! and `h` (the entries of `H` in row-major order) solves `A h = 0` in the
//! least-squares sense under `‖h‖ = 1`: it is the right singular vector of
//! the smallest singular value of `A`.

use crate::reprojection::calculate_error;
use crate::{Homography, HomographyError, Pt2};
use log::debug;
use nalgebra::{DMatrix, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Fewest correspondences that constrain the 8 degrees of freedom of `H`.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Relative size of the second-smallest singular value below which the null
/// space of `A` is treated as more than one-dimensional.
pub const DEGENERATE_RANK_TOL: f64 = 1e-9;

/// Relative triangle area below which three points count as collinear.
pub const COLLINEAR_TOL: f64 = 1e-9;

/// Largest design-matrix entry handed to the SVD.
///
/// Squared column norms of `A` must stay finite or the decomposition does not
/// converge; entries beyond this bound are rejected as invalid input.
pub const MAX_DESIGN_ENTRY: f64 = 1e100;

/// Estimation options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateParams {
    /// Apply Hartley normalization to both point sets before building `A`.
    pub normalize: bool,
    /// Return the `h22 == 1` representative instead of the unit-norm one.
    pub rescale: bool,
}

/// Diagnostics of a DLT solve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HomographyQuality {
    pub num_points: usize,
    /// Singular values of the solved design matrix, largest and two smallest.
    pub singular_max: f64,
    pub singular_second_min: f64,
    pub singular_min: f64,
    /// Mean reprojection error of the estimate, if every point maps.
    pub mean_error: Option<f64>,
    pub degenerate: bool,
}

struct DltSolution {
    h: Matrix3<f64>,
    /// Descending.
    singular_values: Vec<f64>,
}

/// Estimate `H` such that `image ~ H * scene` with the plain DLT.
///
/// The returned matrix is the unit-norm null vector of `A` reshaped row-major;
/// no further rescaling is applied.
pub fn estimate_homography(scene: &[Pt2], image: &[Pt2]) -> Result<Homography, HomographyError> {
    estimate_homography_with(scene, image, &EstimateParams::default())
}

/// Estimate `H` with explicit [`EstimateParams`].
pub fn estimate_homography_with(
    scene: &[Pt2],
    image: &[Pt2],
    params: &EstimateParams,
) -> Result<Homography, HomographyError> {
    estimate_homography_with_quality(scene, image, params).map(|(h, _)| h)
}

/// Estimate `H` and report how well-posed the solve was.
///
/// Degenerate configurations (coincident points, three collinear points in a
/// minimal set) still return a finite matrix taken from the smallest singular
/// subspace; they are flagged through [`HomographyQuality::degenerate`].
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(level = "debug", skip_all, fields(n = scene.len()))
)]
pub fn estimate_homography_with_quality(
    scene: &[Pt2],
    image: &[Pt2],
    params: &EstimateParams,
) -> Result<(Homography, HomographyQuality), HomographyError> {
    validate_correspondences(scene, image)?;

    let solution = if params.normalize {
        let (scene_n, t_scene) = normalize_points(scene);
        let (image_n, t_image) = normalize_points(image);
        let mut sol = solve_dlt(&scene_n, &image_n)?;
        // H = T_image^-1 * Hn * T_scene
        let t_image_inv = t_image
            .try_inverse()
            .ok_or(HomographyError::SingularMatrix)?;
        let h = t_image_inv * sol.h * t_scene;
        let norm = h.norm();
        if !norm.is_finite() || !h.iter().all(|v| v.is_finite()) {
            return Err(HomographyError::invalid(
                "coordinates too large to denormalize the estimate",
            ));
        }
        sol.h = if norm > 0.0 { h / norm } else { h };
        sol
    } else {
        solve_dlt(scene, image)?
    };

    let mut homography = Homography::new(solution.h);
    if params.rescale {
        homography = homography.normalized();
    }

    let sv = &solution.singular_values;
    let singular_max = sv[0];
    let singular_min = sv[sv.len() - 1];
    let singular_second_min = sv[sv.len() - 2];

    let rank_deficient = singular_second_min <= DEGENERATE_RANK_TOL * singular_max;
    let collinear = scene.len() == MIN_CORRESPONDENCES
        && (has_collinear_triple(scene) || has_collinear_triple(image));
    let degenerate = rank_deficient || collinear || homography.is_singular();

    let mean_error = calculate_error(scene, image, &homography).ok();

    debug!(
        "dlt: n={} sigma_max={:.3e} sigma_min={:.3e} sigma_2nd={:.3e} degenerate={}",
        scene.len(),
        singular_max,
        singular_min,
        singular_second_min,
        degenerate
    );

    Ok((
        homography,
        HomographyQuality {
            num_points: scene.len(),
            singular_max,
            singular_second_min,
            singular_min,
            mean_error,
            degenerate,
        },
    ))
}

/// Check counts and finiteness of a correspondence set before any numeric work.
pub(crate) fn validate_correspondences(
    scene: &[Pt2],
    image: &[Pt2],
) -> Result<(), HomographyError> {
    if scene.len() != image.len() {
        return Err(HomographyError::invalid(format!(
            "scene/image point counts differ ({} vs {})",
            scene.len(),
            image.len()
        )));
    }
    if scene.len() < MIN_CORRESPONDENCES {
        return Err(HomographyError::invalid(format!(
            "need at least {} point correspondences, got {}",
            MIN_CORRESPONDENCES,
            scene.len()
        )));
    }
    check_finite(scene, "scene")?;
    check_finite(image, "image")
}

pub(crate) fn check_finite(pts: &[Pt2], what: &str) -> Result<(), HomographyError> {
    match pts
        .iter()
        .position(|p| !p.x.is_finite() || !p.y.is_finite())
    {
        Some(i) => Err(HomographyError::invalid(format!(
            "{} point {} is not finite",
            what, i
        ))),
        None => Ok(()),
    }
}

fn solve_dlt(scene: &[Pt2], image: &[Pt2]) -> Result<DltSolution, HomographyError> {
    let n = scene.len();
    // Pad to at least 9 rows: the thin SVD of an 8x9 matrix has no null vector.
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);

    for (k, (s, i)) in scene.iter().zip(image.iter()).enumerate() {
        let (x, y) = (s.x, s.y);
        let (u, v) = (i.x, i.y);

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        a[(r0, 8)] = -u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        a[(r1, 8)] = -v;
    }

    if let Some(bad) = a
        .iter()
        .find(|v| !v.is_finite() || v.abs() > MAX_DESIGN_ENTRY)
    {
        return Err(HomographyError::invalid(format!(
            "coordinates too large for the design matrix (entry {:e})",
            bad
        )));
    }

    let svd = a.svd(false, true);
    let vt = svd
        .v_t
        .ok_or_else(|| HomographyError::invalid("singular value decomposition failed"))?;

    // Singular values are not assumed to be sorted.
    let (idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &s)| {
            if s < best.1 {
                (i, s)
            } else {
                best
            }
        });
    let h: Vec<f64> = vt.row(idx).iter().copied().collect();
    let h = Matrix3::<f64>::from_row_slice(&h);

    let mut singular_values: Vec<f64> = svd.singular_values.iter().copied().collect();
    singular_values.sort_by(|a, b| b.total_cmp(a));

    Ok(DltSolution { h, singular_values })
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };

    Matrix3::<f64>::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Translate to the centroid and scale so the mean distance is sqrt(2).
fn normalize_points(pts: &[Pt2]) -> (Vec<Pt2>, Matrix3<f64>) {
    let n = pts.len() as f64;
    // Divide before summing and use hypot so huge coordinates do not overflow.
    let (cx, cy) = pts
        .iter()
        .fold((0.0, 0.0), |(cx, cy), p| (cx + p.x / n, cy + p.y / n));

    let mean_dist = pts
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy) / n)
        .sum::<f64>();

    let t = hartley_normalization(cx, cy, mean_dist);
    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Pt2::new(v[0], v[1])
        })
        .collect();
    (out, t)
}

fn has_collinear_triple(pts: &[Pt2]) -> bool {
    let n = pts.len() as f64;
    let (sx, sy) = pts.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let extent2 = pts
        .iter()
        .map(|p| (p.x - cx).powi(2) + (p.y - cy).powi(2))
        .fold(0.0, f64::max);
    if extent2 <= 0.0 {
        return true;
    }

    for i in 0..pts.len() {
        for j in i + 1..pts.len() {
            for k in j + 1..pts.len() {
                let (p0, p1, p2) = (pts[i], pts[j], pts[k]);
                let area2 = (p1.x - p0.x) * (p2.y - p0.y) - (p1.y - p0.y) * (p2.x - p0.x);
                if area2.abs() < COLLINEAR_TOL * extent2 {
                    return true;
                }
            }
        }
    }
    false
}

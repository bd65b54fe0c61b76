//! Non-linear refinement of a homography estimate.
//!
//! Minimizes the total squared reprojection error
//! `Σ ‖H * scene[i] - image[i]‖²` over the 9 entries of `H` with the
//! Levenberg–Marquardt solver from the `levenberg_marquardt` crate. The
//! parameter vector is renormalized to unit length whenever the solver sets
//! it, which fixes the free projective scale.

use crate::dlt::{estimate_homography, validate_correspondences};
use crate::homography::divisor_vanishes;
use crate::{Homography, HomographyError, Pt2};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, trace};
use nalgebra::{storage::Owned, DVector, Dyn, OMatrix, SVector, U9};
use serde::{Deserialize, Serialize};

type Params9 = SVector<f64, 9>;
type Jacobian = OMatrix<f64, Dyn, U9>;

/// Refinement options, forwarded to [`LevenbergMarquardt`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineParams {
    /// Solver patience. The solver stops after `max_iters * 10` residual
    /// evaluations; `0` returns the initial estimate untouched.
    pub max_iters: usize,
    /// Relative reduction of the cost below which the solver stops.
    pub ftol: f64,
    /// Relative step length below which the solver stops.
    pub xtol: f64,
    /// Orthogonality between residuals and Jacobian columns below which the
    /// solver stops.
    pub gtol: f64,
    /// Initial step bound factor.
    pub stepbound: f64,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            max_iters: 100,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 0.0,
            stepbound: 100.0,
        }
    }
}

impl RefineParams {
    fn validate(&self) -> Result<(), HomographyError> {
        for (name, v) in [("ftol", self.ftol), ("xtol", self.xtol), ("gtol", self.gtol)] {
            if !v.is_finite() || v < 0.0 {
                return Err(HomographyError::invalid(format!(
                    "{} must be finite and non-negative, got {}",
                    name, v
                )));
            }
        }
        if !self.stepbound.is_finite() || self.stepbound <= 0.0 {
            return Err(HomographyError::invalid(format!(
                "stepbound must be finite and positive, got {}",
                self.stepbound
            )));
        }
        Ok(())
    }
}

/// Outcome of a refinement run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefineReport {
    /// Residual evaluations spent by the solver.
    pub evaluations: usize,
    /// Sum of squared reprojection residuals before and after.
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

struct ReprojectionProblem<'a> {
    scene: &'a [Pt2],
    image: &'a [Pt2],
    h: Params9,
}

impl LeastSquaresProblem<f64, Dyn, U9> for ReprojectionProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U9>;
    type ParameterStorage = Owned<f64, U9>;

    fn set_params(&mut self, x: &Params9) {
        let norm = x.norm();
        self.h = if norm.is_finite() && norm > 0.0 {
            x / norm
        } else {
            *x
        };
    }

    fn params(&self) -> Params9 {
        self.h
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        residuals(self.scene, self.image, &self.h).ok()
    }

    fn jacobian(&self) -> Option<Jacobian> {
        jacobian(self.scene, self.image, &self.h).ok().map(|(jac, _)| jac)
    }
}

/// Refine `initial` by minimizing the squared reprojection error.
///
/// Fails with [`HomographyError::InvalidInput`] on a bad correspondence set or
/// bad solver options, and with [`HomographyError::DegenerateTransform`] if
/// `initial` cannot map every scene point. The result never has a higher cost
/// than `initial`.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(level = "debug", skip_all, fields(n = scene.len()))
)]
pub fn refine_homography(
    scene: &[Pt2],
    image: &[Pt2],
    initial: &Homography,
    params: &RefineParams,
) -> Result<(Homography, RefineReport), HomographyError> {
    validate_correspondences(scene, image)?;
    params.validate()?;

    let mut h0 = Params9::from_row_slice(&initial.to_row_slice());
    let norm = h0.norm();
    if !norm.is_finite() || norm <= 0.0 {
        return Err(HomographyError::SingularMatrix);
    }
    h0 /= norm;

    let initial_cost = cost(scene, image, &h0)?;
    if params.max_iters == 0 || initial_cost == 0.0 {
        return Ok((
            to_homography(&h0),
            RefineReport {
                evaluations: 0,
                initial_cost,
                final_cost: initial_cost,
                converged: initial_cost == 0.0,
            },
        ));
    }

    let solver = LevenbergMarquardt::new()
        .with_ftol(params.ftol)
        .with_xtol(params.xtol)
        .with_gtol(params.gtol)
        .with_stepbound(params.stepbound)
        .with_patience(params.max_iters);

    let problem = ReprojectionProblem { scene, image, h: h0 };
    let (problem, report) = solver.minimize(problem);
    trace!(
        "refine: termination={:?} evaluations={}",
        report.termination,
        report.number_of_evaluations
    );

    let (h, final_cost, converged) = match cost(scene, image, &problem.h) {
        Ok(c) if c <= initial_cost => (problem.h, c, report.termination.was_successful()),
        _ => (h0, initial_cost, false),
    };

    debug!(
        "refine: n={} evaluations={} cost {:.6e} -> {:.6e} converged={}",
        scene.len(),
        report.number_of_evaluations,
        initial_cost,
        final_cost,
        converged
    );

    Ok((
        to_homography(&h),
        RefineReport {
            evaluations: report.number_of_evaluations,
            initial_cost,
            final_cost,
            converged,
        },
    ))
}

/// DLT estimate followed by [`refine_homography`].
pub fn estimate_homography_refined(
    scene: &[Pt2],
    image: &[Pt2],
    params: &RefineParams,
) -> Result<(Homography, RefineReport), HomographyError> {
    let initial = estimate_homography(scene, image)?;
    refine_homography(scene, image, &initial, params)
}

fn to_homography(h: &Params9) -> Homography {
    let mut entries = [0.0; 9];
    entries.copy_from_slice(h.as_slice());
    Homography::from_row_slice(&entries)
}

#[inline]
fn project(h: &Params9, p: &Pt2) -> Result<(f64, f64, f64), HomographyError> {
    let d = h[6] * p.x + h[7] * p.y + h[8];
    let magnitude = (h[6] * p.x).abs() + (h[7] * p.y).abs() + h[8].abs();
    if divisor_vanishes(d, magnitude) {
        return Err(HomographyError::DegenerateTransform { x: p.x, y: p.y, w: d });
    }
    let u = (h[0] * p.x + h[1] * p.y + h[2]) / d;
    let v = (h[3] * p.x + h[4] * p.y + h[5]) / d;
    Ok((u, v, d))
}

fn cost(scene: &[Pt2], image: &[Pt2], h: &Params9) -> Result<f64, HomographyError> {
    Ok(residuals(scene, image, h)?.norm_squared())
}

/// The solver needs at least as many residuals as parameters; a minimal
/// 4-point set is padded with zero rows.
fn residual_rows(n: usize) -> usize {
    (2 * n).max(9)
}

fn residuals(scene: &[Pt2], image: &[Pt2], h: &Params9) -> Result<DVector<f64>, HomographyError> {
    let mut res = DVector::<f64>::zeros(residual_rows(scene.len()));
    for (k, (s, i)) in scene.iter().zip(image.iter()).enumerate() {
        let (u, v, _) = project(h, s)?;
        res[2 * k] = u - i.x;
        res[2 * k + 1] = v - i.y;
    }
    Ok(res)
}

/// Residuals `[u_0 - u'_0, v_0 - v'_0, ...]` and their `2N x 9` Jacobian.
fn jacobian(
    scene: &[Pt2],
    image: &[Pt2],
    h: &Params9,
) -> Result<(Jacobian, DVector<f64>), HomographyError> {
    let rows = residual_rows(scene.len());
    let mut jac = Jacobian::zeros_generic(Dyn(rows), U9);
    let mut res = DVector::<f64>::zeros(rows);

    for (k, (s, i)) in scene.iter().zip(image.iter()).enumerate() {
        let (u, v, d) = project(h, s)?;
        let (x, y) = (s.x, s.y);
        let r0 = 2 * k;
        let r1 = r0 + 1;

        res[r0] = u - i.x;
        res[r1] = v - i.y;

        // u = a / d: du/da = 1/d, du/dd = -u/d
        jac[(r0, 0)] = x / d;
        jac[(r0, 1)] = y / d;
        jac[(r0, 2)] = 1.0 / d;
        jac[(r0, 6)] = -u * x / d;
        jac[(r0, 7)] = -u * y / d;
        jac[(r0, 8)] = -u / d;

        jac[(r1, 3)] = x / d;
        jac[(r1, 4)] = y / d;
        jac[(r1, 5)] = 1.0 / d;
        jac[(r1, 6)] = -v * x / d;
        jac[(r1, 7)] = -v * y / d;
        jac[(r1, 8)] = -v / d;
    }

    Ok((jac, res))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reprojection::{calculate_error, rms_error};
    use nalgebra::Matrix3;

    fn ground_truth() -> Homography {
        Homography::new(Matrix3::new(
            1.1, 0.2, 0.3, //
            -0.1, 0.9, 0.5, //
            0.08, 0.05, 1.0,
        ))
    }

    fn grid() -> Vec<Pt2> {
        (0..4)
            .flat_map(|y| (0..4).map(move |x| Pt2::new(x as f64 * 0.5, y as f64 * 0.5)))
            .collect()
    }

    /// Deterministic pseudo-noise in [-amp, amp].
    fn jitter(pts: &[Pt2], amp: f64) -> Vec<Pt2> {
        pts.iter()
            .enumerate()
            .map(|(k, p)| {
                let t = k as f64 * 1.7 + 0.3;
                Pt2::new(p.x + amp * t.sin(), p.y + amp * (2.3 * t).cos())
            })
            .collect()
    }

    #[test]
    fn analytic_jacobian_matches_central_differences() {
        let scene = grid();
        let image = jitter(&ground_truth().apply_all(&scene).unwrap(), 0.01);
        let h = Params9::from_row_slice(&ground_truth().to_row_slice());
        let (jac, _) = jacobian(&scene, &image, &h).unwrap();

        let eps = 1e-6;
        for j in 0..9 {
            let mut hp = h;
            let mut hm = h;
            hp[j] += eps;
            hm[j] -= eps;
            let (_, rp) = jacobian(&scene, &image, &hp).unwrap();
            let (_, rm) = jacobian(&scene, &image, &hm).unwrap();
            for r in 0..jac.nrows() {
                let numeric = (rp[r] - rm[r]) / (2.0 * eps);
                assert!(
                    (numeric - jac[(r, j)]).abs() < 1e-6,
                    "d r{} / d h{}: analytic {} vs numeric {}",
                    r,
                    j,
                    jac[(r, j)],
                    numeric
                );
            }
        }
    }

    #[test]
    fn refinement_recovers_perturbed_estimate() {
        let scene = grid();
        let image = ground_truth().apply_all(&scene).unwrap();

        let mut perturbed = ground_truth();
        perturbed.h[(0, 1)] += 0.03;
        perturbed.h[(1, 2)] -= 0.02;
        perturbed.h[(2, 0)] += 0.01;
        let before = calculate_error(&scene, &image, &perturbed).unwrap();

        let (refined, report) =
            refine_homography(&scene, &image, &perturbed, &RefineParams::default()).unwrap();
        let after = calculate_error(&scene, &image, &refined).unwrap();

        assert!(before > 1e-3);
        assert!(after < 1e-6, "mean error after refinement: {}", after);
        assert!(report.final_cost < report.initial_cost);
        assert!(report.evaluations > 0);
    }

    #[test]
    fn refinement_never_increases_cost_on_noisy_data() {
        let scene = grid();
        let image = jitter(&ground_truth().apply_all(&scene).unwrap(), 0.02);

        let (refined, report) =
            estimate_homography_refined(&scene, &image, &RefineParams::default()).unwrap();
        let dlt = estimate_homography(&scene, &image).unwrap();

        assert!(report.final_cost <= report.initial_cost);
        assert!(
            rms_error(&scene, &image, &refined).unwrap()
                <= rms_error(&scene, &image, &dlt).unwrap() + 1e-12
        );
        assert!((refined.h.norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_iteration_budget_returns_initial() {
        let scene = grid();
        let image = jitter(&ground_truth().apply_all(&scene).unwrap(), 0.02);
        let params = RefineParams {
            max_iters: 0,
            ..RefineParams::default()
        };
        let (refined, report) =
            refine_homography(&scene, &image, &ground_truth(), &params).unwrap();
        assert_eq!(report.evaluations, 0);
        assert_eq!(report.initial_cost, report.final_cost);
        let p = Pt2::new(0.7, 1.1);
        let a = refined.apply(p).unwrap();
        let b = ground_truth().apply(p).unwrap();
        assert!((a - b).norm() < 1e-12);
    }

    #[test]
    fn degenerate_initial_estimate_is_reported() {
        let scene = grid();
        let image = scene.clone();
        // Divisor x - 0.5 vanishes on grid column x = 0.5.
        let bad = Homography::from_array([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, -0.5]]);
        let err = refine_homography(&scene, &image, &bad, &RefineParams::default()).unwrap_err();
        assert!(matches!(err, HomographyError::DegenerateTransform { .. }));
    }

    #[test]
    fn invalid_correspondences_are_rejected() {
        let scene = grid();
        let err = refine_homography(
            &scene[..3],
            &scene[..3],
            &Homography::identity(),
            &RefineParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, HomographyError::InvalidInput { .. }));
    }

    #[test]
    fn minimal_four_point_set_refines() {
        let scene = [
            Pt2::new(0.0, 0.0),
            Pt2::new(1.5, 0.0),
            Pt2::new(1.5, 1.0),
            Pt2::new(0.0, 1.0),
        ];
        let image = ground_truth().apply_all(&scene).unwrap();
        let mut start = ground_truth();
        start.h[(0, 2)] += 0.05;

        let (refined, report) =
            refine_homography(&scene, &image, &start, &RefineParams::default()).unwrap();
        assert!(report.final_cost < 1e-12, "final cost {}", report.final_cost);
        assert!((refined.h.norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn solver_parameters_are_renormalized() {
        let scene = grid();
        let image = ground_truth().apply_all(&scene).unwrap();
        let mut problem = ReprojectionProblem {
            scene: &scene,
            image: &image,
            h: Params9::zeros(),
        };
        let h = Params9::from_row_slice(&ground_truth().to_row_slice());
        problem.set_params(&(h * 7.5));
        assert!((problem.params().norm() - 1.0).abs() < 1e-12);
        let res = problem.residuals().unwrap();
        assert!(res.norm() < 1e-9);
    }

    #[test]
    fn bad_solver_options_are_invalid_input() {
        let scene = grid();
        let image = ground_truth().apply_all(&scene).unwrap();
        for params in [
            RefineParams {
                stepbound: 0.0,
                ..RefineParams::default()
            },
            RefineParams {
                ftol: -1.0,
                ..RefineParams::default()
            },
            RefineParams {
                gtol: f64::NAN,
                ..RefineParams::default()
            },
        ] {
            let err = refine_homography(&scene, &image, &ground_truth(), &params).unwrap_err();
            assert!(matches!(err, HomographyError::InvalidInput { .. }));
        }
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let p: RefineParams = serde_json::from_str(r#"{ "max_iters": 5 }"#).unwrap();
        assert_eq!(p.max_iters, 5);
        assert_eq!(p.stepbound, RefineParams::default().stepbound);
        assert_eq!(p.ftol, RefineParams::default().ftol);
    }
}

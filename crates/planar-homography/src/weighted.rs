//! Homography from a scored, unpaired set of points.
//!
//! When the pairing between scene and image points is not known, a score
//! matrix with one row per scene point and one column per image point ranks
//! every candidate pairing. Each scene point is paired with its highest
//! scoring image point and the pairs are handed to the refined estimator.

use crate::refine::{estimate_homography_refined, RefineParams, RefineReport};
use crate::{Homography, HomographyError, Pt2};
use log::debug;
use nalgebra::DMatrix;

/// Index of the best scoring image point for every scene point.
///
/// Ties go to the lowest column index. `scores` must be finite and have at
/// least one column.
pub fn best_matches(scores: &DMatrix<f64>) -> Result<Vec<usize>, HomographyError> {
    if scores.ncols() == 0 {
        return Err(HomographyError::invalid("score matrix has no columns"));
    }
    if let Some(i) = scores.iter().position(|v| !v.is_finite()) {
        return Err(HomographyError::invalid(format!(
            "score ({}, {}) is not finite",
            i % scores.nrows(),
            i / scores.nrows()
        )));
    }

    Ok(scores
        .row_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (j, &s)| {
                    if s > best.1 {
                        (j, s)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect())
}

/// Estimate `H` after pairing each scene point with its best scoring image
/// point.
///
/// `scores` must be `scene.len() x image.len()`; any other shape is
/// [`HomographyError::InvalidInput`]. Several scene points may select the same
/// image point.
pub fn estimate_homography_weighted(
    scene: &[Pt2],
    image: &[Pt2],
    scores: &DMatrix<f64>,
    params: &RefineParams,
) -> Result<(Homography, RefineReport), HomographyError> {
    if scores.nrows() != scene.len() || scores.ncols() != image.len() {
        return Err(HomographyError::invalid(format!(
            "score matrix is {}x{}, expected {}x{}",
            scores.nrows(),
            scores.ncols(),
            scene.len(),
            image.len()
        )));
    }

    let matches = best_matches(scores)?;
    let paired: Vec<Pt2> = matches.iter().map(|&j| image[j]).collect();
    debug!("weighted: paired {} scene points", matches.len());

    estimate_homography_refined(scene, &paired, params)
}

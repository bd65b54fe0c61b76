//! Reprojection error of a homography over a correspondence set.

use crate::{Homography, HomographyError, Pt2};

fn check_pairs(scene: &[Pt2], image: &[Pt2]) -> Result<(), HomographyError> {
    if scene.len() != image.len() {
        return Err(HomographyError::invalid(format!(
            "scene/image point counts differ ({} vs {})",
            scene.len(),
            image.len()
        )));
    }
    if scene.is_empty() {
        return Err(HomographyError::invalid("no correspondences"));
    }
    crate::dlt::check_finite(image, "image")
}

/// Euclidean distance between `H * scene[i]` and `image[i]` for every `i`.
pub fn reprojection_errors(
    scene: &[Pt2],
    image: &[Pt2],
    h: &Homography,
) -> Result<Vec<f64>, HomographyError> {
    check_pairs(scene, image)?;
    scene
        .iter()
        .zip(image.iter())
        .map(|(&s, i)| h.apply(s).map(|p| (p - i).norm()))
        .collect()
}

/// Mean reprojection error, in image units.
///
/// Fails on mismatched or empty input and propagates the first
/// [`HomographyError::DegenerateTransform`] instead of summing it.
pub fn calculate_error(
    scene: &[Pt2],
    image: &[Pt2],
    h: &Homography,
) -> Result<f64, HomographyError> {
    let errors = reprojection_errors(scene, image, h)?;
    Ok(errors.iter().sum::<f64>() / errors.len() as f64)
}

/// Root-mean-square reprojection error, in image units.
pub fn rms_error(scene: &[Pt2], image: &[Pt2], h: &Homography) -> Result<f64, HomographyError> {
    let errors = reprojection_errors(scene, image, h)?;
    let sq = errors.iter().map(|e| e * e).sum::<f64>();
    Ok((sq / errors.len() as f64).sqrt())
}

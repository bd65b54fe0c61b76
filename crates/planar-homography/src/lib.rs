//! Planar homography estimation.
//!
//! Given `N >= 4` correspondences between points on a scene plane and their
//! image, [`estimate_homography`] computes the 3x3 projective transform
//! `image ~ H * scene` with the Direct Linear Transform. The crate also maps
//! points in both directions and measures the reprojection error of an
//! estimate. Everything here is a pure function of its arguments.
//!
//! ```
//! use planar_homography::{calculate_error, estimate_homography, transform_scene_to_image, Pt2};
//!
//! let scene = [
//!     Pt2::new(0.0, 0.0),
//!     Pt2::new(1.0, 0.0),
//!     Pt2::new(1.0, 1.0),
//!     Pt2::new(0.0, 1.0),
//!     Pt2::new(0.5, 0.5),
//! ];
//! let image = scene.map(|p| Pt2::new(100.0 * p.x + 100.0, 100.0 * p.y + 100.0));
//!
//! let h = estimate_homography(&scene, &image)?;
//! let center = transform_scene_to_image(Pt2::new(0.5, 0.5), &h)?;
//! assert!((center.x - 150.0).abs() < 1e-6 && (center.y - 150.0).abs() < 1e-6);
//! assert!(calculate_error(&scene, &image, &h)? < 1e-6);
//! # Ok::<(), planar_homography::HomographyError>(())
//! ```

mod dlt;
mod error;
mod homography;
mod logger;
mod refine;
mod reprojection;
mod weighted;

pub use dlt::{
    estimate_homography, estimate_homography_with, estimate_homography_with_quality,
    EstimateParams, HomographyQuality, COLLINEAR_TOL, DEGENERATE_RANK_TOL, MAX_DESIGN_ENTRY,
    MIN_CORRESPONDENCES,
};
pub use error::HomographyError;
pub use homography::{
    transform_image_to_scene, transform_scene_to_image, Homography, Pt2, DIVISOR_EPS,
    SINGULAR_EPS,
};
pub use refine::{estimate_homography_refined, refine_homography, RefineParams, RefineReport};
pub use reprojection::{calculate_error, reprojection_errors, rms_error};
pub use weighted::{best_matches, estimate_homography_weighted};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_from_env, init_with_level, LOG_ENV};

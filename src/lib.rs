// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! This library builds a single mosaic out of an unordered set of overlapping photographs,
//! based on OpenCV <https://crates.io/crates/opencv>.
//!
//! The images are kept in a queue. The two images at the front are registered with ORB
//! keypoints, a Hamming distance ratio test and a RANSAC homography, the first one is
//! warped into the frame of the second one and the composite is pushed back to the front
//! of the queue. This repeats until a single image remains.
//!
//! Read more about feature based image stitching with OpenCV here:
//! <https://docs.opencv.org/4.x/d1/de0/tutorial_py_feature_homography.html>

pub mod features;
pub mod homography;
pub mod pipeline;
pub mod utils;
pub mod warp;

pub use opencv;
use opencv::core::Mat;
use opencv::calib3d;
use std::path::PathBuf;
use thiserror::Error;

pub use features::{FeatureExtractor, FeatureMatcher, Features};
pub use homography::{Homography, HomographyEstimator, Registration};
pub use pipeline::{PipelineState, QueueItem, StitchEvent, StitchPipeline, StitchQueue};
pub use warp::{Canvas, CanvasLimits, CanvasPlan, Composite, Warper};

#[derive(Error, Debug)]
pub enum StitchError {
    #[error(transparent)]
    OpenCvError(#[from] opencv::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid path encoding {0}")]
    InvalidPathEncoding(PathBuf),
    #[error("Invalid parameter(s) {0}")]
    InvalidParams(String),
    #[error("Internal error {0}")]
    ProcessingError(String),
    #[error("At least 2 images are required for stitching, found {found}")]
    InsufficientImages { found: usize },
    #[error("No features detected in one or both images")]
    NoFeaturesDetected,
    #[error("Not enough matches: found {found}, required {required}")]
    InsufficientMatches { found: usize, required: usize },
    #[error("No homography found: {0}")]
    HomographyEstimationFailed(String),
    #[error("Output canvas too large ({width}x{height})")]
    CanvasSizeExceeded { width: i64, height: i64 },
    #[error("No forward progress after {attempts} failed attempts, remaining images: {remaining:?}")]
    NoForwardProgress {
        attempts: usize,
        remaining: Vec<String>,
    },
    #[error("Stitching was cancelled")]
    Cancelled,
}

impl StitchError {
    /// Returns true for the errors that only disqualify the current image pair.
    /// The pipeline recovers from these and keeps on reducing the queue.
    pub fn is_pair_failure(&self) -> bool {
        matches!(
            self,
            StitchError::NoFeaturesDetected
                | StitchError::InsufficientMatches { .. }
                | StitchError::HomographyEstimationFailed(_)
                | StitchError::CanvasSizeExceeded { .. }
        )
    }
}

/// Parameters for the ORB keypoint detector.
#[derive(Debug, Clone, Copy)]
pub struct FeatureParameters {
    /// Maximum number of keypoints retained per image.
    pub max_features: i32,

    /// Pyramid decimation ratio, must be greater than 1.0.
    pub scale_factor: f32,

    /// Number of pyramid levels.
    pub n_levels: i32,

    /// FAST threshold used by the ORB corner detector.
    pub fast_threshold: i32,
}

impl Default for FeatureParameters {
    fn default() -> Self {
        Self {
            max_features: 5000,
            scale_factor: 1.2,
            n_levels: 8,
            fast_threshold: 20,
        }
    }
}

impl FeatureParameters {
    pub fn validate(&self) -> Result<(), StitchError> {
        if self.max_features <= 0 {
            return Err(StitchError::InvalidParams(format!(
                "max_features must be positive, was {}",
                self.max_features
            )));
        }
        if !(self.scale_factor > 1.0) {
            return Err(StitchError::InvalidParams(format!(
                "scale_factor must be greater than 1.0, was {}",
                self.scale_factor
            )));
        }
        if self.n_levels < 1 {
            return Err(StitchError::InvalidParams(format!(
                "n_levels must be at least 1, was {}",
                self.n_levels
            )));
        }
        Ok(())
    }
}

/// Parameters for descriptor matching.
#[derive(Debug, Clone, Copy)]
pub struct MatchParameters {
    /// Lowe’s ratio test threshold: the best match is kept only if its distance is
    /// less than `match_ratio` times the distance of the second best match.
    /// Common values range from 0.6 to 0.7.
    pub match_ratio: f32,

    /// Ratio of best matches to keep after sorting by distance.
    /// 1.0 keeps every match that passed the ratio test.
    pub match_keep_ratio: f32,
}

impl Default for MatchParameters {
    fn default() -> Self {
        Self {
            match_ratio: 0.6,
            match_keep_ratio: 1.0,
        }
    }
}

impl MatchParameters {
    pub fn validate(&self) -> Result<(), StitchError> {
        if !(self.match_ratio > 0.0 && self.match_ratio <= 1.0) {
            return Err(StitchError::InvalidParams(format!(
                "match_ratio must be in (0, 1], was {}",
                self.match_ratio
            )));
        }
        if !(self.match_keep_ratio > 0.0 && self.match_keep_ratio <= 1.0) {
            return Err(StitchError::InvalidParams(format!(
                "match_keep_ratio must be in (0, 1], was {}",
                self.match_keep_ratio
            )));
        }
        Ok(())
    }
}

/// Parameters for the robust homography estimation.
#[derive(Debug, Clone, Copy)]
pub struct HomographyParameters {
    /// Method used in `opencv::calib3d::find_homography()`, typically `opencv::calib3d::RANSAC`.
    pub method: i32,

    /// Reprojection threshold (in pixels) for RANSAC in `find_homography()`.
    /// A lower value makes RANSAC stricter (fewer matches kept), while a higher value is more lenient.
    pub ransac_reproj_threshold: f64,

    /// Estimation is not attempted with fewer accepted matches than this. At least 4.
    pub min_matches: usize,

    /// A homography supported by fewer inliers than this is rejected.
    pub min_inliers: usize,

    /// Largest accepted area scale factor of the homography (and smallest accepted is its inverse).
    pub max_distortion: f64,
}

impl Default for HomographyParameters {
    fn default() -> Self {
        Self {
            method: calib3d::RANSAC,
            ransac_reproj_threshold: 5.0,
            min_matches: 5,
            min_inliers: 4,
            max_distortion: 10.0,
        }
    }
}

impl HomographyParameters {
    pub fn validate(&self) -> Result<(), StitchError> {
        if self.min_matches < 4 {
            return Err(StitchError::InvalidParams(format!(
                "min_matches must be at least 4, was {}",
                self.min_matches
            )));
        }
        if self.min_inliers < 4 {
            return Err(StitchError::InvalidParams(format!(
                "min_inliers must be at least 4, was {}",
                self.min_inliers
            )));
        }
        if !(self.ransac_reproj_threshold > 0.0) {
            return Err(StitchError::InvalidParams(format!(
                "ransac_reproj_threshold must be positive, was {}",
                self.ransac_reproj_threshold
            )));
        }
        if !(self.max_distortion >= 1.0) {
            return Err(StitchError::InvalidParams(format!(
                "max_distortion must be at least 1.0, was {}",
                self.max_distortion
            )));
        }
        Ok(())
    }
}

/// All the tunables of a stitching job.
#[derive(Debug, Clone, Copy, Default)]
pub struct StitchParameters {
    pub features: FeatureParameters,
    pub matching: MatchParameters,
    pub homography: HomographyParameters,
    pub canvas: CanvasLimits,
}

impl StitchParameters {
    pub fn validate(&self) -> Result<(), StitchError> {
        self.features.validate()?;
        self.matching.validate()?;
        self.homography.validate()?;
        self.canvas.validate()
    }
}

/// Parameters used when reading images from disk.
#[derive(Debug, Clone, Copy)]
pub struct LoadParameters {
    /// Images with a side longer than this are scaled down (keeping the aspect ratio)
    /// when loaded. `None` keeps the full resolution.
    pub max_size: Option<i32>,
}

impl Default for LoadParameters {
    fn default() -> Self {
        Self {
            max_size: Some(2000),
        }
    }
}

/// Loads the images in the given order and stitches them into a single mosaic.
///
/// # Parameters
/// - `files`: An iterator of paths to image files (any type implementing `AsRef<Path>`).
///   The order of the files is the merge order.
/// - `load`: How the images are read, see [`LoadParameters`]
/// - `params`: Detector, matcher, RANSAC and canvas size settings, see [`StitchParameters`]
///
/// # Returns
/// - `Ok(Mat)`: the mosaic as a `CV_8UC3` BGR image
/// - `Err(StitchError)` on failure cases:
///   - Fewer than two readable images (`InsufficientImages`)
///   - No pair in the queue could be merged (`NoForwardProgress`)
///   - Image loading/processing failures
///
/// ```rust,no_run
/// # use libstitcher::prelude::*;
/// # fn f() -> Result<(),StitchError> {
/// let mosaic = stitch_images(
///     ["1.jpg", "2.jpg", "3.jpg"],
///     LoadParameters::default(),
///     StitchParameters::default(),
/// )?;
/// libstitcher::utils::imwrite("mosaic.jpg", &mosaic)?;
/// # Ok(())}
/// ```
pub fn stitch_images<I, P>(
    files: I,
    load: LoadParameters,
    params: StitchParameters,
) -> Result<Mat, StitchError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<std::path::Path>,
{
    let files: Vec<PathBuf> = files
        .into_iter()
        .map(|p| p.as_ref().to_path_buf())
        .collect();
    let images = utils::load_images(&files, load)?;
    let mut pipeline = StitchPipeline::new(images, params)?;
    pipeline.run()
}

/// Stitches every jpg, jpeg, tif and png file of a directory, in file name order.
pub fn stitch_directory<P: AsRef<std::path::Path>>(
    dir: P,
    load: LoadParameters,
    params: StitchParameters,
) -> Result<Mat, StitchError> {
    let files = utils::collect_image_files(dir.as_ref())?;
    log::info!(
        "Found {} image files in {}",
        files.len(),
        dir.as_ref().display()
    );
    stitch_images(files, load, params)
}

pub mod prelude {
    pub use super::{
        CanvasLimits, FeatureParameters, HomographyParameters, LoadParameters, MatchParameters,
        PipelineState, StitchError, StitchEvent, StitchParameters, StitchPipeline,
        stitch_directory, stitch_images,
    };
}

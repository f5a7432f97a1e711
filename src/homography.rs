// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Projective transforms between image planes and their robust estimation.

use super::{HomographyParameters, StitchError};
use crate::features::Features;
use crate::utils::{MatExt, SetMValue};
use opencv::calib3d;
use opencv::core::{self, DMatch, Mat, Point2d, Point2f, Vector};
use opencv::prelude::*;

/// Below this the homogeneous coordinate is treated as the line at infinity.
const W_EPSILON: f64 = 1e-9;

/// A 3×3 projective transform, `h * [x, y, 1]^T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    m: [[f64; 3]; 3],
}

impl Homography {
    pub const IDENTITY: Homography = Homography {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    pub fn from_rows(m: [[f64; 3]; 3]) -> Self {
        Self { m }
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self::from_rows([[1.0, 0.0, dx], [0.0, 1.0, dy], [0.0, 0.0, 1.0]])
    }

    pub fn scaling(s: f64) -> Self {
        Self::from_rows([[s, 0.0, 0.0], [0.0, s, 0.0], [0.0, 0.0, 1.0]])
    }

    pub fn rows(&self) -> [[f64; 3]; 3] {
        self.m
    }

    /// Reads a 3×3 matrix of any float depth, as returned by `find_homography()`.
    pub fn from_mat(mat: &Mat) -> Result<Self, StitchError> {
        if mat.empty() || mat.rows() != 3 || mat.cols() != 3 {
            return Err(StitchError::HomographyEstimationFailed(format!(
                "expected a 3x3 matrix, got {}x{}",
                mat.rows(),
                mat.cols()
            )));
        }
        let mat = mat.convert(core::CV_64F, 1.0, 0.0)?;
        let mut m = [[0.0; 3]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = *mat.at_2d::<f64>(r as i32, c as i32)?;
            }
        }
        Ok(Self { m })
    }

    /// Returns the transform as a `CV_64FC1` Mat, ready for `warp_perspective()`.
    pub fn to_mat(&self) -> Result<Mat, StitchError> {
        let mut mat = Mat::new_rows_cols_with_default(3, 3, core::CV_64FC1, core::Scalar::all(0.0))?;
        for (r, row) in self.m.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                mat.set_2d::<f64>(r as i32, c as i32, *v)?;
            }
        }
        Ok(mat)
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.m;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Matrix product `self * other`: `other` is applied first.
    pub fn compose(&self, other: &Homography) -> Homography {
        let mut m = [[0.0; 3]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = (0..3).map(|k| self.m[r][k] * other.m[k][c]).sum();
            }
        }
        Homography { m }
    }

    /// Scales the matrix so that `h33 == 1`, `None` when `h33` is (close to) zero.
    pub fn normalized(&self) -> Option<Homography> {
        let h33 = self.m[2][2];
        if h33.abs() < W_EPSILON || !h33.is_finite() {
            return None;
        }
        let mut m = self.m;
        m.iter_mut().flatten().for_each(|v| *v /= h33);
        Some(Homography { m })
    }

    /// Maps a point, `None` if it lands on or behind the line at infinity.
    pub fn project(&self, p: Point2d) -> Option<Point2d> {
        let m = &self.m;
        let w = m[2][0] * p.x + m[2][1] * p.y + m[2][2];
        if w <= W_EPSILON || !w.is_finite() {
            return None;
        }
        let x = (m[0][0] * p.x + m[0][1] * p.y + m[0][2]) / w;
        let y = (m[1][0] * p.x + m[1][1] * p.y + m[1][2]) / w;
        (x.is_finite() && y.is_finite()).then(|| Point2d::new(x, y))
    }

    /// The same transform expressed for both images scaled by `s`: `S * H * S^-1`.
    pub fn rescaled(&self, s: f64) -> Homography {
        Homography::scaling(s)
            .compose(self)
            .compose(&Homography::scaling(1.0 / s))
    }
}

/// The outcome of a successful estimation.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    /// Maps points of the source image into the destination image.
    pub homography: Homography,
    /// Number of correspondences handed to RANSAC.
    pub matches: usize,
    /// Number of correspondences within the reprojection threshold.
    pub inliers: usize,
}

/// RANSAC homography fitting on matched keypoints.
#[derive(Debug, Clone, Copy)]
pub struct HomographyEstimator {
    params: HomographyParameters,
}

impl HomographyEstimator {
    pub fn new(params: HomographyParameters) -> Self {
        Self { params }
    }

    /// Estimates the homography mapping `src` keypoints onto `dst` keypoints.
    /// `query_idx` of every match indexes `src`, `train_idx` indexes `dst`.
    pub fn estimate(
        &self,
        src: &Features,
        dst: &Features,
        matches: &[DMatch],
    ) -> Result<Registration, StitchError> {
        if matches.len() < self.params.min_matches {
            return Err(StitchError::InsufficientMatches {
                found: matches.len(),
                required: self.params.min_matches,
            });
        }
        let mut src_pts = Vec::with_capacity(matches.len());
        let mut dst_pts = Vec::with_capacity(matches.len());
        for m in matches {
            src_pts.push(src.keypoints.get(m.query_idx as usize)?.pt());
            dst_pts.push(dst.keypoints.get(m.train_idx as usize)?.pt());
        }
        self.estimate_from_points(&src_pts, &dst_pts)
    }

    /// Estimates the homography mapping `src_pts[i]` onto `dst_pts[i]`.
    ///
    /// Returns `InsufficientMatches` without attempting anything when there are fewer than
    /// `min_matches` pairs, and `HomographyEstimationFailed` when RANSAC finds no
    /// transform with enough inlier support or the transform is degenerate.
    pub fn estimate_from_points(
        &self,
        src_pts: &[Point2f],
        dst_pts: &[Point2f],
    ) -> Result<Registration, StitchError> {
        if src_pts.len() != dst_pts.len() {
            return Err(StitchError::InvalidParams(format!(
                "point count mismatch: {} vs {}",
                src_pts.len(),
                dst_pts.len()
            )));
        }
        if src_pts.len() < self.params.min_matches {
            return Err(StitchError::InsufficientMatches {
                found: src_pts.len(),
                required: self.params.min_matches,
            });
        }

        let src = Vector::<Point2f>::from_slice(src_pts);
        let dst = Vector::<Point2f>::from_slice(dst_pts);
        let mut mask = Mat::default();
        let h = match calib3d::find_homography(
            &src,
            &dst,
            &mut mask,
            self.params.method,
            self.params.ransac_reproj_threshold,
        ) {
            Ok(h) => h,
            Err(e) => return Err(StitchError::HomographyEstimationFailed(e.message)),
        };
        if h.empty() {
            return Err(StitchError::HomographyEstimationFailed(
                "no consensus among the matches".to_string(),
            ));
        }

        let inliers = if mask.empty() {
            0
        } else {
            core::count_non_zero(&mask)? as usize
        };
        if inliers < self.params.min_inliers {
            return Err(StitchError::HomographyEstimationFailed(format!(
                "only {inliers} inliers, {} required",
                self.params.min_inliers
            )));
        }

        let homography = Homography::from_mat(&h)?;
        self.check_distortion(&homography)?;
        log::debug!(
            "Homography supported by {inliers} of {} matches",
            src_pts.len()
        );
        Ok(Registration {
            homography,
            matches: src_pts.len(),
            inliers,
        })
    }

    /// Rejects singular transforms and transforms that shrink or blow up areas by more
    /// than `max_distortion`.
    pub fn check_distortion(&self, h: &Homography) -> Result<(), StitchError> {
        let normalized = h.normalized().ok_or_else(|| {
            StitchError::HomographyEstimationFailed("h33 is zero".to_string())
        })?;
        let det = normalized.determinant();
        if !det.is_finite() || det.abs() < 1e-6 {
            return Err(StitchError::HomographyEstimationFailed(format!(
                "degenerate homography, determinant {det:e}"
            )));
        }
        let limit = self.params.max_distortion;
        if det.abs() > limit || det.abs() < 1.0 / limit {
            return Err(StitchError::HomographyEstimationFailed(format!(
                "extreme scaling, determinant {det:.3} outside {:.3}..{limit:.3}",
                1.0 / limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &Homography, b: &Homography, eps: f64) {
        for (ra, rb) in a.rows().iter().zip(b.rows().iter()) {
            for (va, vb) in ra.iter().zip(rb.iter()) {
                assert!((va - vb).abs() < eps, "{a:?} != {b:?}");
            }
        }
    }

    fn grid(n: usize, spacing: f32) -> Vec<Point2f> {
        (0..n * n)
            .map(|i| {
                Point2f::new(
                    20.0 + (i % n) as f32 * spacing,
                    15.0 + (i / n) as f32 * spacing,
                )
            })
            .collect()
    }

    fn project_all(h: &Homography, pts: &[Point2f]) -> Vec<Point2f> {
        pts.iter()
            .filter_map(|p| h.project(Point2d::new(p.x as f64, p.y as f64)))
            .map(|p| Point2f::new(p.x as f32, p.y as f32))
            .collect()
    }

    #[test]
    fn compose_applies_the_right_operand_first() {
        let s = Homography::scaling(2.0);
        let t = Homography::translation(10.0, -4.0);
        // scale, then translate
        let p = t.compose(&s).project(Point2d::new(3.0, 5.0)).unwrap();
        assert_eq!(p, Point2d::new(16.0, 6.0));
        // translate, then scale
        let p = s.compose(&t).project(Point2d::new(3.0, 5.0)).unwrap();
        assert_eq!(p, Point2d::new(26.0, 2.0));
        assert_close(
            &Homography::scaling(0.5).compose(&s),
            &Homography::IDENTITY,
            1e-12,
        );
    }

    #[test]
    fn translation_moves_points() {
        let t = Homography::translation(5.0, -3.0);
        let p = t.project(Point2d::new(1.0, 1.0)).unwrap();
        assert_eq!(p, Point2d::new(6.0, -2.0));
        assert_eq!(
            Homography::translation(2.0, 3.0).compose(&Homography::translation(-2.0, -3.0)),
            Homography::IDENTITY
        );
    }

    #[test]
    fn points_behind_the_horizon_do_not_project() {
        let h = Homography::from_rows([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [-0.01, 0.0, 1.0]]);
        assert!(h.project(Point2d::new(50.0, 0.0)).is_some());
        assert!(h.project(Point2d::new(100.0, 0.0)).is_none());
        assert!(h.project(Point2d::new(150.0, 0.0)).is_none());
    }

    #[test]
    fn rescaled_homography_commutes_with_scaling() {
        let h = Homography::from_rows([[1.02, 0.01, 40.0], [0.0, 0.98, 7.0], [1e-5, 0.0, 1.0]]);
        let s = 0.25;
        let p = Point2d::new(120.0, 80.0);
        let full = h.project(p).unwrap();
        let small = h.rescaled(s).project(Point2d::new(p.x * s, p.y * s)).unwrap();
        assert!((small.x - full.x * s).abs() < 1e-9);
        assert!((small.y - full.y * s).abs() < 1e-9);
    }

    #[test]
    fn mat_round_trip_keeps_values() -> Result<(), StitchError> {
        let h = Homography::from_rows([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.5]]);
        let mat = h.to_mat()?;
        assert_eq!(mat.typ(), core::CV_64FC1);
        assert_eq!(*mat.at_2d::<f64>(2, 2)?, 9.5);
        assert_eq!(Homography::from_mat(&mat)?, h);
        assert!(matches!(
            Homography::from_mat(&Mat::default()),
            Err(StitchError::HomographyEstimationFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn recovers_known_transform_despite_outliers() -> Result<(), StitchError> {
        let truth = Homography::from_rows([[1.0, 0.02, 35.0], [-0.01, 1.0, -8.0], [2e-5, 1e-5, 1.0]]);
        let mut src = grid(6, 40.0);
        let mut dst = project_all(&truth, &src);
        // gross outliers
        for (i, (s, d)) in [((10.0, 10.0), (250.0, 5.0)), ((200.0, 30.0), (3.0, 190.0)), ((90.0, 170.0), (160.0, 2.0))]
            .into_iter()
            .enumerate()
        {
            src.push(Point2f::new(s.0 + i as f32, s.1));
            dst.push(Point2f::new(d.0, d.1));
        }

        let estimator = HomographyEstimator::new(HomographyParameters::default());
        let registration = estimator.estimate_from_points(&src, &dst)?;
        assert_eq!(registration.matches, 39);
        assert!(registration.inliers >= 36, "inliers {}", registration.inliers);
        let estimated = registration.homography.normalized().unwrap();
        let p = estimated.project(Point2d::new(100.0, 100.0)).unwrap();
        let q = truth.project(Point2d::new(100.0, 100.0)).unwrap();
        assert!((p.x - q.x).abs() < 0.5 && (p.y - q.y).abs() < 0.5);
        Ok(())
    }

    #[test]
    fn too_few_matches_are_not_attempted() {
        let src = grid(2, 50.0);
        let estimator = HomographyEstimator::new(HomographyParameters::default());
        assert!(matches!(
            estimator.estimate_from_points(&src, &src),
            Err(StitchError::InsufficientMatches {
                found: 4,
                required: 5
            })
        ));
    }

    #[test]
    fn inconsistent_points_have_no_consensus() {
        let src = grid(4, 60.0);
        // a fixed scramble of the grid, no single homography explains it
        let order = [5, 12, 0, 9, 14, 3, 7, 1, 15, 10, 2, 13, 6, 11, 4, 8];
        let dst: Vec<Point2f> = order
            .iter()
            .map(|&i| Point2f::new(src[i].y * 1.7, 400.0 - src[i].x * 0.6))
            .collect();
        let estimator = HomographyEstimator::new(HomographyParameters {
            min_inliers: 10,
            ..HomographyParameters::default()
        });
        assert!(matches!(
            estimator.estimate_from_points(&src, &dst),
            Err(StitchError::HomographyEstimationFailed(_))
        ));
    }

    #[test]
    fn distortion_check() {
        let estimator = HomographyEstimator::new(HomographyParameters::default());
        assert!(estimator.check_distortion(&Homography::IDENTITY).is_ok());
        assert!(estimator.check_distortion(&Homography::scaling(4.0)).is_err());
        assert!(estimator.check_distortion(&Homography::scaling(0.2)).is_err());
        assert!(estimator
            .check_distortion(&Homography::from_rows([[1.0, 2.0, 0.0], [2.0, 4.0, 0.0], [0.0, 0.0, 1.0]]))
            .is_err());
    }
}

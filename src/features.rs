// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! ORB keypoint extraction and brute force Hamming matching.

use super::{FeatureParameters, MatchParameters, StitchError, utils};
use opencv::core::{self, DMatch, KeyPoint, Mat, Vector};
use opencv::features2d::{self, ORB, ORB_ScoreType};
use opencv::prelude::*;
use ordered_float::OrderedFloat;

/// Keypoints of one image and the binary descriptors computed for them,
/// row `i` of `descriptors` describes `keypoints[i]`.
pub struct Features {
    pub keypoints: Vector<KeyPoint>,
    pub descriptors: Mat,
}

impl Features {
    /// Number of descriptors.
    pub fn len(&self) -> usize {
        if self.descriptors.empty() {
            0
        } else {
            self.descriptors.rows() as usize
        }
    }

    /// Texture-less images produce no descriptors at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Detects ORB keypoints and computes their descriptors.
///
/// The detector is configured once, at construction, and does not carry any state
/// between calls: the same image and parameters always give the same features.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    params: FeatureParameters,
}

impl FeatureExtractor {
    pub fn new(params: FeatureParameters) -> Self {
        Self { params }
    }

    /// Returns the keypoints and descriptors of `img` (grey, BGR or BGRA).
    /// An image without texture is not an error, it just yields empty `Features`.
    pub fn detect_and_compute(&self, img: &Mat) -> Result<Features, StitchError> {
        let grey = utils::to_grey(img)?;
        let mut orb = ORB::create(
            self.params.max_features,
            self.params.scale_factor,
            self.params.n_levels,
            31, // edgeThreshold
            0,  // firstLevel
            2,  // WTA_K
            ORB_ScoreType::HARRIS_SCORE,
            31, // patchSize
            self.params.fast_threshold,
        )?;

        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        orb.detect_and_compute(
            &grey,
            &Mat::default(),
            &mut keypoints,
            &mut descriptors,
            false,
        )?;
        log::debug!("Detected {} ORB keypoints", keypoints.len());
        Ok(Features {
            keypoints,
            descriptors,
        })
    }
}

/// k=2 nearest neighbour matching on Hamming distance, filtered with Lowe's ratio test.
#[derive(Debug, Clone, Copy)]
pub struct FeatureMatcher {
    params: MatchParameters,
}

impl FeatureMatcher {
    pub fn new(params: MatchParameters) -> Self {
        Self { params }
    }

    /// Matches every descriptor of `query` against `train`.
    ///
    /// In the returned matches `query_idx` indexes `query` and `train_idx` indexes `train`.
    /// They are sorted by ascending distance. An empty side gives an empty result.
    pub fn match_features(
        &self,
        query: &Features,
        train: &Features,
    ) -> Result<Vec<DMatch>, StitchError> {
        if query.is_empty() || train.is_empty() {
            return Ok(Vec::new());
        }

        let mut matcher = features2d::BFMatcher::create(core::NORM_HAMMING, false)?; // false for knn_match
        matcher.add(&train.descriptors)?;
        let mut knn_matches = Vector::<Vector<DMatch>>::new();
        matcher.knn_match(
            &query.descriptors, // query descriptors
            &mut knn_matches,   // output matches
            2,                  // k (2 best matches per descriptor)
            &Mat::default(),    // mask (no filtering here)
            false,              // compact_result
        )?;

        let mut accepted = Vec::with_capacity(knn_matches.len());
        for candidates in knn_matches.iter() {
            // a single train descriptor leaves nothing to compare the best match with
            if candidates.len() < 2 {
                continue;
            }
            let best = candidates.get(0)?;
            let second = candidates.get(1)?;
            if best.distance < self.params.match_ratio * second.distance {
                accepted.push(best);
            }
        }

        accepted.sort_by_key(|m| OrderedFloat(m.distance));
        if self.params.match_keep_ratio < 1.0 {
            let num_to_keep =
                (accepted.len() as f32 * self.params.match_keep_ratio).round() as usize;
            accepted.truncate(num_to_keep);
        }
        log::debug!(
            "{} of {} descriptors passed the ratio test",
            accepted.len(),
            knn_matches.len()
        );
        Ok(accepted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use opencv::core::{Scalar, Size};
    use opencv::imgproc;

    /// Deterministic high contrast texture, `seed` picks the pattern.
    pub(crate) fn textured_image(rows: i32, cols: i32, seed: u64) -> Result<Mat, StitchError> {
        core::set_rng_seed(seed as i32)?;
        let mut noise =
            Mat::new_rows_cols_with_default(rows / 4 + 1, cols / 4 + 1, core::CV_8UC1, Scalar::all(0.0))?;
        core::randu(&mut noise, &Scalar::all(0.0), &Scalar::all(255.0))?;
        let mut grey = Mat::default();
        imgproc::resize(
            &noise,
            &mut grey,
            Size::new(cols, rows),
            0.0,
            0.0,
            imgproc::INTER_CUBIC,
        )?;
        utils::ensure_bgr(&grey)
    }

    fn descriptors(rows: &[[u8; 32]]) -> Result<Features, StitchError> {
        Ok(Features {
            keypoints: Vector::new(),
            descriptors: Mat::from_slice_2d(rows)?,
        })
    }

    #[test]
    fn flat_image_has_no_features() -> Result<(), StitchError> {
        let flat = Mat::new_rows_cols_with_default(200, 200, core::CV_8UC3, Scalar::all(128.0))?;
        let features = FeatureExtractor::new(FeatureParameters::default()).detect_and_compute(&flat)?;
        assert!(features.is_empty());
        assert_eq!(features.len(), 0);
        Ok(())
    }

    #[test]
    fn extraction_is_deterministic() -> Result<(), StitchError> {
        let img = textured_image(240, 320, 7)?;
        let extractor = FeatureExtractor::new(FeatureParameters {
            max_features: 500,
            ..FeatureParameters::default()
        });
        let a = extractor.detect_and_compute(&img)?;
        let b = extractor.detect_and_compute(&img)?;
        assert!(!a.is_empty());
        assert!(a.len() <= 500);
        assert_eq!(a.keypoints.len(), a.len());
        assert_eq!(a.len(), b.len());
        assert_eq!(a.descriptors.cols(), 32);
        for (ka, kb) in a.keypoints.iter().zip(b.keypoints.iter()) {
            assert_eq!(ka.pt(), kb.pt());
        }
        Ok(())
    }

    #[test]
    fn ratio_test_rejects_ambiguous_matches() -> Result<(), StitchError> {
        let train = descriptors(&[[0x00; 32], [0xff; 32]])?;
        // row 0 is an exact hit, row 1 is at distance 128 from both train rows
        let query = descriptors(&[[0x00; 32], [0x0f; 32]])?;
        let matches = FeatureMatcher::new(MatchParameters::default()).match_features(&query, &train)?;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].query_idx, 0);
        assert_eq!(matches[0].train_idx, 0);
        assert_eq!(matches[0].distance, 0.0);
        Ok(())
    }

    #[test]
    fn matches_are_sorted_and_truncated() -> Result<(), StitchError> {
        let mut near = [0x00; 32];
        near[0] = 0x01;
        let train = descriptors(&[[0x00; 32], [0xff; 32]])?;
        let query = descriptors(&[near, [0x00; 32], [0xfe; 32]])?;

        let all = FeatureMatcher::new(MatchParameters::default()).match_features(&query, &train)?;
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert_eq!(all[0].query_idx, 1);

        let half = FeatureMatcher::new(MatchParameters {
            match_keep_ratio: 0.34,
            ..MatchParameters::default()
        })
        .match_features(&query, &train)?;
        assert_eq!(half.len(), 1);
        assert_eq!(half[0].query_idx, 1);
        Ok(())
    }

    #[test]
    fn empty_side_gives_no_matches() -> Result<(), StitchError> {
        let empty = Features {
            keypoints: Vector::new(),
            descriptors: Mat::default(),
        };
        let train = descriptors(&[[0x00; 32], [0xff; 32]])?;
        let matcher = FeatureMatcher::new(MatchParameters::default());
        assert!(matcher.match_features(&empty, &train)?.is_empty());
        assert!(matcher.match_features(&train, &empty)?.is_empty());
        Ok(())
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! The reduction loop: merge the two images at the front of the queue until one is left.

use super::{StitchError, StitchParameters, utils};
use crate::features::{FeatureExtractor, FeatureMatcher};
use crate::homography::HomographyEstimator;
use crate::warp::Warper;
use opencv::core::Mat;
use opencv::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An image waiting in the queue, either an input or an intermediate mosaic.
pub struct QueueItem {
    label: String,
    image: Mat,
}

impl QueueItem {
    pub fn new(label: impl Into<String>, image: Mat) -> Self {
        Self {
            label: label.into(),
            image,
        }
    }

    /// File name of an input, or the labels of the merged inputs joined with `+`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn image(&self) -> &Mat {
        &self.image
    }

    pub fn into_image(self) -> Mat {
        self.image
    }
}

/// The pending images, front first. Owned by exactly one pipeline.
#[derive(Default)]
pub struct StitchQueue {
    items: VecDeque<QueueItem>,
}

impl StitchQueue {
    pub fn new(items: impl IntoIterator<Item = QueueItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.items.iter().map(|i| i.label.clone()).collect()
    }

    /// Removes and returns the two front items, `None` (and nothing removed) when there
    /// are fewer than two.
    pub fn pop_pair(&mut self) -> Option<(QueueItem, QueueItem)> {
        if self.items.len() < 2 {
            return None;
        }
        let first = self.items.pop_front()?;
        let second = self.items.pop_front()?;
        Some((first, second))
    }

    pub fn push_front(&mut self, item: QueueItem) {
        self.items.push_front(item);
    }

    /// Puts back a pair that could not be merged: `second` returns to the front and
    /// `first` goes to the back, so the next attempt pairs `second` with a new neighbour.
    pub fn requeue_unmerged(&mut self, first: QueueItem, second: QueueItem) {
        self.items.push_front(second);
        self.items.push_back(first);
    }

    /// Takes the final item, only when exactly one is left.
    pub fn take_last(&mut self) -> Option<QueueItem> {
        if self.items.len() == 1 {
            self.items.pop_front()
        } else {
            None
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Loading,
    Reducing,
    Done,
    Failed,
}

/// Diagnostics recorded while reducing the queue.
#[derive(Debug)]
pub enum StitchEvent {
    PairMerged {
        first: String,
        second: String,
        matches: usize,
        inliers: usize,
        width: i32,
        height: i32,
    },
    /// The pair was put back into the queue unmerged.
    PairSkipped {
        first: String,
        second: String,
        reason: StitchError,
    },
    /// The size guard shrank both images of a pair before composing them.
    CanvasRescaled {
        first: String,
        second: String,
        scale: f64,
    },
    Cancelled {
        remaining: usize,
    },
}

struct Merged {
    image: Mat,
    matches: usize,
    inliers: usize,
    scale: f64,
}

/// Drives the reduction of one stitching job.
///
/// ```rust,no_run
/// # use libstitcher::prelude::*;
/// # use libstitcher::utils;
/// # fn f() -> Result<(),StitchError> {
/// let images = utils::load_images(
///     &utils::collect_image_files(std::path::Path::new("images"))?,
///     LoadParameters::default(),
/// )?;
/// let mut pipeline = StitchPipeline::new(images, StitchParameters::default())?;
/// let mosaic = pipeline.run()?;
/// for event in pipeline.events() {
///     println!("{event:?}");
/// }
/// # Ok(())}
/// ```
pub struct StitchPipeline {
    extractor: FeatureExtractor,
    matcher: FeatureMatcher,
    estimator: HomographyEstimator,
    warper: Warper,
    queue: StitchQueue,
    state: PipelineState,
    failed_attempts: usize,
    events: Vec<StitchEvent>,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl StitchPipeline {
    /// Ingests the images in merge order.
    ///
    /// Empty images are dropped with a warning and the rest converted to 8 bit BGR.
    /// Fewer than two usable images is `StitchError::InsufficientImages`.
    pub fn new(images: Vec<QueueItem>, params: StitchParameters) -> Result<Self, StitchError> {
        params.validate()?;
        let mut usable = Vec::with_capacity(images.len());
        for item in images {
            if item.image.empty() || item.image.rows() <= 0 || item.image.cols() <= 0 {
                log::warn!("Skipping empty image {}", item.label);
                continue;
            }
            let image = utils::ensure_bgr(&item.image)?;
            usable.push(QueueItem::new(item.label, image));
        }
        if usable.len() < 2 {
            return Err(StitchError::InsufficientImages {
                found: usable.len(),
            });
        }

        let mut pipeline = Self {
            extractor: FeatureExtractor::new(params.features),
            matcher: FeatureMatcher::new(params.matching),
            estimator: HomographyEstimator::new(params.homography),
            warper: Warper::new(params.canvas),
            queue: StitchQueue::new(usable),
            state: PipelineState::Loading,
            failed_attempts: 0,
            events: Vec::new(),
            cancel_flag: None,
        };
        log::info!("Processing {} images...", pipeline.queue.len());
        pipeline.state = PipelineState::Reducing;
        Ok(pipeline)
    }

    /// Makes `run()` stop between two reduction steps once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn events(&self) -> &[StitchEvent] {
        &self.events
    }

    pub fn queue(&self) -> &StitchQueue {
        &self.queue
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Reduces the queue until one image is left and returns it.
    ///
    /// The events stay available through [`StitchPipeline::events()`] whatever the outcome.
    pub fn run(&mut self) -> Result<Mat, StitchError> {
        while self.state == PipelineState::Reducing {
            if self.is_cancelled() {
                log::warn!("Stitching cancelled with {} images left", self.queue.len());
                self.events.push(StitchEvent::Cancelled {
                    remaining: self.queue.len(),
                });
                self.state = PipelineState::Failed;
                return Err(StitchError::Cancelled);
            }
            let _ = self.step()?;
        }
        self.take_result()
    }

    /// Runs a single merge attempt on the front pair and returns the new state.
    ///
    /// A pair failure (no features, too few matches, no homography, canvas too large) puts
    /// the pair back with [`StitchQueue::requeue_unmerged()`]. Once as many attempts in a
    /// row have failed as there are images in the queue, the job fails with
    /// `NoForwardProgress`. Any other error fails the job right away.
    pub fn step(&mut self) -> Result<PipelineState, StitchError> {
        if self.state != PipelineState::Reducing {
            return Ok(self.state);
        }
        let Some((first, second)) = self.queue.pop_pair() else {
            self.state = PipelineState::Done;
            return Ok(self.state);
        };

        match self.merge_pair(&first, &second) {
            Ok(merged) => {
                let label = format!("{}+{}", first.label, second.label);
                let size = merged.image.size()?;
                log::info!(
                    "Merged {} and {} into {}x{} ({} matches, {} inliers)",
                    first.label,
                    second.label,
                    size.width,
                    size.height,
                    merged.matches,
                    merged.inliers
                );
                if merged.scale < 1.0 {
                    self.events.push(StitchEvent::CanvasRescaled {
                        first: first.label.clone(),
                        second: second.label.clone(),
                        scale: merged.scale,
                    });
                }
                self.events.push(StitchEvent::PairMerged {
                    first: first.label,
                    second: second.label,
                    matches: merged.matches,
                    inliers: merged.inliers,
                    width: size.width,
                    height: size.height,
                });
                self.queue.push_front(QueueItem::new(label, merged.image));
                self.failed_attempts = 0;
            }
            Err(reason) if reason.is_pair_failure() => {
                log::warn!(
                    "Skipping pair {} and {}: {reason}",
                    first.label,
                    second.label
                );
                self.events.push(StitchEvent::PairSkipped {
                    first: first.label.clone(),
                    second: second.label.clone(),
                    reason,
                });
                self.queue.requeue_unmerged(first, second);
                self.failed_attempts += 1;
                if self.failed_attempts >= self.queue.len() {
                    self.state = PipelineState::Failed;
                    let remaining = self.queue.labels();
                    log::warn!(
                        "No pair of {remaining:?} could be merged after {} attempts",
                        self.failed_attempts
                    );
                    return Err(StitchError::NoForwardProgress {
                        attempts: self.failed_attempts,
                        remaining,
                    });
                }
            }
            Err(e) => {
                self.queue.requeue_unmerged(first, second);
                self.state = PipelineState::Failed;
                return Err(e);
            }
        }

        if self.queue.len() == 1 {
            self.state = PipelineState::Done;
        }
        Ok(self.state)
    }

    /// Registers `first` against `second` and warps `first` into `second`'s frame.
    fn merge_pair(&self, first: &QueueItem, second: &QueueItem) -> Result<Merged, StitchError> {
        let first_features = self.extractor.detect_and_compute(&first.image)?;
        let second_features = self.extractor.detect_and_compute(&second.image)?;
        if first_features.is_empty() || second_features.is_empty() {
            return Err(StitchError::NoFeaturesDetected);
        }

        let matches = self
            .matcher
            .match_features(&first_features, &second_features)?;
        let registration = self
            .estimator
            .estimate(&first_features, &second_features, &matches)?;
        let composite =
            self.warper
                .warp(&second.image, &first.image, &registration.homography)?;
        log::debug!(
            "Canvas for {} and {} was {}x{} before cropping",
            first.label,
            second.label,
            composite.canvas.width,
            composite.canvas.height
        );

        Ok(Merged {
            image: composite.image,
            matches: registration.matches,
            inliers: registration.inliers,
            scale: composite.scale,
        })
    }

    /// Hands over the mosaic once the pipeline is `Done`.
    pub fn take_result(&mut self) -> Result<Mat, StitchError> {
        if self.state != PipelineState::Done {
            return Err(StitchError::ProcessingError(format!(
                "no result available in state {:?}",
                self.state
            )));
        }
        self.queue
            .take_last()
            .map(QueueItem::into_image)
            .ok_or_else(|| StitchError::ProcessingError("Empty result after reduction".to_string()))
    }
}

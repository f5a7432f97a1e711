// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Canvas sizing and compositing of two registered images.

use super::{StitchError, utils};
use crate::homography::Homography;
use opencv::core::{self, Mat, Point2d, Rect, Size};
use opencv::imgproc;
use opencv::prelude::*;
use ordered_float::OrderedFloat;

/// Slack used when rounding projected corners, so that `599.9999999` and
/// `600.0000001` both end up on pixel 600.
const ROUNDING_SLACK: f64 = 1e-6;

/// Hard limits on the size of a composite.
#[derive(Debug, Clone, Copy)]
pub struct CanvasLimits {
    /// Largest accepted width or height. `warp_perspective()` works on `i16` coordinates
    /// (SHRT_MAX = 32767), so this must stay below that.
    pub max_dimension: i64,

    /// Largest accepted number of pixels.
    pub max_area: i64,

    /// A canvas that would have to be scaled down by more than this is rejected instead.
    pub min_scale: f64,
}

impl Default for CanvasLimits {
    fn default() -> Self {
        Self {
            max_dimension: 32_000,
            max_area: 10_000 * 10_000,
            min_scale: 0.05,
        }
    }
}

impl CanvasLimits {
    pub fn validate(&self) -> Result<(), StitchError> {
        if self.max_dimension <= 0 || self.max_dimension >= i16::MAX as i64 {
            return Err(StitchError::InvalidParams(format!(
                "max_dimension must be in 1..{}, was {}",
                i16::MAX,
                self.max_dimension
            )));
        }
        if self.max_area <= 0 {
            return Err(StitchError::InvalidParams(format!(
                "max_area must be positive, was {}",
                self.max_area
            )));
        }
        if !(self.min_scale > 0.0 && self.min_scale <= 1.0) {
            return Err(StitchError::InvalidParams(format!(
                "min_scale must be in (0, 1], was {}",
                self.min_scale
            )));
        }
        Ok(())
    }

    pub fn accepts(&self, canvas: &Canvas) -> bool {
        canvas.width > 0
            && canvas.height > 0
            && canvas.width <= self.max_dimension
            && canvas.height <= self.max_dimension
            && canvas.area() <= self.max_area
    }

    /// The largest factor `<= 1.0` that brings `canvas` within limits, leaving room for
    /// the pixel rounding of the rescaled corners.
    pub fn scale_to_fit(&self, canvas: &Canvas) -> f64 {
        let dim = (self.max_dimension - 2) as f64
            / canvas.width.max(canvas.height).max(1) as f64;
        let area = 0.999 * (self.max_area as f64 / canvas.area().max(1) as f64).sqrt();
        dim.min(area).min(1.0)
    }
}

/// Axis aligned bounding box of the projected corners, in whole pixels.
/// `offset_x`/`offset_y` shift the content so that the box starts at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    pub width: i64,
    pub height: i64,
    pub offset_x: i64,
    pub offset_y: i64,
}

impl Canvas {
    /// The smallest pixel aligned box containing every point, `None` for no points
    /// or non finite coordinates.
    pub fn enclosing<I: IntoIterator<Item = Point2d>>(points: I) -> Option<Canvas> {
        let points: Vec<Point2d> = points.into_iter().collect();
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return None;
        }
        let x_min = points.iter().map(|p| OrderedFloat(p.x)).min()?.0;
        let x_max = points.iter().map(|p| OrderedFloat(p.x)).max()?.0;
        let y_min = points.iter().map(|p| OrderedFloat(p.y)).min()?.0;
        let y_max = points.iter().map(|p| OrderedFloat(p.y)).max()?.0;

        let x_min = (x_min + ROUNDING_SLACK).floor();
        let y_min = (y_min + ROUNDING_SLACK).floor();
        let x_max = (x_max - ROUNDING_SLACK).ceil();
        let y_max = (y_max - ROUNDING_SLACK).ceil();
        // beyond this the canvas is rejected anyway, keep the integer math sane
        let bound = i32::MAX as f64;
        if [x_min, y_min, x_max, y_max].iter().any(|v| v.abs() > bound) {
            return None;
        }
        Some(Canvas {
            width: (x_max - x_min) as i64,
            height: (y_max - y_min) as i64,
            offset_x: -x_min as i64,
            offset_y: -y_min as i64,
        })
    }

    pub fn area(&self) -> i64 {
        self.width.saturating_mul(self.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width as i32, self.height as i32)
    }

    /// Translation moving the canvas content to non-negative coordinates.
    pub fn translation(&self) -> Homography {
        Homography::translation(self.offset_x as f64, self.offset_y as f64)
    }
}

/// The corners of an image, clockwise from the origin.
pub fn corners(size: Size) -> [Point2d; 4] {
    let (w, h) = (size.width as f64, size.height as f64);
    [
        Point2d::new(0.0, 0.0),
        Point2d::new(0.0, h),
        Point2d::new(w, h),
        Point2d::new(w, 0.0),
    ]
}

/// The canvas enclosing image `a` (untransformed) and image `b` mapped by `h`.
pub fn canvas_for(a_size: Size, b_size: Size, h: &Homography) -> Result<Canvas, StitchError> {
    let mut points = corners(a_size).to_vec();
    for corner in corners(b_size) {
        let projected = h.project(corner).ok_or_else(|| {
            StitchError::HomographyEstimationFailed(
                "a corner of the warped image maps to infinity".to_string(),
            )
        })?;
        points.push(projected);
    }
    Canvas::enclosing(points).ok_or(StitchError::CanvasSizeExceeded {
        width: i64::MAX,
        height: i64::MAX,
    })
}

/// How a pair is going to be composed, decided before any pixel is touched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasPlan {
    pub canvas: Canvas,
    /// 1.0 unless the size guard had to shrink both images.
    pub scale: f64,
    /// `h` adjusted to the (possibly) rescaled images.
    pub homography: Homography,
    pub a_size: Size,
    pub b_size: Size,
}

/// Sizes the canvas for `a` and `b` warped by `h`, applying the size guard.
///
/// A canvas over `limits` is retried with both images scaled down by a common factor and
/// `h` rescaled to match. When that factor would be below `limits.min_scale`, or the
/// rescaled canvas still does not fit, the pair is rejected with `CanvasSizeExceeded`.
pub fn plan_canvas(
    a_size: Size,
    b_size: Size,
    h: &Homography,
    limits: &CanvasLimits,
) -> Result<CanvasPlan, StitchError> {
    let canvas = canvas_for(a_size, b_size, h)?;
    if limits.accepts(&canvas) {
        return Ok(CanvasPlan {
            canvas,
            scale: 1.0,
            homography: *h,
            a_size,
            b_size,
        });
    }

    let scale = limits.scale_to_fit(&canvas);
    if scale < limits.min_scale {
        return Err(StitchError::CanvasSizeExceeded {
            width: canvas.width,
            height: canvas.height,
        });
    }
    let scale_size = |s: Size| {
        Size::new(
            ((s.width as f64 * scale).round() as i32).max(1),
            ((s.height as f64 * scale).round() as i32).max(1),
        )
    };
    let (a_scaled, b_scaled) = (scale_size(a_size), scale_size(b_size));
    let homography = h.rescaled(scale);
    let rescaled = canvas_for(a_scaled, b_scaled, &homography)?;
    if !limits.accepts(&rescaled) {
        return Err(StitchError::CanvasSizeExceeded {
            width: rescaled.width,
            height: rescaled.height,
        });
    }
    Ok(CanvasPlan {
        canvas: rescaled,
        scale,
        homography,
        a_size: a_scaled,
        b_size: b_scaled,
    })
}

/// A merged image.
pub struct Composite {
    pub image: Mat,
    /// Scale applied by the size guard, 1.0 when the inputs were used as they were.
    pub scale: f64,
    /// The canvas before cropping.
    pub canvas: Canvas,
}

/// Warps one image into the frame of another and crops the result.
#[derive(Debug, Clone, Copy)]
pub struct Warper {
    limits: CanvasLimits,
}

impl Warper {
    pub fn new(limits: CanvasLimits) -> Self {
        Self { limits }
    }

    /// Composes `a` and `b` where `h` maps `b`'s plane into `a`'s plane.
    ///
    /// `b` is resampled with `warp_perspective()`, `a` is pasted over it at the canvas
    /// offset without any blending. The empty border is cropped away.
    pub fn warp(&self, a: &Mat, b: &Mat, h: &Homography) -> Result<Composite, StitchError> {
        if a.empty() || b.empty() {
            return Err(StitchError::InvalidParams("empty image".to_string()));
        }
        if a.typ() != b.typ() {
            return Err(StitchError::InvalidParams(format!(
                "image types differ: {} vs {}",
                a.typ(),
                b.typ()
            )));
        }
        let plan = plan_canvas(a.size()?, b.size()?, h, &self.limits)?;

        let a_resized;
        let b_resized;
        let (a, b) = if plan.scale < 1.0 {
            log::warn!(
                "Output too large, rescaling by factor {:.3} to {}x{}",
                plan.scale,
                plan.canvas.width,
                plan.canvas.height
            );
            a_resized = utils::resize_to(a, plan.a_size)?;
            b_resized = utils::resize_to(b, plan.b_size)?;
            (&a_resized, &b_resized)
        } else {
            (a, b)
        };

        let warp_matrix = plan.canvas.translation().compose(&plan.homography).to_mat()?;
        let mut canvas_img = Mat::default();
        imgproc::warp_perspective(
            b,
            &mut canvas_img,
            &warp_matrix,
            plan.canvas.size(),
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            core::Scalar::default(),
        )?;

        {
            let a_rect = Rect::new(
                plan.canvas.offset_x as i32,
                plan.canvas.offset_y as i32,
                a.cols(),
                a.rows(),
            );
            let mut roi = Mat::roi_mut(&mut canvas_img, a_rect)?;
            a.copy_to(&mut roi)?;
        }

        Ok(Composite {
            image: crop_to_content(&canvas_img)?,
            scale: plan.scale,
            canvas: plan.canvas,
        })
    }
}

/// Crops away the rows and columns that only hold (near) black pixels.
pub fn crop_to_content(img: &Mat) -> Result<Mat, StitchError> {
    let grey = utils::to_grey(img)?;
    let mut thresh = Mat::default();
    imgproc::threshold(&grey, &mut thresh, 1.0, 255.0, imgproc::THRESH_BINARY)?;
    let rect = imgproc::bounding_rect(&thresh)?;
    if rect.width <= 0 || rect.height <= 0 {
        return Ok(img.try_clone()?);
    }
    Ok(Mat::roi(img, rect)?.try_clone()?)
}

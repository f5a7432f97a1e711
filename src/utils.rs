// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::{LoadParameters, StitchError};
use crate::pipeline::QueueItem;
use opencv::core::{AlgorithmHint, Mat, MatTrait, MatTraitConst, Size, Vector};
use opencv::{imgcodecs, imgproc};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Extension trait for more ergonomic Mat conversions
pub trait MatExt {
    /// Convert matrix to specified type with default scaling
    ///
    /// # Arguments
    /// * `target_type` - OpenCV type constant (e.g., CV_32F, CV_64F)
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StitchError>;
}

impl MatExt for Mat {
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, StitchError> {
        let mut dst = Mat::default();
        self.convert_to(&mut dst, rtype, alpha, beta)?;
        Ok(dst)
    }
}

/// Trait for setting value in a 2d Mat<T>
pub trait SetMValue {
    fn set_2d<T: opencv::prelude::DataType>(
        &mut self,
        row: i32,
        col: i32,
        value: T,
    ) -> Result<(), StitchError>;
}

impl SetMValue for Mat {
    #[inline]
    /// ```
    /// # use libstitcher::{opencv::prelude::*, opencv::prelude::MatTraitConst};
    /// # use libstitcher::utils::SetMValue;
    /// let mut m = opencv::core::Mat::new_rows_cols_with_default(
    ///     1, 3, opencv::core::CV_64FC1, opencv::core::Scalar::all(0.0)).unwrap();
    /// m.set_2d::<f64>(0, 0, -1.0).unwrap();
    /// m.set_2d::<f64>(0, 2, -3.0).unwrap();
    /// assert_eq!(-1.0, *m.at_2d::<f64>(0,0).unwrap());
    /// assert_eq!(0.0, *m.at_2d::<f64>(0,1).unwrap());
    /// assert_eq!(-3.0, *m.at_2d::<f64>(0,2).unwrap());
    /// ```
    fn set_2d<T: opencv::prelude::DataType>(
        &mut self,
        row: i32,
        col: i32,
        value: T,
    ) -> Result<(), StitchError> {
        let v = self.at_2d_mut::<T>(row, col)?;
        *v = value;
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str, StitchError> {
    path.to_str()
        .ok_or_else(|| StitchError::InvalidPathEncoding(path.to_path_buf()))
}

/// Safe wrapper around OpenCV's `imread` with proper error handling
///
/// # Errors
/// Returns `StitchError::InvalidPathEncoding` if the path contains invalid Unicode characters.
///
/// Returns `StitchError::ProcessingError` if the file could not be decoded
/// (OpenCV signals that with an empty `Mat`).
///
/// # Example
/// ```no_run
/// # use libstitcher::{utils::imread, prelude::*, opencv::imgcodecs };
/// # fn a() -> Result<(),StitchError> {
/// let img = imread("image.jpg", imgcodecs::IMREAD_COLOR)?;
/// # Ok(()) }
/// ```
pub fn imread<P: AsRef<Path>>(path: P, flags: i32) -> Result<Mat, StitchError> {
    let img = imgcodecs::imread(path_str(path.as_ref())?, flags)?;
    if img.empty() {
        return Err(StitchError::ProcessingError(format!(
            "could not decode {}",
            path.as_ref().display()
        )));
    }
    Ok(img)
}

/// Writes an image, creating the parent directories if they are missing.
/// The file format is picked by OpenCV from the file extension.
pub fn imwrite<P: AsRef<Path>>(path: P, img: &Mat) -> Result<(), StitchError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    if !imgcodecs::imwrite(path_str(path)?, img, &Vector::<i32>::new())? {
        return Err(StitchError::ProcessingError(format!(
            "OpenCV refused to write {}",
            path.display()
        )));
    }
    log::info!("Result saved to {}", path.display());
    Ok(())
}

/// Returns a `CV_8UC3` BGR version of an 8 bit grey, BGR or BGRA image.
pub fn ensure_bgr(img: &Mat) -> Result<Mat, StitchError> {
    if img.depth() != opencv::core::CV_8U {
        return Err(StitchError::InvalidParams(format!(
            "only 8 bit images are supported, got depth {}",
            img.depth()
        )));
    }
    let code = match img.channels() {
        3 => return Ok(img.try_clone()?),
        1 => imgproc::COLOR_GRAY2BGR,
        4 => imgproc::COLOR_BGRA2BGR,
        c => {
            return Err(StitchError::InvalidParams(format!(
                "unsupported channel count {c}"
            )));
        }
    };
    let mut bgr = Mat::default();
    imgproc::cvt_color(img, &mut bgr, code, 0, AlgorithmHint::ALGO_HINT_DEFAULT)?;
    Ok(bgr)
}

/// Returns a single channel grey version of a grey, BGR or BGRA image. The depth is
/// kept, callers that threshold the result expect 8 bit input.
pub(crate) fn to_grey(img: &Mat) -> Result<Mat, StitchError> {
    let code = match img.channels() {
        1 => return Ok(img.try_clone()?),
        3 => imgproc::COLOR_BGR2GRAY,
        4 => imgproc::COLOR_BGRA2GRAY,
        c => {
            return Err(StitchError::InvalidParams(format!(
                "unsupported channel count {c}"
            )));
        }
    };
    let mut grey = Mat::default();
    imgproc::cvt_color(img, &mut grey, code, 0, AlgorithmHint::ALGO_HINT_DEFAULT)?;
    Ok(grey)
}

/// Resizes an image to exactly `size` using area interpolation.
pub(crate) fn resize_to(img: &Mat, size: Size) -> Result<Mat, StitchError> {
    let mut resized = Mat::default();
    imgproc::resize(img, &mut resized, size, 0.0, 0.0, imgproc::INTER_AREA)?;
    Ok(resized)
}

/// Scales an image down so that its longest side is at most `max_size`, keeping the
/// aspect ratio. Images that already fit are returned unchanged.
pub fn fit_within(img: Mat, max_size: i32) -> Result<Mat, StitchError> {
    let size = img.size()?;
    let longest = size.width.max(size.height);
    if longest <= max_size {
        return Ok(img);
    }
    let scale = max_size as f64 / longest as f64;
    let new_size = Size::new(
        ((size.width as f64 * scale) as i32).max(1),
        ((size.height as f64 * scale) as i32).max(1),
    );
    resize_to(&img, new_size)
}

/// Returns paths to all jpg, jpeg, tif and png files in a single directory (non-recursive),
/// sorted by file name.
pub fn collect_image_files(path: &Path) -> Result<Vec<PathBuf>, StitchError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .flatten()
        .map(|f| f.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| {
                    let extension = e.to_uppercase();
                    extension == "JPG"
                        || extension == "JPEG"
                        || extension == "TIF"
                        || extension == "PNG"
                })
                .unwrap_or(false)
        })
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Reads the images in parallel, keeping the order of `files`.
///
/// Every image is decoded as 3 channel BGR and, when `params.max_size` is set, scaled down
/// to fit. Files that can not be decoded, or whose path is not valid UTF-8, are skipped
/// with a warning. Fewer than two usable
/// images is reported as `StitchError::InsufficientImages`.
pub fn load_images(
    files: &[PathBuf],
    params: LoadParameters,
) -> Result<Vec<QueueItem>, StitchError> {
    let images = files
        .par_iter()
        .map(|f| -> Result<Option<QueueItem>, StitchError> {
            let img = match imread(f, imgcodecs::IMREAD_COLOR) {
                Ok(img) => img,
                Err(
                    e @ (StitchError::ProcessingError(_)
                    | StitchError::InvalidPathEncoding(_)
                    | StitchError::OpenCvError(_)),
                ) => {
                    log::warn!("Skipping {}: {e}", f.display());
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let img = match params.max_size {
                Some(max_size) => fit_within(img, max_size)?,
                None => img,
            };
            let label = f
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| f.display().to_string());
            log::info!("Loaded and processed: {label}");
            Ok(Some(QueueItem::new(label, img)))
        })
        .collect::<Result<Vec<_>, StitchError>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    if images.len() < 2 {
        return Err(StitchError::InsufficientImages {
            found: images.len(),
        });
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{self, Scalar};

    #[test]
    fn fit_within_keeps_aspect_ratio() -> Result<(), StitchError> {
        let img = Mat::new_rows_cols_with_default(1000, 4000, core::CV_8UC3, Scalar::all(7.0))?;
        let small = fit_within(img, 2000)?;
        assert_eq!(small.size()?, Size::new(2000, 500));

        let img = Mat::new_rows_cols_with_default(100, 40, core::CV_8UC3, Scalar::all(7.0))?;
        let same = fit_within(img, 2000)?;
        assert_eq!(same.size()?, Size::new(40, 100));
        Ok(())
    }

    #[test]
    fn ensure_bgr_converts_grey_and_bgra() -> Result<(), StitchError> {
        let grey = Mat::new_rows_cols_with_default(4, 5, core::CV_8UC1, Scalar::all(9.0))?;
        let bgr = ensure_bgr(&grey)?;
        assert_eq!(bgr.typ(), core::CV_8UC3);
        assert_eq!(bgr.size()?, Size::new(5, 4));

        let bgra = Mat::new_rows_cols_with_default(4, 5, core::CV_8UC4, Scalar::all(9.0))?;
        assert_eq!(ensure_bgr(&bgra)?.typ(), core::CV_8UC3);

        let float = Mat::new_rows_cols_with_default(4, 5, core::CV_32FC3, Scalar::all(0.5))?;
        assert!(matches!(
            ensure_bgr(&float),
            Err(StitchError::InvalidParams(_))
        ));
        Ok(())
    }

    #[test]
    fn to_grey_accepts_one_three_and_four_channels() -> Result<(), StitchError> {
        for typ in [core::CV_8UC1, core::CV_8UC3, core::CV_8UC4] {
            let img = Mat::new_rows_cols_with_default(4, 5, typ, Scalar::all(90.0))?;
            let grey = to_grey(&img)?;
            assert_eq!(grey.typ(), core::CV_8UC1);
            assert_eq!(*grey.at_2d::<u8>(3, 4)?, 90);
        }
        let two = Mat::new_rows_cols_with_default(4, 5, core::CV_8UC2, Scalar::all(90.0))?;
        assert!(matches!(to_grey(&two), Err(StitchError::InvalidParams(_))));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn undecodable_and_non_utf8_paths_are_skipped() -> Result<(), StitchError> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = std::env::temp_dir().join(format!("libstitcher-skip-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let img = Mat::new_rows_cols_with_default(30, 40, core::CV_8UC3, Scalar::all(100.0))?;
        imwrite(dir.join("a.png"), &img)?;
        imwrite(dir.join("b.png"), &img)?;
        std::fs::write(dir.join("c.png"), "not an image")?;

        let files = vec![
            dir.join("a.png"),
            dir.join(OsStr::from_bytes(b"bad\xff.png")),
            dir.join("c.png"),
            dir.join("b.png"),
        ];
        let images = load_images(&files, LoadParameters::default())?;
        let labels: Vec<_> = images.iter().map(|i| i.label()).collect();
        assert_eq!(labels, vec!["a.png", "b.png"]);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn mat_convert_scales_values() -> Result<(), StitchError> {
        let m = Mat::new_rows_cols_with_default(2, 2, core::CV_8UC1, Scalar::all(200.0))?;
        let f = m.convert(core::CV_64F, 0.5, 1.0)?;
        assert_eq!(*f.at_2d::<f64>(1, 1)?, 101.0);
        Ok(())
    }

    #[test]
    fn images_round_trip_through_a_missing_directory() -> Result<(), StitchError> {
        let dir = std::env::temp_dir().join(format!("libstitcher-utils-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let img = Mat::new_rows_cols_with_default(30, 40, core::CV_8UC3, Scalar::all(100.0))?;
        imwrite(dir.join("nested").join("b.png"), &img)?;
        imwrite(dir.join("nested").join("a.png"), &img)?;
        std::fs::write(dir.join("nested").join("notes.txt"), "not an image")?;

        let files = collect_image_files(&dir.join("nested"))?;
        let names: Vec<_> = files
            .iter()
            .filter_map(|f| f.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.png", "b.png"]);

        let images = load_images(
            &files,
            LoadParameters {
                max_size: Some(20),
            },
        )?;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].label(), "a.png");
        assert_eq!(images[0].image().size()?, Size::new(20, 15));

        let single = load_images(&files[..1], LoadParameters::default());
        assert!(matches!(
            single,
            Err(StitchError::InsufficientImages { found: 1 })
        ));
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}

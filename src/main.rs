// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use libstitcher::prelude::*;
use libstitcher::utils;

/// Stitches every image of a directory (in file name order) and saves the mosaic.
fn main() -> Result<(), StitchError> {
    let mut args = std::env::args().skip(1);
    let (Some(input), Some(output)) = (args.next(), args.next()) else {
        eprintln!("usage: libstitcher <image_dir> <output_file>");
        return Err(StitchError::InvalidParams(
            "expected an image directory and an output file".to_string(),
        ));
    };

    let now = std::time::Instant::now();
    let mosaic = stitch_directory(
        &input,
        LoadParameters::default(),
        StitchParameters::default(),
    )?;
    println!("Calculated stitch_directory() in {:?}", now.elapsed());

    utils::imwrite(&output, &mosaic)?;
    println!("Result saved to {output}");
    Ok(())
}

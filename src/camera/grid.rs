//! Dense per-pixel remap tables.
//!
//! A [`RemapGrid`] stores, for every pixel of an output image, where to sample
//! in a source image: sub-pixel coordinates (clamped to the source bounds),
//! their truncated integer indices, and a mask combining lens validity with
//! the in-bounds test. Rows are laid out row-major, `index = y * width + x`.

use log::debug;
use nalgebra::Vector2;
use rayon::prelude::*;

use crate::camera::Resolution;

/// Slack allowed below zero before a coordinate counts as outside the source.
const EDGE_TOLERANCE: f64 = 1e-6;

/// One remap entry: where an output pixel samples the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCell {
    pub x: f32,
    pub y: f32,
    pub ix: u32,
    pub iy: u32,
    pub valid: bool,
}

/// Per-pixel sampling tables from an output image into a source image.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapGrid {
    resolution: Resolution,
    source: Resolution,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
    index_x: Vec<u32>,
    index_y: Vec<u32>,
    mask: Vec<bool>,
}

impl RemapGrid {
    /// Evaluates `map` at every integer pixel of `resolution` in parallel.
    ///
    /// # Arguments
    ///
    /// * `resolution` - Size of the output image.
    /// * `source` - Size of the image being sampled.
    /// * `map` - Returns the source coordinate of an output pixel and whether
    ///   the transform considers it valid.
    ///
    /// # Returns
    ///
    /// A grid whose coordinates are clamped to the source bounds. Cells that
    /// are invalid or fall outside the source are masked out.
    pub fn build<F>(resolution: Resolution, source: Resolution, map: F) -> Self
    where
        F: Fn(Vector2<f64>) -> (Vector2<f64>, bool) + Sync,
    {
        let width = resolution.width as usize;
        let source_w = source.width as f64;
        let source_h = source.height as f64;

        let cells: Vec<GridCell> = (0..resolution.pixel_count())
            .into_par_iter()
            .map(|i| {
                let pixel = Vector2::new((i % width) as f64, (i / width) as f64);
                let (mapped, valid) = map(pixel);
                let in_bounds = mapped.x > -EDGE_TOLERANCE
                    && mapped.y > -EDGE_TOLERANCE
                    && mapped.x < source_w
                    && mapped.y < source_h;
                // f64::max drops NaN, so non-finite coordinates clamp to 0.
                let x = mapped.x.max(0.0).min(source_w - 1.0) as f32;
                let y = mapped.y.max(0.0).min(source_h - 1.0) as f32;
                GridCell {
                    x,
                    y,
                    ix: x as u32,
                    iy: y as u32,
                    valid: valid && in_bounds,
                }
            })
            .collect();

        let grid = RemapGrid {
            resolution,
            source,
            map_x: cells.iter().map(|c| c.x).collect(),
            map_y: cells.iter().map(|c| c.y).collect(),
            index_x: cells.iter().map(|c| c.ix).collect(),
            index_y: cells.iter().map(|c| c.iy).collect(),
            mask: cells.iter().map(|c| c.valid).collect(),
        };
        debug!(
            "Built {}x{} remap grid into {}x{} source, {} of {} cells valid",
            resolution.width,
            resolution.height,
            source.width,
            source.height,
            grid.valid_count(),
            grid.mask.len()
        );
        grid
    }

    /// Size of the image this grid produces.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Size of the image this grid samples from.
    pub fn source(&self) -> Resolution {
        self.source
    }

    /// Sub-pixel source x coordinate of every cell, row-major.
    pub fn map_x(&self) -> &[f32] {
        &self.map_x
    }

    /// Sub-pixel source y coordinate of every cell, row-major.
    pub fn map_y(&self) -> &[f32] {
        &self.map_y
    }

    /// Truncated source column of every cell.
    pub fn index_x(&self) -> &[u32] {
        &self.index_x
    }

    /// Truncated source row of every cell.
    pub fn index_y(&self) -> &[u32] {
        &self.index_y
    }

    /// `true` where the cell samples a valid in-bounds source pixel.
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Cell at output pixel `(x, y)`, or `None` outside the grid.
    pub fn get(&self, x: u32, y: u32) -> Option<GridCell> {
        if x >= self.resolution.width || y >= self.resolution.height {
            return None;
        }
        let i = y as usize * self.resolution.width as usize + x as usize;
        Some(GridCell {
            x: self.map_x[i],
            y: self.map_y[i],
            ix: self.index_x[i],
            iy: self.index_y[i],
            valid: self.mask[i],
        })
    }

    /// Number of unmasked cells.
    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }
}

//! Helpers around the lens model: image resampling through remap grids,
//! round-trip diagnostics and CSV export of visible regions.

use crate::camera::{LensMapping, LensModel, LensModelError, RemapGrid};
use crate::fov::VisibleRegion;
use crate::geometry::sample_points;
use image::{ImageBuffer, Pixel, RgbImage};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Ensure the output directory exists
pub fn ensure_output_dir() -> Result<(), UtilError> {
    let output_dir = Path::new("output");
    if !output_dir.exists() {
        fs::create_dir_all(output_dir).map_err(|e| {
            UtilError::InvalidParams(format!("Failed to create output directory: {e}"))
        })?;
    }
    Ok(())
}

/// Errors raised by the image, CSV and diagnostic helpers.
#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Lens model error: {0}")]
    LensModel(#[from] LensModelError),
    #[error("Image error: {0}")]
    ImageError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

impl From<image::ImageError> for UtilError {
    fn from(err: image::ImageError) -> Self {
        UtilError::ImageError(err.to_string())
    }
}

impl From<csv::Error> for UtilError {
    fn from(err: csv::Error) -> Self {
        UtilError::CsvError(err.to_string())
    }
}

/// Summary statistics of per-point pixel errors.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    fn from_errors(mut errors: Vec<f64>) -> Result<Self, UtilError> {
        if errors.is_empty() {
            return Err(UtilError::ZeroProjectionPoints);
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();

        errors.sort_by(|a, b| a.total_cmp(b));
        let median = if errors.len() % 2 == 0 {
            let mid = errors.len() / 2;
            (errors[mid - 1] + errors[mid]) / 2.0
        } else {
            errors[errors.len() / 2]
        };

        Ok(ProjectionError {
            rmse,
            min: errors[0],
            max: errors[errors.len() - 1],
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Pixel error of `dewarp(warp(p))` over about `n` rectified sample points.
///
/// Points that are invalid in either direction are skipped.
///
/// # Arguments
///
/// * `lens` - Lens to check
/// * `n` - The approximate number of sample points
///
/// # Returns
///
/// * `Result<ProjectionError, UtilError>` - Error statistics, or
///   `ZeroProjectionPoints` when no sample survives both directions
pub fn dewarp_round_trip_error<L>(lens: &L, n: usize) -> Result<ProjectionError, UtilError>
where
    L: LensMapping + ?Sized,
{
    let resolution = lens.resolution();
    let rectified = sample_points(resolution.width as f64, resolution.height as f64, n);
    let warped = lens.warp_points(&rectified)?;
    let back = lens.dewarp_points(&warped.points)?;

    let errors: Vec<f64> = (0..rectified.ncols())
        .filter(|i| warped.valid[*i] && back.valid[*i])
        .map(|i| (back.point(i) - rectified.column(i).into_owned()).norm())
        .collect();
    ProjectionError::from_errors(errors)
}

/// Sampling used when resampling an image through a remap grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Bilinear,
}

/// Resamples `image` through `grid`; masked cells stay zero.
///
/// # Arguments
///
/// * `image` - Source image, sized like `grid.source()`
/// * `grid` - Remap grid to sample through
/// * `interpolation` - Nearest-neighbour or bilinear sampling
///
/// # Returns
///
/// * `Result<ImageBuffer<P, Vec<u8>>, UtilError>` - Image sized like
///   `grid.resolution()`, or `InvalidParams` if the image size does not match
pub fn remap_image<P>(
    image: &ImageBuffer<P, Vec<u8>>,
    grid: &RemapGrid,
    interpolation: Interpolation,
) -> Result<ImageBuffer<P, Vec<u8>>, UtilError>
where
    P: Pixel<Subpixel = u8>,
{
    let source = grid.source();
    if image.width() != source.width || image.height() != source.height {
        return Err(UtilError::InvalidParams(format!(
            "image is {}x{} but the grid samples a {}x{} image",
            image.width(),
            image.height(),
            source.width,
            source.height
        )));
    }

    let resolution = grid.resolution();
    let mut output = ImageBuffer::<P, Vec<u8>>::new(resolution.width, resolution.height);
    for y in 0..resolution.height {
        for x in 0..resolution.width {
            let Some(cell) = grid.get(x, y) else {
                continue;
            };
            if !cell.valid {
                continue;
            }
            let pixel = match interpolation {
                Interpolation::Nearest => *image.get_pixel(cell.ix, cell.iy),
                Interpolation::Bilinear => bilinear(image, cell.x, cell.y),
            };
            output.put_pixel(x, y, pixel);
        }
    }
    Ok(output)
}

fn bilinear<P>(image: &ImageBuffer<P, Vec<u8>>, x: f32, y: f32) -> P
where
    P: Pixel<Subpixel = u8>,
{
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0).channels();
    let p10 = image.get_pixel(x1, y0).channels();
    let p01 = image.get_pixel(x0, y1).channels();
    let p11 = image.get_pixel(x1, y1).channels();

    let mut pixel = *image.get_pixel(x0, y0);
    for (c, value) in pixel.channels_mut().iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    pixel
}

/// Distorted sensor image to rectified image, through the lens' forward grid.
pub fn dewarp_image<P>(
    lens: &LensModel,
    image: &ImageBuffer<P, Vec<u8>>,
    interpolation: Interpolation,
) -> Result<ImageBuffer<P, Vec<u8>>, UtilError>
where
    P: Pixel<Subpixel = u8>,
{
    remap_image(image, lens.forward_grid(), interpolation)
}

/// Rectified image back to the distorted sensor, through the lens' inverse grid.
pub fn warp_image<P>(
    lens: &LensModel,
    image: &ImageBuffer<P, Vec<u8>>,
    interpolation: Interpolation,
) -> Result<ImageBuffer<P, Vec<u8>>, UtilError>
where
    P: Pixel<Subpixel = u8>,
{
    remap_image(image, lens.inverse_grid()?, interpolation)
}

/// Load an image from file
///
/// # Arguments
///
/// * `image_path` - Path to the image file
///
/// # Returns
///
/// * `Result<RgbImage, UtilError>` - Loaded RGB image
pub fn load_image(image_path: &str) -> Result<RgbImage, UtilError> {
    let img = image::open(image_path)?;
    Ok(img.to_rgb8())
}

/// One vertex of a visible-region boundary as written to CSV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryVertex {
    pub polygon: usize,
    pub vertex: usize,
    pub x: f64,
    pub y: f64,
}

/// Writes every boundary vertex of `region` to a CSV file with a header row.
pub fn export_visible_region(
    region: &VisibleRegion,
    path: impl AsRef<Path>,
) -> Result<(), UtilError> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)?;
    for (polygon, boundary) in region.boundaries().iter().enumerate() {
        for (vertex, (x, y)) in boundary.iter().enumerate() {
            writer.serialize(BoundaryVertex {
                polygon,
                vertex,
                x: *x,
                y: *y,
            })?;
        }
    }
    writer
        .flush()
        .map_err(|e| UtilError::CsvError(e.to_string()))?;
    info!(
        "Exported {} visible polygons to {}",
        region.len(),
        path.display()
    );
    Ok(())
}

/// Reads boundaries written by [`export_visible_region`].
pub fn import_visible_region(path: impl AsRef<Path>) -> Result<Vec<Vec<(f64, f64)>>, UtilError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut boundaries: Vec<Vec<(f64, f64)>> = Vec::new();
    for record in reader.deserialize() {
        let vertex: BoundaryVertex = record?;
        if vertex.polygon >= boundaries.len() {
            boundaries.resize(vertex.polygon + 1, Vec::new());
        }
        boundaries[vertex.polygon].push((vertex.x, vertex.y));
    }
    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{LensOptions, LensParameters, LensPreset, Resolution};
    use crate::fov::intersect_with_walkable;
    use geo::{LineString, Polygon};
    use image::{GrayImage, Luma, Rgb};
    use nalgebra::Vector2;

    fn rectilinear_lens(width: u32, height: u32) -> LensModel {
        LensModel::with_options(
            LensParameters::rectilinear(width as f64, 1e-3),
            Resolution::new(width, height),
            LensOptions {
                focal: Some(40.0),
                ..LensOptions::default()
            },
        )
        .unwrap()
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]))
    }

    #[test]
    fn test_round_trip_error_is_small() {
        let lens = LensModel::from_preset(LensPreset::M3106, Resolution::new(2688, 1512)).unwrap();
        let error = dewarp_round_trip_error(&lens, 200).unwrap();
        // One sample sits on the principal point, which only comes back to
        // within a pixel; all others are exact.
        assert!(error.max < 1.0, "{error:?}");
        assert!(error.median < 1e-6, "{error:?}");
        assert!(error.rmse <= error.max);
        assert!(error.min <= error.median && error.median <= error.max);
    }

    #[test]
    fn test_round_trip_error_needs_valid_points() {
        let errors = ProjectionError::from_errors(vec![]);
        assert!(matches!(errors, Err(UtilError::ZeroProjectionPoints)));

        let stats = ProjectionError::from_errors(vec![3.0, 1.0, 2.0, 4.0]).unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.mean, 2.5);
    }

    #[test]
    fn test_dewarp_identity_lens_keeps_image() {
        let lens = rectilinear_lens(32, 24);
        let image = gradient(32, 24);

        let nearest = dewarp_image(&lens, &image, Interpolation::Nearest).unwrap();
        assert_eq!(nearest.dimensions(), (32, 24));
        // Sub-pixel noise can truncate one pixel down, so compare away from exact integers.
        let diff = |a: &Rgb<u8>, b: &Rgb<u8>| {
            a.0.iter()
                .zip(b.0.iter())
                .map(|(p, q)| (*p as i32 - *q as i32).abs())
                .max()
                .unwrap_or(0)
        };
        for (x, y) in [(0, 0), (5, 7), (31, 23), (16, 12)] {
            assert!(diff(nearest.get_pixel(x, y), image.get_pixel(x, y)) <= 4);
        }

        let bilinear = dewarp_image(&lens, &image, Interpolation::Bilinear).unwrap();
        for (x, y) in [(3, 4), (20, 10)] {
            assert!(diff(bilinear.get_pixel(x, y), image.get_pixel(x, y)) <= 1);
        }

        let warped = warp_image(&lens, &image, Interpolation::Bilinear).unwrap();
        assert_eq!(warped.dimensions(), (32, 24));
    }

    #[test]
    fn test_bilinear_blends_neighbours() {
        let image = GrayImage::from_fn(4, 1, |x, _| Luma([(x * 60) as u8]));
        let grid = RemapGrid::build(Resolution::new(3, 1), Resolution::new(4, 1), |p| {
            (Vector2::new(p.x + 0.5, p.y), true)
        });
        let blended = remap_image(&image, &grid, Interpolation::Bilinear).unwrap();
        assert_eq!(blended.get_pixel(0, 0)[0], 30);
        assert_eq!(blended.get_pixel(1, 0)[0], 90);
        assert_eq!(blended.get_pixel(2, 0)[0], 150);

        let nearest = remap_image(&image, &grid, Interpolation::Nearest).unwrap();
        assert_eq!(nearest.get_pixel(1, 0)[0], 60);
    }

    #[test]
    fn test_masked_cells_are_black() {
        let image = GrayImage::from_pixel(4, 4, Luma([200]));
        let grid = RemapGrid::build(Resolution::new(4, 4), Resolution::new(4, 4), |p| {
            (p, p.x < 2.0)
        });
        let remapped = remap_image(&image, &grid, Interpolation::Nearest).unwrap();
        assert_eq!(remapped.get_pixel(1, 1)[0], 200);
        assert_eq!(remapped.get_pixel(3, 1)[0], 0);
    }

    #[test]
    fn test_remap_rejects_wrong_image_size() {
        let lens = rectilinear_lens(32, 24);
        let image = gradient(16, 16);
        assert!(matches!(
            dewarp_image(&lens, &image, Interpolation::Nearest),
            Err(UtilError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_export_visible_region() {
        let fov = Polygon::new(
            LineString::from(vec![(-50.0, -50.0), (50.0, -50.0), (50.0, 50.0), (-50.0, 50.0)]),
            vec![],
        );
        let walkable = vec![
            vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)],
            vec![(5.0, 5.0), (7.0, 5.0), (7.0, 7.0)],
        ];
        let region = intersect_with_walkable(&fov, &walkable);

        ensure_output_dir().unwrap();
        let path = "output/visible_region.csv";
        export_visible_region(&region, path).unwrap();

        let boundaries = import_visible_region(path).unwrap();
        assert_eq!(boundaries, region.boundaries());
    }
}

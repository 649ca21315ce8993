//! Lens models and the shared types they are built from.
//!
//! A lens maps between two pixel spaces: the *distorted* sensor image as it
//! comes out of the physical camera, and the *rectified* (dewarped) image an
//! ideal pinhole camera with the same focal length would have produced. The
//! [`LensMapping`] trait is the seam every consumer (ground projection, field
//! of view, image resampling) is written against.

pub mod grid;
pub mod lens;
pub mod params;
pub mod pinhole;
pub mod polar;
pub mod polynomial;

pub use grid::RemapGrid;
pub use lens::{LensModel, LensOptions, LensUpdate};
pub use params::{lens_parameters, LensDescription, LensParameters, LensPreset};
pub use pinhole::PinholeCamera;
pub use polar::PolarRemap;
pub use polynomial::{RadialLaw, RadialPolynomial, RadiusInversion};

use nalgebra::{Matrix2xX, Matrix3, Vector2};
use serde::{Deserialize, Serialize};

/// Dewarped (rectilinear) intrinsics: one focal length in pixels and the principal point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// The camera matrix `K`.
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal, 0.0, self.cx, //
            0.0, self.focal, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LensModelError {
    #[error("Focal length must be finite and non-zero, got {0}")]
    InvalidFocalLength(f64),
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid lens parameters: {0}")]
    InvalidParams(String),
    #[error("Unsupported polynomial length {0}, expected 5, 7 or 9 coefficients")]
    UnsupportedPolynomialDegree(usize),
    #[error("Polynomial pair lengths differ: {0} and {1}")]
    PolynomialLengthMismatch(usize, usize),
    #[error("Matrix is singular and cannot be inverted")]
    SingularMatrix,
    #[error("Dewarping is not supported when a sensor homography is set")]
    DewarpWithHomography,
    #[error("Lens description is missing field '{0}'")]
    MissingField(String),
    #[error("Unknown lens preset: {0}")]
    UnknownPreset(String),
    #[error("Point count mismatch: {0} points but {1} heights")]
    PointCountMismatch(usize, usize),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("Failed to process JSON: {0}")]
    JsonError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for LensModelError {
    fn from(err: std::io::Error) -> Self {
        LensModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for LensModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        LensModelError::YamlError(err.to_string())
    }
}

impl From<serde_yaml::Error> for LensModelError {
    fn from(err: serde_yaml::Error) -> Self {
        LensModelError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for LensModelError {
    fn from(err: serde_json::Error) -> Self {
        LensModelError::JsonError(err.to_string())
    }
}

/// Pixel coordinates produced by a lens mapping together with a per-point validity flag.
///
/// Column `i` of `points` is only meaningful when `valid[i]` is true. Invalid
/// columns may hold non-finite values.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedPixels {
    pub points: Matrix2xX<f64>,
    pub valid: Vec<bool>,
}

impl MappedPixels {
    pub fn len(&self) -> usize {
        self.points.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.points.ncols() == 0
    }

    pub fn point(&self, index: usize) -> Vector2<f64> {
        Vector2::new(self.points[(0, index)], self.points[(1, index)])
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}

/// Trait implemented by everything that maps between rectified and distorted pixels.
pub trait LensMapping {
    /// Maps rectified pixels to distorted sensor pixels.
    fn warp_points(&self, rectified: &Matrix2xX<f64>) -> Result<MappedPixels, LensModelError>;

    /// Maps distorted sensor pixels to rectified pixels.
    fn dewarp_points(&self, distorted: &Matrix2xX<f64>) -> Result<MappedPixels, LensModelError>;

    /// Dewarped focal length and principal point.
    fn intrinsics(&self) -> Intrinsics;

    /// Translation applied to rectified pixels before warping (crop offset).
    fn pixel_offset(&self) -> Vector2<f64>;

    /// Sensor resolution.
    fn resolution(&self) -> Resolution;
}

/// Common validation functions for lens parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), LensModelError> {
        if !intrinsics.focal.is_finite() || intrinsics.focal == 0.0 {
            return Err(LensModelError::InvalidFocalLength(intrinsics.focal));
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(LensModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_resolution(resolution: &Resolution) -> Result<(), LensModelError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(LensModelError::InvalidParams(format!(
                "resolution must be non-empty, got {}x{}",
                resolution.width, resolution.height
            )));
        }
        Ok(())
    }
}

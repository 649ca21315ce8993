//! Implements the distortion-free pinhole camera.
//!
//! [`PinholeCamera`] is the projective counterpart of [`crate::camera::LensModel`]:
//! its warp and dewarp are the identity, so the world/image transforms in
//! [`crate::geometry`] reduce to the plain pinhole equations.

use crate::camera::{
    validation, Intrinsics, LensMapping, LensModelError, MappedPixels, Resolution,
};
use nalgebra::{Matrix2xX, Vector2};
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

/// Ideal rectilinear camera with a single focal length.
///
/// # Examples
///
/// ```rust
/// use lensdist_tools::camera::{LensMapping, PinholeCamera, Resolution};
///
/// let camera = PinholeCamera::new(500.0, 320.0, 240.0, Resolution::new(640, 480)).unwrap();
/// assert_eq!(camera.intrinsics().focal, 500.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PinholeCamera {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// Crop offset subtracted from projected pixels.
    pub offset: Vector2<f64>,
}

impl PinholeCamera {
    /// Creates a pinhole camera.
    ///
    /// # Arguments
    ///
    /// * `focal` - Focal length in pixels.
    /// * `cx`, `cy` - Principal point in pixels.
    /// * `resolution` - Image size.
    ///
    /// # Errors
    ///
    /// Returns [`LensModelError::InvalidFocalLength`] or
    /// [`LensModelError::PrincipalPointMustBeFinite`] for unusable intrinsics.
    pub fn new(
        focal: f64,
        cx: f64,
        cy: f64,
        resolution: Resolution,
    ) -> Result<Self, LensModelError> {
        let camera = PinholeCamera {
            intrinsics: Intrinsics { focal, cx, cy },
            resolution,
            offset: Vector2::zeros(),
        };
        camera.validate_params()?;
        Ok(camera)
    }

    pub fn with_offset(mut self, offset: Vector2<f64>) -> Self {
        self.offset = offset;
        self
    }

    /// Loads the camera from a YAML file with a `cam0` block holding
    /// `intrinsics: [focal, cx, cy]` and `resolution: [width, height]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensModelError::IOError`] or [`LensModelError::YamlError`] when
    /// the file cannot be read or parsed, and [`LensModelError::InvalidParams`]
    /// when a value is missing, malformed or out of range.
    pub fn load_from_yaml(path: &str) -> Result<Self, LensModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| LensModelError::YamlError(format!("{path} is empty")))?;

        let intrinsics_yaml = doc["cam0"]["intrinsics"].as_vec().ok_or_else(|| {
            LensModelError::InvalidParams("YAML missing 'intrinsics' or not an array".to_string())
        })?;
        let resolution_yaml = doc["cam0"]["resolution"].as_vec().ok_or_else(|| {
            LensModelError::InvalidParams("YAML missing 'resolution' or not an array".to_string())
        })?;
        if intrinsics_yaml.len() != 3 || resolution_yaml.len() != 2 {
            return Err(LensModelError::InvalidParams(
                "expected 3 intrinsics and 2 resolution values".to_string(),
            ));
        }

        let value = |i: usize, name: &str| {
            intrinsics_yaml[i].as_f64().ok_or_else(|| {
                LensModelError::InvalidParams(format!("Invalid {name}: not a float"))
            })
        };
        let intrinsics = Intrinsics {
            focal: value(0, "focal")?,
            cx: value(1, "cx")?,
            cy: value(2, "cy")?,
        };

        let dimension = |i: usize, name: &str| {
            resolution_yaml[i]
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    LensModelError::InvalidParams(format!(
                        "Invalid {name}: not an unsigned 32-bit integer"
                    ))
                })
        };
        let resolution = Resolution {
            width: dimension(0, "width")?,
            height: dimension(1, "height")?,
        };

        let camera = PinholeCamera {
            intrinsics,
            resolution,
            offset: Vector2::zeros(),
        };
        camera.validate_params()?;
        Ok(camera)
    }

    /// Writes the camera in the format read by [`PinholeCamera::load_from_yaml`].
    pub fn save_to_yaml(&self, path: &str) -> Result<(), LensModelError> {
        let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                (
                    serde_yaml::Value::String("camera_model".to_string()),
                    serde_yaml::Value::String("pinhole".to_string()),
                ),
                (
                    serde_yaml::Value::String("intrinsics".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.focal,
                        self.intrinsics.cx,
                        self.intrinsics.cy,
                    ])?,
                ),
                (
                    serde_yaml::Value::String("resolution".to_string()),
                    serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])?,
                ),
            ]))?,
        )]))?;

        let yaml_string = serde_yaml::to_string(&yaml)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    pub fn validate_params(&self) -> Result<(), LensModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_resolution(&self.resolution)
    }
}

fn identity(points: &Matrix2xX<f64>) -> MappedPixels {
    MappedPixels {
        points: points.clone(),
        valid: points
            .column_iter()
            .map(|c| c[0].is_finite() && c[1].is_finite())
            .collect(),
    }
}

impl LensMapping for PinholeCamera {
    fn warp_points(&self, rectified: &Matrix2xX<f64>) -> Result<MappedPixels, LensModelError> {
        Ok(identity(rectified))
    }

    fn dewarp_points(&self, distorted: &Matrix2xX<f64>) -> Result<MappedPixels, LensModelError> {
        Ok(identity(distorted))
    }

    fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn pixel_offset(&self) -> Vector2<f64> {
        self.offset
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

//! Implements the distorted fisheye lens model.
//!
//! [`LensModel`] converts between rectified (dewarped) pixels and distorted
//! sensor pixels. Warping a rectified pixel runs, in order:
//!
//! 1. add the crop offset,
//! 2. undo the sensor homography (if any),
//! 3. centre on the principal point,
//! 4. rotate the ray by the inverse nominal homography (if any); rays that end
//!    up behind the camera are flagged invalid,
//! 5. convert to polar form with the radius normalized by the focal length,
//! 6. apply the forward polar remap (if any),
//! 7. map the ray angle `atan(r)` to a distorted radius through the radial law,
//! 8. go back to Cartesian pixels around the principal point.
//!
//! Dewarping runs the same steps backwards. The sensor homography has no
//! inverse path, so dewarping a lens that carries one is an error.
//!
//! Remap grids are built lazily on first access and dropped by every call that
//! changes the geometry.

use log::{debug, info};
use nalgebra::{Matrix2xX, Matrix3, Vector2, Vector3};
use std::path::Path;
use std::sync::OnceLock;

use crate::camera::grid::RemapGrid;
use crate::camera::params::{LensDescription, LensParameters, LensPreset};
use crate::camera::polar::PolarRemap;
use crate::camera::polynomial::RadialLaw;
use crate::camera::{
    validation, Intrinsics, LensMapping, LensModelError, MappedPixels, Resolution,
};

/// A 3x3 matrix stored together with its inverse.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Homography {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Homography {
    fn new(matrix: Matrix3<f64>) -> Result<Self, LensModelError> {
        let inverse = matrix
            .try_inverse()
            .ok_or(LensModelError::SingularMatrix)?;
        Ok(Homography { matrix, inverse })
    }
}

/// Optional construction inputs for [`LensModel::with_options`].
#[derive(Debug, Clone, Default)]
pub struct LensOptions {
    /// Dewarped focal length in pixels. Derived from the radial law at the
    /// principal point when absent.
    pub focal: Option<f64>,
    /// Defaults to the image centre.
    pub principal: Option<Vector2<f64>>,
    /// Sensor misalignment correction applied to raw sensor coordinates.
    pub homography: Option<Matrix3<f64>>,
    /// Camera tilt/pan applied in normalized ray space.
    pub nominal_homography: Option<Matrix3<f64>>,
    /// Defaults to the sensor resolution.
    pub dewarped_resolution: Option<Resolution>,
    pub polar_remap: Option<PolarRemap>,
}

/// Subset of lens fields changed by [`LensModel::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LensUpdate {
    pub dewarped_resolution: Option<Resolution>,
    pub x_offset: Option<f64>,
    pub y_offset: Option<f64>,
    pub nominal_homography: Option<Matrix3<f64>>,
}

/// Fisheye lens mapping rectified pixels to distorted sensor pixels and back.
///
/// Cloning drops nothing: cached grids are cloned along with the lens.
#[derive(Debug, Clone)]
pub struct LensModel {
    parameters: LensParameters,
    resolution: Resolution,
    image_scale: f64,
    law: RadialLaw,
    principal: Vector2<f64>,
    focal: f64,
    homography: Option<Homography>,
    nominal_homography: Option<Homography>,
    dewarped_resolution: Resolution,
    pixel_offset: Vector2<f64>,
    polar_remap: Option<PolarRemap>,
    forward_grid: OnceLock<RemapGrid>,
    inverse_grid: OnceLock<RemapGrid>,
}

impl LensModel {
    /// Creates a lens with default principal point, derived focal length and no rotation.
    pub fn new(
        parameters: LensParameters,
        resolution: Resolution,
    ) -> Result<Self, LensModelError> {
        Self::with_options(parameters, resolution, LensOptions::default())
    }

    /// Creates a lens with explicit optional inputs.
    ///
    /// # Arguments
    ///
    /// * `parameters` - Distortion polynomial and sensor geometry
    /// * `resolution` - Size of the distorted sensor image
    /// * `options` - Focal length, principal point, homographies, dewarped
    ///   resolution and polar remap; absent fields take their defaults
    ///
    /// # Returns
    ///
    /// * `Result<LensModel, LensModelError>` - The lens, or an error for
    ///   invalid parameters, a degenerate focal length or a singular homography
    pub fn with_options(
        parameters: LensParameters,
        resolution: Resolution,
        options: LensOptions,
    ) -> Result<Self, LensModelError> {
        validation::validate_resolution(&resolution)?;
        parameters.validate()?;

        let image_scale = parameters.sensor_width / resolution.width as f64;
        let principal = options.principal.unwrap_or_else(|| {
            Vector2::new(resolution.width as f64 / 2.0, resolution.height as f64 / 2.0)
        });
        let law = parameters.radial_law(image_scale, options.focal)?;
        let focal = match options.focal {
            Some(focal) => focal,
            None => principal.x / law.distorted_radius_to_angle(principal.x).tan(),
        };
        validation::validate_intrinsics(&Intrinsics {
            focal,
            cx: principal.x,
            cy: principal.y,
        })?;

        let dewarped_resolution = options.dewarped_resolution.unwrap_or(resolution);
        validation::validate_resolution(&dewarped_resolution)?;

        let lens = LensModel {
            parameters,
            resolution,
            image_scale,
            law,
            principal,
            focal,
            homography: options.homography.map(Homography::new).transpose()?,
            nominal_homography: options
                .nominal_homography
                .map(Homography::new)
                .transpose()?,
            dewarped_resolution,
            pixel_offset: Vector2::zeros(),
            polar_remap: options.polar_remap,
            forward_grid: OnceLock::new(),
            inverse_grid: OnceLock::new(),
        };
        info!(
            "Created lens {}x{} (image scale {:.4}), dewarped focal {:.3}",
            resolution.width, resolution.height, image_scale, focal
        );
        Ok(lens)
    }

    /// Lens for a calibrated preset on a sensor of `resolution`.
    pub fn from_preset(preset: LensPreset, resolution: Resolution) -> Result<Self, LensModelError> {
        Self::new(preset.parameters(), resolution)
    }

    /// Rebuilds a lens from its serialized description.
    pub fn from_description(
        resolution: Resolution,
        description: &LensDescription,
    ) -> Result<Self, LensModelError> {
        Self::with_options(
            description.parameters(),
            resolution,
            LensOptions {
                focal: Some(description.dewarped_focal),
                nominal_homography: description.rotation_matrix(),
                ..LensOptions::default()
            },
        )
    }

    /// Fisheye lens whose fitted polynomial reproduces a rectilinear camera of `focal_length`.
    pub fn from_projective(
        resolution: Resolution,
        focal_length: f64,
        principal: Option<Vector2<f64>>,
        pixel_width: f64,
    ) -> Result<Self, LensModelError> {
        let parameters =
            LensParameters::fit_projective(resolution, focal_length, principal, pixel_width)?;
        Self::with_options(
            parameters,
            resolution,
            LensOptions {
                focal: Some(focal_length),
                principal,
                ..LensOptions::default()
            },
        )
    }

    /// Loads a lens description from a JSON file.
    pub fn load_json(
        resolution: Resolution,
        path: impl AsRef<Path>,
    ) -> Result<Self, LensModelError> {
        Self::from_description(resolution, &LensDescription::load_json(path)?)
    }

    pub fn load_yaml(
        resolution: Resolution,
        path: impl AsRef<Path>,
    ) -> Result<Self, LensModelError> {
        Self::from_description(resolution, &LensDescription::load_yaml(path)?)
    }

    /// Construction parameters in serialized form. Runtime state is not included.
    pub fn description(&self) -> LensDescription {
        let mut description = LensDescription {
            dewarped_focal: self.focal,
            dist_poly: self.parameters.dist_poly.clone(),
            sensor_width: self.parameters.sensor_width,
            pixel_width: self.parameters.pixel_width,
            rotation: None,
            extra: serde_json::Map::new(),
        };
        description.set_rotation_matrix(self.nominal_homography.as_ref().map(|h| &h.matrix));
        description
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), LensModelError> {
        self.description().save_json(path)
    }

    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<(), LensModelError> {
        self.description().save_yaml(path)
    }

    pub fn parameters(&self) -> &LensParameters {
        &self.parameters
    }

    pub fn radial_law(&self) -> &RadialLaw {
        &self.law
    }

    pub fn image_scale(&self) -> f64 {
        self.image_scale
    }

    pub fn focal(&self) -> f64 {
        self.focal
    }

    pub fn principal_point(&self) -> Vector2<f64> {
        self.principal
    }

    pub fn dewarped_resolution(&self) -> Resolution {
        self.dewarped_resolution
    }

    pub fn homography(&self) -> Option<&Matrix3<f64>> {
        self.homography.as_ref().map(|h| &h.matrix)
    }

    pub fn nominal_homography(&self) -> Option<&Matrix3<f64>> {
        self.nominal_homography.as_ref().map(|h| &h.matrix)
    }

    pub fn polar_remap(&self) -> Option<&PolarRemap> {
        self.polar_remap.as_ref()
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics().k_matrix()
    }

    /// Applies any subset of the updatable fields and drops the cached grids.
    ///
    /// # Arguments
    ///
    /// * `update` - Fields to change; `None` leaves a field as it is
    ///
    /// # Returns
    ///
    /// * `Result<(), LensModelError>` - `SingularMatrix` for a non-invertible
    ///   nominal homography, in which case nothing changes
    pub fn update(&mut self, update: LensUpdate) -> Result<(), LensModelError> {
        let nominal = update
            .nominal_homography
            .map(Homography::new)
            .transpose()?;
        if let Some(resolution) = update.dewarped_resolution {
            validation::validate_resolution(&resolution)?;
            self.dewarped_resolution = resolution;
        }
        if let Some(x) = update.x_offset {
            self.pixel_offset.x = x;
        }
        if let Some(y) = update.y_offset {
            self.pixel_offset.y = y;
        }
        if nominal.is_some() {
            self.nominal_homography = nominal;
        }
        self.invalidate_caches();
        Ok(())
    }

    /// Crops the dewarped image to `width`x`height`, centred unless offsets are given.
    pub fn crop(
        &mut self,
        width: u32,
        height: u32,
        dx: Option<f64>,
        dy: Option<f64>,
    ) -> Result<&mut Self, LensModelError> {
        let dx = dx.unwrap_or(self.resolution.width as f64 / 2.0 - width as f64 / 2.0);
        let dy = dy.unwrap_or(self.resolution.height as f64 / 2.0 - height as f64 / 2.0);
        self.update(LensUpdate {
            dewarped_resolution: Some(Resolution::new(width, height)),
            x_offset: Some(dx),
            y_offset: Some(dy),
            nominal_homography: None,
        })?;
        Ok(self)
    }

    /// Sets the dewarped focal length so the rectified image spans `horizontal` radians.
    pub fn set_dewarped_fov(&mut self, horizontal: f64) -> Result<&mut Self, LensModelError> {
        let focal = self.dewarped_resolution.width as f64 / 2.0 / (horizontal / 2.0).tan();
        validation::validate_intrinsics(&Intrinsics {
            focal,
            cx: self.principal.x,
            cy: self.principal.y,
        })?;
        self.focal = focal;
        self.invalidate_caches();
        Ok(self)
    }

    /// Lens describing the rectified image itself: an ideal rectilinear sensor
    /// sharing this lens' focal length, principal point, offsets and rotation.
    pub fn dewarped(&self) -> LensModel {
        LensModel {
            parameters: LensParameters::rectilinear(
                self.dewarped_resolution.width as f64,
                self.parameters.pixel_width,
            ),
            resolution: self.dewarped_resolution,
            image_scale: 1.0,
            law: RadialLaw::Rectilinear { focal: self.focal },
            principal: self.principal,
            focal: self.focal,
            homography: self.homography,
            nominal_homography: self.nominal_homography,
            dewarped_resolution: self.dewarped_resolution,
            pixel_offset: self.pixel_offset,
            polar_remap: self.polar_remap.clone(),
            forward_grid: OnceLock::new(),
            inverse_grid: OnceLock::new(),
        }
    }

    fn invalidate_caches(&mut self) {
        let forward = self.forward_grid.take();
        let inverse = self.inverse_grid.take();
        if forward.is_some() || inverse.is_some() {
            debug!("Dropped cached remap grids");
        }
    }

    /// Maps one rectified pixel to the distorted sensor; the flag is false
    /// for rays behind the camera and for non-finite results.
    pub fn warp_point(&self, rectified: Vector2<f64>) -> (Vector2<f64>, bool) {
        let mut point = rectified + self.pixel_offset;
        if let Some(homography) = &self.homography {
            let q = homography.inverse * Vector3::new(point.x, point.y, 1.0);
            point = Vector2::new(q.x / q.z, q.y / q.z);
        }
        let mut centered = point - self.principal;
        let mut valid = true;
        if let Some(nominal) = &self.nominal_homography {
            let (rotated, in_front) = rotate_ray(&nominal.inverse, centered, self.focal);
            centered = rotated;
            valid &= in_front;
        }

        let mut rr = centered.norm() / self.focal;
        let mut arg = centered.y.atan2(centered.x);
        if let Some(remap) = &self.polar_remap {
            (rr, arg) = remap.forward(rr, arg);
        }
        let radius = self.law.angle_to_distorted_radius(rr.atan());

        let distorted = self.principal + Vector2::new(radius * arg.cos(), radius * arg.sin());
        valid &= distorted.x.is_finite() && distorted.y.is_finite();
        (distorted, valid)
    }

    /// Maps one distorted sensor pixel to the rectified image.
    pub fn dewarp_point(&self, distorted: Vector2<f64>) -> Result<(Vector2<f64>, bool), LensModelError> {
        if self.homography.is_some() {
            return Err(LensModelError::DewarpWithHomography);
        }
        Ok(self.dewarp_point_unchecked(distorted))
    }

    fn dewarp_point_unchecked(&self, distorted: Vector2<f64>) -> (Vector2<f64>, bool) {
        let centered = distorted - self.principal;
        let mut rr = self.law.distorted_radius_to_angle(centered.norm()).tan();
        let mut arg = centered.y.atan2(centered.x);
        if let Some(remap) = &self.polar_remap {
            (rr, arg) = remap.inverse(rr, arg);
        }
        rr *= self.focal;

        let mut centered = Vector2::new(rr * arg.cos(), rr * arg.sin());
        let mut valid = true;
        if let Some(nominal) = &self.nominal_homography {
            let (rotated, in_front) = rotate_ray(&nominal.matrix, centered, self.focal);
            centered = rotated;
            valid &= in_front;
        }

        let rectified = centered + self.principal - self.pixel_offset;
        valid &= rectified.x.is_finite() && rectified.y.is_finite();
        (rectified, valid)
    }

    /// Remap grid over the dewarped image pointing into the distorted sensor image.
    ///
    /// Built on first use and shared until the next mutating call.
    pub fn forward_grid(&self) -> &RemapGrid {
        self.forward_grid.get_or_init(|| {
            RemapGrid::build(self.dewarped_resolution, self.resolution, |p| {
                self.warp_point(p)
            })
        })
    }

    /// Remap grid over the sensor image pointing into the dewarped image.
    ///
    /// # Returns
    ///
    /// * `Result<&RemapGrid, LensModelError>` - `DewarpWithHomography` when the
    ///   lens carries a sensor homography
    pub fn inverse_grid(&self) -> Result<&RemapGrid, LensModelError> {
        if self.homography.is_some() {
            return Err(LensModelError::DewarpWithHomography);
        }
        Ok(self.inverse_grid.get_or_init(|| {
            RemapGrid::build(self.resolution, self.dewarped_resolution, |p| {
                self.dewarp_point_unchecked(p)
            })
        }))
    }
}

/// Rotates a centred pixel through `rotation` in unit-focal ray space.
///
/// Returns the re-projected pixel and whether the rotated ray is in front of the camera.
fn rotate_ray(rotation: &Matrix3<f64>, centered: Vector2<f64>, focal: f64) -> (Vector2<f64>, bool) {
    let ray = rotation * Vector3::new(centered.x / focal, centered.y / focal, 1.0);
    (
        Vector2::new(ray.x / ray.z * focal, ray.y / ray.z * focal),
        ray.z > 0.0,
    )
}

fn map_columns<F>(points: &Matrix2xX<f64>, map: F) -> MappedPixels
where
    F: Fn(Vector2<f64>) -> (Vector2<f64>, bool),
{
    let mut mapped = Matrix2xX::zeros(points.ncols());
    let mut valid = Vec::with_capacity(points.ncols());
    for (i, column) in points.column_iter().enumerate() {
        let (point, ok) = map(Vector2::new(column[0], column[1]));
        mapped.set_column(i, &point);
        valid.push(ok);
    }
    MappedPixels {
        points: mapped,
        valid,
    }
}

impl LensMapping for LensModel {
    fn warp_points(&self, rectified: &Matrix2xX<f64>) -> Result<MappedPixels, LensModelError> {
        Ok(map_columns(rectified, |p| self.warp_point(p)))
    }

    fn dewarp_points(&self, distorted: &Matrix2xX<f64>) -> Result<MappedPixels, LensModelError> {
        if self.homography.is_some() {
            return Err(LensModelError::DewarpWithHomography);
        }
        Ok(map_columns(distorted, |p| self.dewarp_point_unchecked(p)))
    }

    fn intrinsics(&self) -> Intrinsics {
        Intrinsics {
            focal: self.focal,
            cx: self.principal.x,
            cy: self.principal.y,
        }
    }

    fn pixel_offset(&self) -> Vector2<f64> {
        self.pixel_offset
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

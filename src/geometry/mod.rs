//! Ground-plane projection through a lens.
//!
//! World points are expressed in the camera frame with the ground *below* the
//! camera: a point on the floor of a camera mounted `h` units up has `z = -h`.
//! The negative `z` flips the pinhole image, and the negated angle convention
//! of the distortion polynomial flips it back, so both halves of the sign
//! convention have to stay together.

use nalgebra::{Matrix2xX, Matrix3, Matrix3xX, Vector2, Vector3};

use crate::camera::{LensMapping, LensModelError, MappedPixels};

/// Heights passed to [`image_to_world`]: one value for every point or one per point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GroundHeight<'a> {
    Uniform(f64),
    PerPoint(&'a [f64]),
}

impl From<f64> for GroundHeight<'_> {
    fn from(z: f64) -> Self {
        GroundHeight::Uniform(z)
    }
}

impl<'a> From<&'a [f64]> for GroundHeight<'a> {
    fn from(z: &'a [f64]) -> Self {
        GroundHeight::PerPoint(z)
    }
}

impl<'a> From<&'a Vec<f64>> for GroundHeight<'a> {
    fn from(z: &'a Vec<f64>) -> Self {
        GroundHeight::PerPoint(z.as_slice())
    }
}

impl GroundHeight<'_> {
    fn resolve(&self, count: usize) -> Result<Vec<f64>, LensModelError> {
        match self {
            GroundHeight::Uniform(z) => Ok(vec![*z; count]),
            GroundHeight::PerPoint(z) if z.len() == count => Ok(z.to_vec()),
            GroundHeight::PerPoint(z) => Err(LensModelError::PointCountMismatch(count, z.len())),
        }
    }
}

/// Camera-frame points with a per-point validity flag.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldPoints {
    pub points: Matrix3xX<f64>,
    pub valid: Vec<bool>,
}

impl WorldPoints {
    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn point(&self, index: usize) -> Vector3<f64> {
        self.points.column(index).into_owned()
    }
}

/// Projects camera-frame points into the distorted image.
///
/// Points with `z >= 0` are not below the camera and come back invalid.
///
/// # Arguments
///
/// * `lens` - Lens applied after the pinhole projection
/// * `world` - Points in the camera frame, one per column
///
/// # Returns
///
/// * `Result<MappedPixels, LensModelError>` - Distorted pixels with a validity flag per point
pub fn world_to_image<L>(lens: &L, world: &Matrix3xX<f64>) -> Result<MappedPixels, LensModelError>
where
    L: LensMapping + ?Sized,
{
    let k = lens.intrinsics();
    let offset = lens.pixel_offset();

    let mut rectified = Matrix2xX::zeros(world.ncols());
    for (i, p) in world.column_iter().enumerate() {
        rectified.set_column(
            i,
            &Vector2::new(
                k.focal / p[2] * p[0] + k.cx - offset.x,
                k.focal / p[2] * p[1] + k.cy - offset.y,
            ),
        );
    }

    let mut mapped = lens.warp_points(&rectified)?;
    for (valid, p) in mapped.valid.iter_mut().zip(world.column_iter()) {
        *valid &= p[2] < 0.0;
    }
    Ok(mapped)
}

/// Lifts distorted pixels onto the plane at height `z` in the camera frame.
///
/// # Arguments
///
/// * `lens` - Lens used to dewarp the pixels
/// * `distorted` - Distorted pixel coordinates, one per column
/// * `z` - One height for every point, or one height per point
///
/// # Returns
///
/// * `Result<WorldPoints, LensModelError>` - Points on the plane, or
///   `PointCountMismatch` when per-point heights do not match the pixel count
pub fn image_to_world<'a, L>(
    lens: &L,
    distorted: &Matrix2xX<f64>,
    z: impl Into<GroundHeight<'a>>,
) -> Result<WorldPoints, LensModelError>
where
    L: LensMapping + ?Sized,
{
    let heights = z.into().resolve(distorted.ncols())?;
    let rectified = lens.dewarp_points(distorted)?;
    let k = lens.intrinsics();
    let offset = lens.pixel_offset();

    let mut points = Matrix3xX::zeros(distorted.ncols());
    let mut valid = Vec::with_capacity(distorted.ncols());
    for (i, z) in heights.into_iter().enumerate() {
        let u = rectified.points[(0, i)];
        let v = rectified.points[(1, i)];
        let p = Vector3::new(
            z / k.focal * (u - k.cx + offset.x),
            z / k.focal * (v - k.cy + offset.y),
            z,
        );
        valid.push(rectified.valid[i] && p.iter().all(|c| c.is_finite()));
        points.set_column(i, &p);
    }
    Ok(WorldPoints { points, valid })
}

/// Rotation `Rx * Ry * Rz` with angles in radians.
pub fn rotmat(theta_x: f64, theta_y: f64, theta_z: f64) -> Matrix3<f64> {
    rot_x(theta_x) * rot_y(theta_y) * rot_z(theta_z)
}

/// Rotation `Rz * Ry * Rx` with angles in radians.
pub fn rotmat_xyz(theta_x: f64, theta_y: f64, theta_z: f64) -> Matrix3<f64> {
    rot_z(theta_z) * rot_y(theta_y) * rot_x(theta_x)
}

fn rot_x(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

// Ry keeps the opposite handedness to Rx and Rz.
fn rot_y(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(c, 0.0, -s, 0.0, 1.0, 0.0, s, 0.0, c)
}

fn rot_z(theta: f64) -> Matrix3<f64> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

/// Generate a grid of sample points that are evenly distributed across the image
///
/// # Arguments
///
/// * `width` - The width of the image in pixels
/// * `height` - The height of the image in pixels
/// * `n` - The approximate number of points to generate
///
/// # Returns
///
/// A matrix whose columns are the pixel coordinates of the cell centres
pub fn sample_points(width: f64, height: f64, n: usize) -> Matrix2xX<f64> {
    // Calculate the number of cells in each dimension
    let num_cells_x = ((n as f64 * (width / height)).sqrt().round() as usize).max(1);
    let num_cells_y = ((n as f64 * (height / width)).sqrt().round() as usize).max(1);

    let cell_width = width / num_cells_x as f64;
    let cell_height = height / num_cells_y as f64;

    let mut points = Matrix2xX::zeros(num_cells_x * num_cells_y);
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let x = (j as f64 + 0.5) * cell_width;
            let y = (i as f64 + 0.5) * cell_height;
            points.set_column(i * num_cells_x + j, &Vector2::new(x, y));
        }
    }
    points
}

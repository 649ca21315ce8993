//! Radial distortion laws mapping a distorted pixel radius to a ray angle and back.
//!
//! The calibrated fisheye law is a polynomial in the *physical* radius on the
//! sensor (millimetres) that returns the ray angle in degrees, negated: for a
//! real lens the linear coefficient is negative, so positive radii map to
//! positive angles after the sign flip. The polynomial has no closed-form
//! inverse; [`RadialPolynomial::invert`] runs a fixed-point iteration on the
//! linear term and reports the residual so callers can reject non-converged
//! radii.

use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

use crate::camera::LensModelError;

/// Fixed iteration budget for inverting the distortion polynomial.
pub const ANGLE_TO_RADIUS_ITERATIONS: usize = 20;

/// Largest radius error (pixels) accepted as a converged inversion.
///
/// The error is the polynomial residual divided by the linear slope, so it is
/// comparable across lenses with different coefficient magnitudes.
pub const ANGLE_TO_RADIUS_TOLERANCE_PX: f64 = 1e-2;

/// Result of inverting the distortion polynomial for a single angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusInversion {
    /// Distorted radius in pixels. May be non-finite when the iteration diverged.
    pub radius: f64,
    /// `|poly(radius) - target|` in degrees after the last iteration.
    pub residual: f64,
    /// Residual expressed as a radius error in pixels.
    pub radius_error: f64,
}

impl RadiusInversion {
    /// Whether the radius is finite and within [`ANGLE_TO_RADIUS_TOLERANCE_PX`].
    pub fn is_converged(&self) -> bool {
        self.radius.is_finite() && self.radius_error <= ANGLE_TO_RADIUS_TOLERANCE_PX
    }
}

/// Calibrated fisheye polynomial: coefficients in ascending degree order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadialPolynomial {
    coefficients: Vec<f64>,
    /// Millimetres per (possibly rescaled) pixel: `pixel_width * image_scale`.
    scale: f64,
}

impl RadialPolynomial {
    /// Creates a distortion law from its calibrated coefficients.
    ///
    /// # Arguments
    ///
    /// * `coefficients` - Polynomial coefficients in ascending degree order.
    /// * `pixel_width` - Physical pixel size in millimetres.
    /// * `image_scale` - Ratio of the sensor width to the image width.
    ///
    /// # Errors
    ///
    /// Returns [`LensModelError::InvalidParams`] for fewer than two
    /// coefficients, a zero linear term, non-finite coefficients or a
    /// non-positive pixel scale.
    pub fn new(
        coefficients: Vec<f64>,
        pixel_width: f64,
        image_scale: f64,
    ) -> Result<Self, LensModelError> {
        if coefficients.len() < 2 {
            return Err(LensModelError::InvalidParams(format!(
                "distortion polynomial needs at least 2 coefficients, got {}",
                coefficients.len()
            )));
        }
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(LensModelError::InvalidParams(
                "distortion polynomial coefficients must be finite".to_string(),
            ));
        }
        if coefficients[1] == 0.0 {
            return Err(LensModelError::InvalidParams(
                "linear distortion coefficient must be non-zero".to_string(),
            ));
        }
        let scale = pixel_width * image_scale;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(LensModelError::InvalidParams(format!(
                "pixel_width * image_scale must be positive, got {scale}"
            )));
        }
        Ok(RadialPolynomial {
            coefficients,
            scale,
        })
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// Evaluates `sum(c[i] * x^i)` with Horner's scheme. `x` is in millimetres.
    fn evaluate(&self, x: f64) -> f64 {
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }

    /// Ray angle (radians) of a distorted radius given in pixels.
    pub fn distorted_radius_to_angle(&self, radius: f64) -> f64 {
        -self.evaluate(radius * self.scale).to_radians()
    }

    /// Inverts the polynomial for `angle` (radians) and reports the residual.
    pub fn invert(&self, angle: f64) -> RadiusInversion {
        let target = -angle.to_degrees();
        let linear = self.coefficients[1];
        let mut x = (target - self.coefficients[0]) / linear;
        for _ in 0..ANGLE_TO_RADIUS_ITERATIONS {
            let nonlinear = self.evaluate(x) - linear * x;
            x = (target - nonlinear) / linear;
        }
        let residual = (self.evaluate(x) - target).abs();
        RadiusInversion {
            radius: x / self.scale,
            residual,
            radius_error: residual / linear.abs() / self.scale,
        }
    }

    /// Distorted radius in pixels for a ray angle, or NaN if the inversion did not converge.
    pub fn angle_to_distorted_radius(&self, angle: f64) -> f64 {
        let inversion = self.invert(angle);
        if inversion.is_converged() {
            inversion.radius
        } else {
            f64::NAN
        }
    }
}

/// The angle/radius law a lens uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RadialLaw {
    /// Calibrated fisheye polynomial.
    Polynomial(RadialPolynomial),
    /// Ideal pinhole sensor: `radius = focal * tan(angle)`.
    Rectilinear { focal: f64 },
}

impl RadialLaw {
    pub fn distorted_radius_to_angle(&self, radius: f64) -> f64 {
        match self {
            RadialLaw::Polynomial(poly) => poly.distorted_radius_to_angle(radius),
            RadialLaw::Rectilinear { focal } => (radius / focal).atan(),
        }
    }

    pub fn angle_to_distorted_radius(&self, angle: f64) -> f64 {
        match self {
            RadialLaw::Polynomial(poly) => poly.angle_to_distorted_radius(angle),
            RadialLaw::Rectilinear { focal } => {
                if angle.abs() >= FRAC_PI_2 {
                    f64::NAN
                } else {
                    focal * angle.tan()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn m3106() -> RadialPolynomial {
        RadialPolynomial::new(
            vec![-0.02587, -23.95602, 0.00902, -0.02819, -0.00158],
            2.0e-3,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn test_radius_angle_round_trip() {
        let poly = m3106();
        for radius in [0.0, 1.0, 50.0, 250.0, 600.0, 1000.0, 1300.0] {
            let angle = poly.distorted_radius_to_angle(radius);
            let inversion = poly.invert(angle);
            assert!(inversion.is_converged(), "radius {radius} did not converge");
            assert!(
                (inversion.radius - radius).abs() < 1e-6,
                "radius {} came back as {}",
                radius,
                inversion.radius
            );
        }
    }

    #[test]
    fn test_angle_sign_convention() {
        // Real lenses have a negative linear term, so outward radii give positive angles.
        let poly = m3106();
        let angle = poly.distorted_radius_to_angle(500.0);
        assert!(angle > 0.0);
        assert_relative_eq!(
            angle,
            (23.95602_f64 + 0.02587 - 0.00902 + 0.02819 + 0.00158).to_radians(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_linear_law_is_exact() {
        let poly = RadialPolynomial::new(vec![0.0, 1.0, 0.0, 0.0, 0.0], 1.0, 1.0).unwrap();
        let inversion = poly.invert(-0.25);
        assert_relative_eq!(inversion.radius, 0.25_f64.to_degrees(), epsilon = 1e-12);
        assert!(inversion.residual < 1e-12);
    }

    #[test]
    fn test_divergence_is_reported_as_nan() {
        let poly = RadialPolynomial::new(vec![0.0, 1e-3, 1.0], 1.0, 1.0).unwrap();
        let inversion = poly.invert(-0.5);
        assert!(!inversion.is_converged());
        assert!(poly.angle_to_distorted_radius(-0.5).is_nan());
    }

    #[test]
    fn test_tolerance_is_measured_in_pixels() {
        // M3058 inverts 791 px to within a few thousandths of a pixel, even
        // though the residual in degrees exceeds 1e-4.
        let poly = RadialPolynomial::new(
            vec![
                6.926779731246203,
                -57.902462008677,
                -13.657537082085232,
                6.265501435429633,
                2.8823897399751908,
            ],
            1.85e-3,
            1.0,
        )
        .unwrap();
        let angle = poly.distorted_radius_to_angle(791.0);
        let inversion = poly.invert(angle);
        assert!(inversion.residual > 1e-4);
        assert!(inversion.radius_error < ANGLE_TO_RADIUS_TOLERANCE_PX);
        assert!(inversion.is_converged());
        assert!((poly.angle_to_distorted_radius(angle) - 791.0).abs() < 0.01);

        for radius in (0..=700).step_by(50) {
            let radius = radius as f64;
            let back = poly.angle_to_distorted_radius(poly.distorted_radius_to_angle(radius));
            assert!((back - radius).abs() < 1e-6, "radius {radius} came back as {back}");
        }
    }

    #[test]
    fn test_rejects_degenerate_polynomials() {
        assert!(RadialPolynomial::new(vec![1.0], 1.0, 1.0).is_err());
        assert!(RadialPolynomial::new(vec![0.0, 0.0, 1.0], 1.0, 1.0).is_err());
        assert!(RadialPolynomial::new(vec![0.0, f64::NAN], 1.0, 1.0).is_err());
        assert!(RadialPolynomial::new(vec![0.0, 1.0], 0.0, 1.0).is_err());
    }

    #[test]
    fn test_rectilinear_law() {
        let law = RadialLaw::Rectilinear { focal: 500.0 };
        let angle = law.distorted_radius_to_angle(250.0);
        assert_relative_eq!(angle, 0.5_f64.atan(), epsilon = 1e-12);
        assert_relative_eq!(law.angle_to_distorted_radius(angle), 250.0, epsilon = 1e-9);
        assert!(law.angle_to_distorted_radius(FRAC_PI_2).is_nan());
    }
}

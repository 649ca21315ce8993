//! Generic remapping hook applied in polar ray space.
//!
//! A [`PolarRemap`] always carries both directions: `forward` runs while
//! warping (after the pinhole step, before distortion) and `inverse` runs
//! while dewarping. Both take and return `(normalized radius, angle)`.

use std::fmt;
use std::sync::Arc;

use crate::camera::LensModelError;

pub type PolarFn = Arc<dyn Fn(f64, f64) -> (f64, f64) + Send + Sync>;

/// Polynomial lengths accepted by [`PolarRemap::from_polynomials`].
pub const SUPPORTED_REMAP_LENGTHS: [usize; 3] = [5, 7, 9];

#[derive(Clone)]
pub struct PolarRemap {
    forward: PolarFn,
    inverse: PolarFn,
}

impl PolarRemap {
    pub fn new<F, G>(forward: F, inverse: G) -> Self
    where
        F: Fn(f64, f64) -> (f64, f64) + Send + Sync + 'static,
        G: Fn(f64, f64) -> (f64, f64) + Send + Sync + 'static,
    {
        PolarRemap {
            forward: Arc::new(forward),
            inverse: Arc::new(inverse),
        }
    }

    /// Radius-only remap from a polynomial pair (ascending degree order).
    ///
    /// Both polynomials must have the same length, one of 5, 7 or 9.
    pub fn from_polynomials(poly: &[f64], poly_inv: &[f64]) -> Result<Self, LensModelError> {
        if poly.len() != poly_inv.len() {
            return Err(LensModelError::PolynomialLengthMismatch(
                poly.len(),
                poly_inv.len(),
            ));
        }
        if !SUPPORTED_REMAP_LENGTHS.contains(&poly.len()) {
            return Err(LensModelError::UnsupportedPolynomialDegree(poly.len()));
        }
        let forward = poly.to_vec();
        let inverse = poly_inv.to_vec();
        Ok(PolarRemap::new(
            move |rr, arg| (horner(&forward, rr), arg),
            move |rr, arg| (horner(&inverse, rr), arg),
        ))
    }

    pub fn forward(&self, radius: f64, angle: f64) -> (f64, f64) {
        (self.forward)(radius, angle)
    }

    pub fn inverse(&self, radius: f64, angle: f64) -> (f64, f64) {
        (self.inverse)(radius, angle)
    }
}

impl fmt::Debug for PolarRemap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolarRemap [forward, inverse]")
    }
}

fn horner(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_supported_lengths() {
        for len in SUPPORTED_REMAP_LENGTHS {
            let mut poly = vec![0.0; len];
            poly[1] = 1.0;
            assert!(PolarRemap::from_polynomials(&poly, &poly).is_ok());
        }
    }

    #[test]
    fn test_unsupported_length_is_config_error() {
        let poly = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        assert!(matches!(
            PolarRemap::from_polynomials(&poly, &poly),
            Err(LensModelError::UnsupportedPolynomialDegree(6))
        ));
        let short = vec![0.0, 1.0, 0.0, 0.0, 0.0];
        let long = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(matches!(
            PolarRemap::from_polynomials(&short, &long),
            Err(LensModelError::PolynomialLengthMismatch(5, 7))
        ));
    }

    #[test]
    fn test_polynomial_remap_keeps_angle() {
        let remap = PolarRemap::from_polynomials(
            &[0.0, 2.0, 0.0, 0.0, 0.0],
            &[0.0, 0.5, 0.0, 0.0, 0.0],
        )
        .unwrap();
        let (rr, arg) = remap.forward(0.3, 1.2);
        assert_relative_eq!(rr, 0.6, epsilon = 1e-12);
        assert_relative_eq!(arg, 1.2);
        let (back, arg_back) = remap.inverse(rr, arg);
        assert_relative_eq!(back, 0.3, epsilon = 1e-12);
        assert_relative_eq!(arg_back, 1.2);
    }
}

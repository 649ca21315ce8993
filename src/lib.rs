//! LensDist Tools Library
//!
//! Fisheye lens distortion for synthetic multi-camera scenes. The library provides:
//! - A calibrated polynomial fisheye lens model with forward (warp) and inverse
//!   (dewarp) pixel mapping, sensor/nominal homographies and polar remapping
//! - Named lens presets and a stable JSON/YAML lens description format
//! - Dense remap grids and image resampling through them
//! - Ground-plane projection between world points and distorted pixels
//! - Usable field-of-view polygons and their intersection with walkable regions

pub mod camera;
pub mod fov;
pub mod geometry;
pub mod util;

// Re-export commonly used types
pub use camera::{
    Intrinsics, LensDescription, LensMapping, LensModel, LensModelError, LensOptions,
    LensParameters, LensPreset, LensUpdate, MappedPixels, PinholeCamera, PolarRemap, RemapGrid,
    Resolution,
};

pub use fov::{compute_usable_fov, intersect_with_walkable, VisibleRegion};
pub use geometry::{image_to_world, rotmat, rotmat_xyz, world_to_image, WorldPoints};

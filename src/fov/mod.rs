//! Ground-plane field of view and visible walkable regions.
//!
//! The usable field of view of a camera is the part of the floor that is both
//! inside the sensor footprint and far enough from the frame edge that a
//! standing subject is not cut off at the top. It is intersected with
//! externally supplied walkable polygons to get the region where subjects can
//! be placed and still be seen.

use geo::{Area, BooleanOps, Coord, Intersects, Line, LineString, MultiPolygon, Polygon};
use log::{debug, info, warn};
use nalgebra::{Matrix2xX, Vector2};

use crate::camera::{LensMapping, LensModelError};
use crate::geometry::image_to_world;

/// Height of a standing subject, in world units.
pub const SUBJECT_HEIGHT: f64 = 2.0;

fn empty_polygon() -> Polygon<f64> {
    Polygon::new(LineString::new(vec![]), vec![])
}

/// Projects the image border onto the horizontal plane at height `z`.
///
/// The corners are mirrored horizontally first: world x runs against pixel
/// columns. Corners that cannot be lifted are dropped; `None` when fewer
/// than three remain.
pub fn ground_footprint<L>(lens: &L, z: f64) -> Result<Option<Polygon<f64>>, LensModelError>
where
    L: LensMapping + ?Sized,
{
    let resolution = lens.resolution();
    let (w, h) = (resolution.width as f64, resolution.height as f64);
    let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
    let mirrored = Matrix2xX::from_columns(
        &corners
            .iter()
            .map(|(u, v)| Vector2::new(w - u, *v))
            .collect::<Vec<_>>(),
    );

    let world = image_to_world(lens, &mirrored, z)?;
    let ring: Vec<Coord<f64>> = (0..world.len())
        .filter(|i| world.valid[*i])
        .map(|i| Coord {
            x: world.points[(0, i)],
            y: world.points[(1, i)],
        })
        .collect();
    if ring.len() < 3 {
        debug!(
            "Only {} border corners reach the plane z = {z}, no footprint",
            ring.len()
        );
        return Ok(None);
    }
    Ok(Some(Polygon::new(LineString::new(ring), vec![])))
}

/// Floor region where a standing subject is fully inside the frame.
///
/// Intersects the sensor footprint on the floor with the footprint at
/// [`SUBJECT_HEIGHT`] above it. The result is empty rather than an error when
/// nothing qualifies; if the intersection falls apart into pieces the largest
/// one is kept.
pub fn compute_usable_fov<L>(lens: &L, camera_height: f64) -> Result<Polygon<f64>, LensModelError>
where
    L: LensMapping + ?Sized,
{
    if !camera_height.is_finite() || camera_height <= 0.0 {
        return Err(LensModelError::InvalidParams(format!(
            "camera height must be positive, got {camera_height}"
        )));
    }
    if camera_height <= SUBJECT_HEIGHT {
        warn!("Camera at height {camera_height} is not above a standing subject");
        return Ok(empty_polygon());
    }

    let floor = ground_footprint(lens, -camera_height)?;
    let head = ground_footprint(lens, -camera_height + SUBJECT_HEIGHT)?;
    let (Some(floor), Some(head)) = (floor, head) else {
        return Ok(empty_polygon());
    };

    let usable = floor
        .intersection(&head)
        .into_iter()
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))
        .unwrap_or_else(empty_polygon);
    info!(
        "Usable field of view at height {camera_height}: area {:.3} of {:.3} footprint",
        usable.unsigned_area(),
        floor.unsigned_area()
    );
    Ok(usable)
}

fn ring_is_simple(polygon: &Polygon<f64>) -> bool {
    let lines: Vec<Line<f64>> = polygon
        .exterior()
        .lines()
        .filter(|l| l.start != l.end)
        .collect();
    let n = lines.len();
    for i in 0..n {
        for j in (i + 2)..n {
            // First and last edge share the closing vertex.
            if i == 0 && j == n - 1 {
                continue;
            }
            if lines[i].intersects(&lines[j]) {
                return false;
            }
        }
    }
    true
}

fn polygons_overlap(polygons: &[Polygon<f64>]) -> bool {
    for (i, a) in polygons.iter().enumerate() {
        for b in &polygons[i + 1..] {
            if a.intersection(b).unsigned_area() > 0.0 {
                return true;
            }
        }
    }
    false
}

/// Turns raw walkable rings into a valid multipolygon.
///
/// Rings with fewer than three vertices are ignored. Self-intersecting rings
/// and overlapping polygons are resolved by unioning everything together.
pub fn repair_walkable(walkable: &[Vec<(f64, f64)>]) -> MultiPolygon<f64> {
    let polygons: Vec<Polygon<f64>> = walkable
        .iter()
        .filter(|ring| ring.len() >= 3)
        .map(|ring| Polygon::new(LineString::from(ring.clone()), vec![]))
        .collect();

    if polygons.iter().all(ring_is_simple) && !polygons_overlap(&polygons) {
        return MultiPolygon::new(polygons);
    }

    warn!(
        "Walkable region with {} polygons is not valid, repairing",
        polygons.len()
    );
    polygons
        .into_iter()
        .fold(MultiPolygon::new(vec![]), |acc, polygon| {
            acc.union(&MultiPolygon::new(vec![polygon]))
        })
}

/// Walkable area a camera can see, as a flat list of simple polygons.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleRegion {
    polygons: MultiPolygon<f64>,
}

impl VisibleRegion {
    pub fn polygons(&self) -> &[Polygon<f64>] {
        &self.polygons.0
    }

    pub fn len(&self) -> usize {
        self.polygons.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.0.is_empty()
    }

    pub fn area(&self) -> f64 {
        self.polygons.unsigned_area()
    }

    /// Closed exterior ring of every polygon, first vertex repeated at the end.
    pub fn boundaries(&self) -> Vec<Vec<(f64, f64)>> {
        self.polygons
            .iter()
            .map(|p| p.exterior().coords().map(|c| (c.x, c.y)).collect())
            .collect()
    }
}

/// Intersects the field of view with the walkable region, repairing it first if needed.
pub fn intersect_with_walkable(fov: &Polygon<f64>, walkable: &[Vec<(f64, f64)>]) -> VisibleRegion {
    let walkable = repair_walkable(walkable);
    let fov = MultiPolygon::new(vec![fov.clone()]);
    let polygons: MultiPolygon<f64> = walkable
        .intersection(&fov)
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .collect();
    debug!(
        "Visible walkable region: {} polygons, area {:.3}",
        polygons.0.len(),
        polygons.unsigned_area()
    );
    VisibleRegion { polygons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{LensModel, LensOptions, LensParameters, Resolution};
    use std::f64::consts::PI;

    fn shoelace(ring: &[(f64, f64)]) -> f64 {
        let mut sum = 0.0;
        for i in 0..ring.len() {
            let (x0, y0) = ring[i];
            let (x1, y1) = ring[(i + 1) % ring.len()];
            sum += x0 * y1 - x1 * y0;
        }
        sum.abs() / 2.0
    }

    fn square(x0: f64, y0: f64, size: f64) -> Vec<(f64, f64)> {
        vec![
            (x0, y0),
            (x0 + size, y0),
            (x0 + size, y0 + size),
            (x0, y0 + size),
        ]
    }

    fn triangle_fov() -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![(5.0, -5.0), (15.0, 5.0), (5.0, 15.0)]),
            vec![],
        )
    }

    fn linear_lens() -> LensModel {
        let focal = 800.0;
        LensModel::with_options(
            LensParameters::new(vec![0.0, 1.0, 0.0, 0.0, 0.0], 1000.0, 180.0 / (PI * focal)),
            Resolution::new(1000, 1000),
            LensOptions {
                focal: Some(focal),
                ..LensOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_walkable_overlap_area() {
        let region = intersect_with_walkable(&triangle_fov(), &[square(0.0, 0.0, 10.0)]);
        assert_eq!(region.len(), 1);
        let boundary = &region.boundaries()[0];
        assert!((shoelace(boundary) - 50.0).abs() < 1e-6);
        assert!((region.area() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_intersection_is_idempotent() {
        let fov = triangle_fov();
        let walkable = vec![square(0.0, 0.0, 10.0), square(6.0, 11.0, 2.0)];
        let first = intersect_with_walkable(&fov, &walkable);
        assert_eq!(first.len(), 2);
        assert!((first.area() - 53.5).abs() < 1e-6);

        let second = intersect_with_walkable(&fov, &first.boundaries());
        assert_eq!(first.len(), second.len());
        assert!((first.area() - second.area()).abs() < 1e-6);
    }

    #[test]
    fn test_multi_polygon_result_is_flattened() {
        let fov = Polygon::new(LineString::from(square(-100.0, -100.0, 200.0)), vec![]);
        let region = intersect_with_walkable(&fov, &[square(0.0, 0.0, 1.0), square(5.0, 5.0, 2.0)]);
        assert_eq!(region.len(), 2);
        assert!((region.area() - 5.0).abs() < 1e-6);
        for boundary in region.boundaries() {
            assert_eq!(boundary.first(), boundary.last());
        }
    }

    #[test]
    fn test_disjoint_walkable_is_empty() {
        let region = intersect_with_walkable(&triangle_fov(), &[square(100.0, 100.0, 5.0)]);
        assert!(region.is_empty());
        assert_eq!(region.area(), 0.0);
    }

    #[test]
    fn test_bowtie_is_repaired() {
        let bowtie = vec![(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 10.0)];
        let repaired = repair_walkable(&[bowtie.clone()]);
        assert!(!repaired.0.is_empty());
        assert!((repaired.unsigned_area() - 50.0).abs() < 1e-6);

        let fov = Polygon::new(LineString::from(square(-1.0, -1.0, 12.0)), vec![]);
        let region = intersect_with_walkable(&fov, &[bowtie]);
        assert!(!region.is_empty());
        assert!((region.area() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_overlapping_walkable_polygons_are_merged() {
        let repaired = repair_walkable(&[square(0.0, 0.0, 2.0), square(1.0, 0.0, 2.0)]);
        assert_eq!(repaired.0.len(), 1);
        assert!((repaired.unsigned_area() - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_valid_walkable_is_kept() {
        let walkable = vec![square(0.0, 0.0, 1.0), square(2.0, 0.0, 1.0), vec![(0.0, 0.0)]];
        let repaired = repair_walkable(&walkable);
        assert_eq!(repaired.0.len(), 2);
    }

    #[test]
    fn test_usable_fov_is_inside_footprint() {
        let lens = linear_lens();
        let height = 5.0;
        let fov = compute_usable_fov(&lens, height).unwrap();
        let floor = ground_footprint(&lens, -height).unwrap().unwrap();
        let head = ground_footprint(&lens, -height + SUBJECT_HEIGHT)
            .unwrap()
            .unwrap();

        assert!(fov.unsigned_area() > 0.0);
        let inside = fov.intersection(&floor).unsigned_area();
        assert!((inside - fov.unsigned_area()).abs() < 1e-5 * fov.unsigned_area());

        // Footprints of a centred lens are nested, so the head plane wins.
        assert!((fov.unsigned_area() - head.unsigned_area()).abs() < 1e-5 * head.unsigned_area());
        let scale = (height - SUBJECT_HEIGHT) / height;
        assert!(
            (head.unsigned_area() - floor.unsigned_area() * scale * scale).abs()
                < 1e-5 * floor.unsigned_area()
        );
    }

    #[test]
    fn test_footprint_is_centred_under_camera() {
        let lens = linear_lens();
        let floor = ground_footprint(&lens, -3.0).unwrap().unwrap();
        let coords: Vec<Coord<f64>> = floor.exterior().coords().cloned().collect();
        let (sx, sy) = coords[..4]
            .iter()
            .fold((0.0, 0.0), |(sx, sy), c| (sx + c.x, sy + c.y));
        assert!(sx.abs() < 1e-6);
        assert!(sy.abs() < 1e-6);
    }

    #[test]
    fn test_low_camera_has_empty_fov() {
        let lens = linear_lens();
        let fov = compute_usable_fov(&lens, 1.5).unwrap();
        assert_eq!(fov.unsigned_area(), 0.0);
        assert!(compute_usable_fov(&lens, -1.0).is_err());
    }
}

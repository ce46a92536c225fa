use super::distance::{is_valid_coordinate, METERS_PER_DEGREE};
use super::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const MIN_RESOLUTION: u8 = 1;
pub const MAX_RESOLUTION: u8 = 12;

/// Largest disk radius a scope may ask for; (2r+1)² cells are enumerated
pub const MAX_DISK_RADIUS: u32 = 64;

/// Safety factor applied when matching a cell size to a search distance
const BUCKET_MARGIN: f64 = 1.1;

/// Resolution-tagged cell identifier: a geohash whose length is the
/// resolution. Cells of one resolution tile the sphere without gaps or
/// overlaps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpatialCell(String);

impl SpatialCell {
    /// Parse an existing geohash
    pub fn parse(hash: &str) -> Result<Self, CoreError> {
        let resolution = u8::try_from(hash.len()).unwrap_or(u8::MAX);
        check_resolution(resolution)?;
        geohash::decode(hash).map_err(|e| CoreError::InvalidCell(format!("{}: {:?}", hash, e)))?;
        Ok(Self(hash.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resolution(&self) -> u8 {
        self.0.len() as u8
    }
}

impl std::fmt::Display for SpatialCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_resolution(resolution: u8) -> Result<(), CoreError> {
    if (MIN_RESOLUTION..=MAX_RESOLUTION).contains(&resolution) {
        Ok(())
    } else {
        Err(CoreError::InvalidResolution(resolution))
    }
}

/// Map a coordinate to its cell at `resolution`
pub fn cell_of(lat: f64, lon: f64, resolution: u8) -> Result<SpatialCell, CoreError> {
    check_resolution(resolution)?;
    if !is_valid_coordinate(lat, lon) {
        return Err(CoreError::InvalidCoordinate { lat, lon });
    }

    geohash::encode(geohash::Coord { x: lon, y: lat }, resolution as usize)
        .map(SpatialCell)
        .map_err(|_| CoreError::InvalidCoordinate { lat, lon })
}

/// Cell extent in degrees as `(lon_span, lat_span)`
pub fn cell_span_degrees(resolution: u8) -> (f64, f64) {
    let bits = 5 * resolution as i32;
    let lon_bits = (bits + 1) / 2;
    let lat_bits = bits / 2;
    (360.0 / 2f64.powi(lon_bits), 180.0 / 2f64.powi(lat_bits))
}

/// Approximate `(width, height)` of a cell in meters at `latitude`
pub fn approximate_cell_size_meters(resolution: u8, latitude: f64) -> (f64, f64) {
    let (lon_span, lat_span) = cell_span_degrees(resolution);
    let width = lon_span * METERS_PER_DEGREE * latitude.to_radians().cos().abs();
    (width, lat_span * METERS_PER_DEGREE)
}

/// Finest resolution whose cells are at least `distance_m` wide and tall
/// for every latitude up to `max_abs_latitude`.
///
/// Two points closer than `distance_m` then sit in the same or adjacent
/// cells. `None` when even resolution 1 is too small (polar data).
pub fn bucket_resolution(distance_m: f64, max_abs_latitude: f64) -> Option<u8> {
    if !distance_m.is_finite() || distance_m < 0.0 {
        return None;
    }
    let needed = distance_m * BUCKET_MARGIN;
    (MIN_RESOLUTION..=MAX_RESOLUTION).rev().find(|&resolution| {
        let (width, height) = approximate_cell_size_meters(resolution, max_abs_latitude);
        width >= needed && height >= needed
    })
}

#[inline]
fn wrap_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// All cells within `radius_in_cells` grid steps of `cell`, including `cell`.
///
/// Steps are 8-connected, so the disk is the (2r+1)² block of cells around
/// the center. Longitude wraps at the antimeridian; rows past a pole are
/// dropped. Radii are grid steps, not meters; scopes keep them at or below
/// [`MAX_DISK_RADIUS`].
pub fn disk_around(cell: &SpatialCell, radius_in_cells: u32) -> HashSet<SpatialCell> {
    let mut disk = HashSet::new();
    disk.insert(cell.clone());

    let Ok((center, lon_err, lat_err)) = geohash::decode(cell.as_str()) else {
        return disk;
    };
    let lat_step = lat_err * 2.0;
    let lon_step = lon_err * 2.0;
    let radius = radius_in_cells as i64;
    let resolution = cell.as_str().len();

    for dy in -radius..=radius {
        let lat = center.y + dy as f64 * lat_step;
        if !(-90.0..=90.0).contains(&lat) {
            continue;
        }
        for dx in -radius..=radius {
            let lon = wrap_longitude(center.x + dx as f64 * lon_step);
            if let Ok(hash) = geohash::encode(geohash::Coord { x: lon, y: lat }, resolution) {
                disk.insert(SpatialCell(hash));
            }
        }
    }

    disk
}

/// Chebyshev grid distance between two cells of the same resolution
pub fn cell_steps(a: &SpatialCell, b: &SpatialCell) -> Option<u32> {
    if a.resolution() != b.resolution() {
        return None;
    }
    let (ca, lon_err, lat_err) = geohash::decode(a.as_str()).ok()?;
    let (cb, _, _) = geohash::decode(b.as_str()).ok()?;

    let dy = ((cb.y - ca.y) / (lat_err * 2.0)).round().abs();
    let dx = (wrap_longitude(cb.x - ca.x) / (lon_err * 2.0)).round().abs();
    Some(dx.max(dy) as u32)
}

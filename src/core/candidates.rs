use super::distance::{haversine_distance, is_valid_coordinate};
use super::error::CoreError;
use super::geofence::{filter_within_polygon, RegionPolygon};
use super::spatial::{bucket_resolution, cell_of, cell_steps, disk_around, SpatialCell, MAX_DISK_RADIUS};
use crate::models::{CandidatePair, LocationRecord};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Cell-disk scope: every record whose cell lies within `radius_in_cells`
/// grid steps of the center's cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiusScope {
    pub center_lat: f64,
    pub center_lon: f64,
    pub resolution: u8,
    pub radius_in_cells: u32,
}

impl RadiusScope {
    /// Cell of the scope center, or why the scope cannot be used
    pub fn center_cell(&self) -> Result<SpatialCell, CoreError> {
        if self.radius_in_cells > MAX_DISK_RADIUS {
            return Err(CoreError::RadiusTooLarge {
                radius: self.radius_in_cells,
                max: MAX_DISK_RADIUS,
            });
        }
        cell_of(self.center_lat, self.center_lon, self.resolution)
    }
}

/// Records inside a cell disk, ordered by content id.
///
/// Fails only when the scope itself is invalid (bad center, resolution or
/// radius).
/// Records with missing or out-of-range coordinates are skipped.
pub fn generate_by_radius<'a>(
    records: &'a [LocationRecord],
    scope: &RadiusScope,
) -> Result<Vec<&'a LocationRecord>, CoreError> {
    let center = scope.center_cell()?;
    let disk = disk_around(&center, scope.radius_in_cells);

    let scoped = records.iter().filter(|record| {
        let Some((lat, lon)) = record.coordinates() else {
            return false;
        };
        match cell_of(lat, lon, scope.resolution) {
            Ok(cell) => disk.contains(&cell),
            Err(e) => {
                tracing::debug!("Skipping record {}: {}", record.content_id, e);
                false
            }
        }
    });

    Ok(unique_sorted(scoped))
}

/// Records inside `polygon`, ordered by content id
pub fn generate_by_polygon<'a>(
    records: &'a [LocationRecord],
    polygon: &RegionPolygon,
) -> Result<Vec<&'a LocationRecord>, CoreError> {
    Ok(unique_sorted(filter_within_polygon(records, polygon)?))
}

fn unique_sorted<'a>(records: impl Iterator<Item = &'a LocationRecord>) -> Vec<&'a LocationRecord> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for record in records {
        if seen.insert(record.content_id.as_str()) {
            unique.push(record);
        }
    }
    unique.sort_by(|a, b| a.content_id.cmp(&b.content_id));
    unique
}

/// A record that can take part in pairing
struct Located<'a> {
    record: &'a LocationRecord,
    lat: f64,
    lon: f64,
}

fn locate<'a>(records: &[&'a LocationRecord]) -> Vec<Located<'a>> {
    let mut seen = HashSet::new();
    records
        .iter()
        .copied()
        .filter_map(|record| {
            let (lat, lon) = record.coordinates()?;
            if !is_valid_coordinate(lat, lon) || !seen.insert(record.content_id.as_str()) {
                return None;
            }
            Some(Located { record, lat, lon })
        })
        .collect()
}

#[inline]
fn pair_within<'a>(
    x: &Located<'a>,
    y: &Located<'a>,
    max_distance_m: f64,
    spatial_rank: u32,
) -> Option<CandidatePair<'a>> {
    let distance = haversine_distance(x.lat, x.lon, y.lat, y.lon);
    if distance <= max_distance_m {
        CandidatePair::new(x.record, y.record, distance, spatial_rank)
    } else {
        None
    }
}

fn sort_pairs(pairs: &mut [CandidatePair<'_>]) {
    pairs.sort_by(|p, q| {
        p.a.content_id
            .cmp(&q.a.content_id)
            .then_with(|| p.b.content_id.cmp(&q.b.content_id))
    });
}

/// All unordered pairs no further apart than `max_distance_m`.
///
/// Records are bucketed into geohash cells at least `max_distance_m` wide,
/// so only a bucket and its 8 neighbours need exact distance checks.
/// Buckets are processed in parallel. When no cell size fits (polar data or
/// continental distances) the exhaustive O(n²) comparison is used instead.
///
/// The result is sorted by `(a, b)` content id. `spatial_rank` is the grid
/// step count between the two buckets (always 0 in exhaustive mode).
pub fn generate_pairs<'a>(
    records: &[&'a LocationRecord],
    max_distance_m: f64,
) -> Vec<CandidatePair<'a>> {
    if !max_distance_m.is_finite() || max_distance_m < 0.0 {
        return Vec::new();
    }
    let located = locate(records);
    if located.len() < 2 {
        return Vec::new();
    }

    let max_abs_lat = located.iter().map(|l| l.lat.abs()).fold(0.0, f64::max);
    let Some(resolution) = bucket_resolution(max_distance_m, max_abs_lat) else {
        tracing::info!(
            "No bucket size fits {} m at |lat| {:.2}; comparing {} records exhaustively",
            max_distance_m,
            max_abs_lat,
            located.len()
        );
        return exhaustive(&located, max_distance_m);
    };

    let mut buckets: HashMap<SpatialCell, Vec<usize>> = HashMap::new();
    for (index, l) in located.iter().enumerate() {
        // Coordinates were validated in `locate`
        if let Ok(cell) = cell_of(l.lat, l.lon, resolution) {
            buckets.entry(cell).or_default().push(index);
        }
    }
    tracing::debug!(
        "Bucketed {} records into {} cells at resolution {}",
        located.len(),
        buckets.len(),
        resolution
    );

    let keys: Vec<&SpatialCell> = buckets.keys().collect();
    let mut pairs: Vec<CandidatePair<'a>> = keys
        .par_iter()
        .flat_map_iter(|&cell| {
            let members = &buckets[cell];
            let mut found = Vec::new();

            for (i, &x) in members.iter().enumerate() {
                for &y in &members[i + 1..] {
                    found.extend(pair_within(&located[x], &located[y], max_distance_m, 0));
                }
            }

            // Each neighbouring bucket pair is visited once, from its smaller cell
            for neighbour in disk_around(cell, 1) {
                if neighbour <= *cell {
                    continue;
                }
                let Some(others) = buckets.get(&neighbour) else {
                    continue;
                };
                let rank = cell_steps(cell, &neighbour).unwrap_or(1);
                for &x in members {
                    for &y in others {
                        found.extend(pair_within(&located[x], &located[y], max_distance_m, rank));
                    }
                }
            }

            found
        })
        .collect();

    sort_pairs(&mut pairs);
    pairs
}

/// Reference O(n²) pairing over an already small, pre-scoped set
pub fn generate_pairs_exhaustive<'a>(
    records: &[&'a LocationRecord],
    max_distance_m: f64,
) -> Vec<CandidatePair<'a>> {
    if !max_distance_m.is_finite() || max_distance_m < 0.0 {
        return Vec::new();
    }
    exhaustive(&locate(records), max_distance_m)
}

fn exhaustive<'a>(located: &[Located<'a>], max_distance_m: f64) -> Vec<CandidatePair<'a>> {
    let mut pairs: Vec<CandidatePair<'a>> = located
        .par_iter()
        .enumerate()
        .flat_map_iter(|(i, x)| {
            located[i + 1..]
                .iter()
                .filter_map(move |y| pair_within(x, y, max_distance_m, 0))
        })
        .collect();
    sort_pairs(&mut pairs);
    pairs
}

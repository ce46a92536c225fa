use super::distance::{is_valid_coordinate, is_within_bounding_box};
use super::error::{CoreError, PolygonDefect};
use crate::models::{BoundingBox, LocationRecord};
use geo::algorithm::coordinate_position::{CoordPos, CoordinatePosition};
use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{coord, BoundingRect, Coord, Line, LineString, MultiPolygon, Polygon};

/// A ring of `(lon, lat)` vertices; closed rings repeat the first vertex last
pub type Ring = Vec<(f64, f64)>;

/// Raw rings of one polygon, as delivered by a boundary source
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonRings {
    pub exterior: Ring,
    pub holes: Vec<Ring>,
}

/// Administrative boundary used to scope candidate generation.
///
/// A coordinate on an edge or vertex (holes included) is inside. Malformed
/// polygons fail closed: `contains` answers `false` for every point and the
/// filters return `PolygonMalformed`.
#[derive(Debug, Clone)]
pub struct RegionPolygon {
    name: String,
    shape: MultiPolygon<f64>,
    bounds: Option<BoundingBox>,
    defect: Option<PolygonDefect>,
}

impl RegionPolygon {
    /// Build from one or more polygons. Rings are validated, never repaired.
    pub fn new(name: impl Into<String>, polygons: Vec<PolygonRings>) -> Self {
        let name = name.into();
        let defect = find_defect(&polygons);
        if let Some(defect) = &defect {
            tracing::warn!("Region '{}' is malformed and will match nothing: {}", name, defect);
        }

        let shape = MultiPolygon::new(
            polygons
                .iter()
                .map(|p| {
                    Polygon::new(
                        to_line_string(&p.exterior),
                        p.holes.iter().map(|h| to_line_string(h)).collect(),
                    )
                })
                .collect(),
        );
        let bounds = shape.bounding_rect().map(|rect| BoundingBox {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lon: rect.min().x,
            max_lon: rect.max().x,
        });

        Self {
            name,
            shape,
            bounds,
            defect,
        }
    }

    /// Single exterior ring without holes
    pub fn simple(name: impl Into<String>, exterior: Ring) -> Self {
        Self::new(
            name,
            vec![PolygonRings {
                exterior,
                holes: Vec::new(),
            }],
        )
    }

    /// Axis-aligned box as a closed polygon
    pub fn from_bounding_box(name: impl Into<String>, bbox: &BoundingBox) -> Self {
        Self::simple(
            name,
            vec![
                (bbox.min_lon, bbox.min_lat),
                (bbox.max_lon, bbox.min_lat),
                (bbox.max_lon, bbox.max_lat),
                (bbox.min_lon, bbox.max_lat),
                (bbox.min_lon, bbox.min_lat),
            ],
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defect(&self) -> Option<&PolygonDefect> {
        self.defect.as_ref()
    }

    /// `Err(PolygonMalformed)` when construction found a defect
    pub fn validate(&self) -> Result<(), CoreError> {
        match &self.defect {
            Some(defect) => Err(CoreError::PolygonMalformed {
                name: self.name.clone(),
                defect: defect.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Containment with the boundary counted as inside
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if self.defect.is_some() || !is_valid_coordinate(lat, lon) {
            return false;
        }
        match &self.bounds {
            Some(bounds) if is_within_bounding_box(lat, lon, bounds) => {}
            _ => return false,
        }
        self.shape.coordinate_position(&coord! { x: lon, y: lat }) != CoordPos::Outside
    }
}

/// Free-function form of [`RegionPolygon::contains`]
#[inline]
pub fn contains(polygon: &RegionPolygon, lat: f64, lon: f64) -> bool {
    polygon.contains(lat, lon)
}

/// Records whose coordinates fall inside `polygon`, lazily.
///
/// The iterator is `Clone`, so it can be restarted. Records without
/// coordinates are skipped. A malformed polygon is reported up front.
/// Yielded records borrow `records` only, not the polygon.
pub fn filter_within_polygon<'a, 'p>(
    records: &'a [LocationRecord],
    polygon: &'p RegionPolygon,
) -> Result<impl Iterator<Item = &'a LocationRecord> + Clone + 'p, CoreError>
where
    'a: 'p,
{
    polygon.validate()?;
    Ok(records.iter().filter(move |record| match record.coordinates() {
        Some((lat, lon)) => polygon.contains(lat, lon),
        None => false,
    }))
}

fn to_line_string(ring: &Ring) -> LineString<f64> {
    LineString::new(ring.iter().map(|&(x, y)| coord! { x: x, y: y }).collect())
}

fn find_defect(polygons: &[PolygonRings]) -> Option<PolygonDefect> {
    if polygons.is_empty() {
        return Some(PolygonDefect::Empty);
    }
    polygons
        .iter()
        .flat_map(|p| std::iter::once(&p.exterior).chain(p.holes.iter()))
        .enumerate()
        .find_map(|(index, ring)| ring_defect(index, ring))
}

fn ring_defect(ring_index: usize, ring: &Ring) -> Option<PolygonDefect> {
    if ring.is_empty() {
        return Some(PolygonDefect::Empty);
    }
    if ring.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Some(PolygonDefect::NonFiniteVertex { ring: ring_index });
    }
    if ring.len() < 4 {
        return Some(PolygonDefect::TooFewVertices {
            ring: ring_index,
            vertices: ring.len(),
        });
    }
    if ring.first() != ring.last() {
        return Some(PolygonDefect::Unclosed { ring: ring_index });
    }
    if is_self_intersecting(ring) {
        return Some(PolygonDefect::SelfIntersecting { ring: ring_index });
    }
    None
}

/// Pairwise edge test, O(n²) in the vertex count.
fn is_self_intersecting(ring: &Ring) -> bool {
    let edges: Vec<Line<f64>> = ring
        .windows(2)
        .map(|w| Line::new(Coord::from(w[0]), Coord::from(w[1])))
        .filter(|line| line.start != line.end)
        .collect();
    let n = edges.len();
    if n < 3 {
        return true;
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(edges[i], edges[j]) {
                None => {}
                // Neighbouring edges always share their common vertex
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(LineIntersection::Collinear { intersection })
                    if adjacent && intersection.start == intersection.end => {}
                Some(_) => return true,
            }
        }
    }
    false
}

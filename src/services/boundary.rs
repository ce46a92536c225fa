use crate::core::geofence::{PolygonRings, RegionPolygon, Ring};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading a boundary
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("Failed to read boundary file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported GeoJSON: {0}")]
    Unsupported(String),
}

/// Load the first Polygon/MultiPolygon of a GeoJSON file
pub fn load_region(name: &str, path: impl AsRef<Path>) -> Result<RegionPolygon, BoundaryError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let region = parse_region(name, &text)?;
    tracing::info!("Loaded boundary '{}' from {}", name, path.display());
    Ok(region)
}

/// Parse a FeatureCollection, Feature or bare Geometry.
///
/// Rings are kept exactly as written so defects such as unclosed rings
/// surface through [`RegionPolygon::validate`].
pub fn parse_region(name: &str, geojson: &str) -> Result<RegionPolygon, BoundaryError> {
    let value: Value = serde_json::from_str(geojson)?;
    let polygons = find_polygons(&value)?;
    Ok(RegionPolygon::new(name, polygons))
}

fn find_polygons(value: &Value) -> Result<Vec<PolygonRings>, BoundaryError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BoundaryError::Unsupported("missing \"type\"".into()))?;

    match kind {
        "FeatureCollection" => {
            let features = value
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| BoundaryError::Unsupported("missing \"features\"".into()))?;
            features
                .iter()
                .find_map(|f| find_polygons(f).ok())
                .ok_or_else(|| BoundaryError::Unsupported("no polygon feature".into()))
        }
        "Feature" => {
            let geometry = value
                .get("geometry")
                .ok_or_else(|| BoundaryError::Unsupported("feature without geometry".into()))?;
            find_polygons(geometry)
        }
        "Polygon" => Ok(vec![parse_polygon(coordinates(value)?)?]),
        "MultiPolygon" => coordinates(value)?
            .as_array()
            .ok_or_else(|| BoundaryError::Unsupported("MultiPolygon coordinates".into()))?
            .iter()
            .map(parse_polygon)
            .collect(),
        other => Err(BoundaryError::Unsupported(format!("geometry type {}", other))),
    }
}

fn coordinates(geometry: &Value) -> Result<&Value, BoundaryError> {
    geometry
        .get("coordinates")
        .ok_or_else(|| BoundaryError::Unsupported("geometry without coordinates".into()))
}

fn parse_polygon(value: &Value) -> Result<PolygonRings, BoundaryError> {
    let rings = value
        .as_array()
        .ok_or_else(|| BoundaryError::Unsupported("polygon must be an array of rings".into()))?
        .iter()
        .map(parse_ring)
        .collect::<Result<Vec<Ring>, _>>()?;

    let mut rings = rings.into_iter();
    let exterior = rings
        .next()
        .ok_or_else(|| BoundaryError::Unsupported("polygon without rings".into()))?;
    Ok(PolygonRings {
        exterior,
        holes: rings.collect(),
    })
}

fn parse_ring(value: &Value) -> Result<Ring, BoundaryError> {
    value
        .as_array()
        .ok_or_else(|| BoundaryError::Unsupported("ring must be an array".into()))?
        .iter()
        .map(|position| {
            let lon = position.get(0).and_then(Value::as_f64);
            let lat = position.get(1).and_then(Value::as_f64);
            match (lon, lat) {
                (Some(lon), Some(lat)) => Ok((lon, lat)),
                _ => Err(BoundaryError::Unsupported(format!("bad position {}", position))),
            }
        })
        .collect()
}

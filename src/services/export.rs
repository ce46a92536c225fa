use crate::models::{ClassifiedRecord, DuplicateTier};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Group classified records by tier. Every tier is present, possibly empty.
pub fn partition_by_tier(
    records: impl IntoIterator<Item = ClassifiedRecord>,
) -> BTreeMap<DuplicateTier, Vec<ClassifiedRecord>> {
    let mut buckets: BTreeMap<DuplicateTier, Vec<ClassifiedRecord>> =
        DuplicateTier::ALL.iter().map(|&t| (t, Vec::new())).collect();
    for record in records {
        buckets.entry(record.tier).or_default().push(record);
    }
    buckets
}

pub fn tier_counts(buckets: &BTreeMap<DuplicateTier, Vec<ClassifiedRecord>>) -> BTreeMap<DuplicateTier, usize> {
    buckets.iter().map(|(&tier, records)| (tier, records.len())).collect()
}

/// FeatureCollection of Points; records without coordinates are skipped
pub fn to_geojson(records: &[ClassifiedRecord]) -> Value {
    let features: Vec<Value> = records
        .iter()
        .filter_map(|record| {
            let (lat, lon) = (record.latitude?, record.longitude?);
            Some(json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [lon, lat]
                },
                "properties": {
                    "contentId": record.content_id,
                    "title": record.title,
                    "tier": record.tier,
                    "isDuplicate": record.is_duplicate,
                    "duplicateOf": record.duplicate_of,
                    "marker-color": record.tier.marker_color()
                }
            }))
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features
    })
}

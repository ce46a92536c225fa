use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// A geotagged point of interest as stored by the record repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(rename = "contentId")]
    pub content_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(rename = "sourceUrl", default)]
    pub source_url: Option<String>,
}

impl LocationRecord {
    /// `(lat, lon)` when both are present. Range checks are left to the caller.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Ordered duplicate-confidence tier. Declaration order is severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuplicateTier {
    None,
    Weak,
    Moderate,
    Strong,
    Confirmed,
}

impl DuplicateTier {
    pub const ALL: [DuplicateTier; 5] = [
        DuplicateTier::None,
        DuplicateTier::Weak,
        DuplicateTier::Moderate,
        DuplicateTier::Strong,
        DuplicateTier::Confirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateTier::None => "NONE",
            DuplicateTier::Weak => "WEAK",
            DuplicateTier::Moderate => "MODERATE",
            DuplicateTier::Strong => "STRONG",
            DuplicateTier::Confirmed => "CONFIRMED",
        }
    }

    /// Numeric severity, persisted alongside the name for ordering in SQL
    pub fn rank(&self) -> i16 {
        *self as i16
    }

    pub fn is_duplicate(&self) -> bool {
        *self != DuplicateTier::None
    }

    /// Map marker color used by the rendering layer
    pub fn marker_color(&self) -> &'static str {
        match self {
            DuplicateTier::Confirmed => "red",
            DuplicateTier::Strong => "darkred",
            DuplicateTier::Moderate => "lightred",
            DuplicateTier::Weak => "pink",
            DuplicateTier::None => "blue",
        }
    }
}

impl std::fmt::Display for DuplicateTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicateTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(DuplicateTier::None),
            "WEAK" => Ok(DuplicateTier::Weak),
            "MODERATE" => Ok(DuplicateTier::Moderate),
            "STRONG" => Ok(DuplicateTier::Strong),
            "CONFIRMED" => Ok(DuplicateTier::Confirmed),
            other => Err(format!(
                "unknown tier '{}': expected one of NONE, WEAK, MODERATE, STRONG, CONFIRMED",
                other
            )),
        }
    }
}

/// Unordered pair of record ids, stored with the smaller id first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    #[serde(rename = "contentIdA")]
    pub a: String,
    #[serde(rename = "contentIdB")]
    pub b: String,
}

impl PairKey {
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Self {
        let (x, y) = (x.into(), y.into());
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.a, self.b)
    }
}

/// What a classification result is keyed by in the repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClassificationKey {
    Record(String),
    Pair(PairKey),
}

/// Durable result of classifying a record or a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub tier: DuplicateTier,
    pub similarity: f64,
    #[serde(rename = "distanceMeters")]
    pub distance_meters: Option<f64>,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
    /// Survivor a record-level duplicate was matched to
    #[serde(rename = "matchedContentId")]
    pub matched_content_id: Option<String>,
    #[serde(rename = "runId")]
    pub run_id: Uuid,
    #[serde(rename = "classifiedAt")]
    pub classified_at: DateTime<Utc>,
}

/// Two scoped records close enough to be duplicate candidates.
/// `a.content_id < b.content_id` always holds.
#[derive(Debug, Clone, Copy)]
pub struct CandidatePair<'a> {
    pub a: &'a LocationRecord,
    pub b: &'a LocationRecord,
    pub distance_meters: f64,
    /// Grid steps between the two records' cells at the bucket resolution
    pub spatial_rank: u32,
}

impl<'a> CandidatePair<'a> {
    /// Returns `None` when both sides carry the same content id
    pub fn new(
        x: &'a LocationRecord,
        y: &'a LocationRecord,
        distance_meters: f64,
        spatial_rank: u32,
    ) -> Option<Self> {
        match x.content_id.cmp(&y.content_id) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Less => Some(Self { a: x, b: y, distance_meters, spatial_rank }),
            std::cmp::Ordering::Greater => Some(Self { a: y, b: x, distance_meters, spatial_rank }),
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey {
            a: self.a.content_id.clone(),
            b: self.b.content_id.clone(),
        }
    }
}

/// Tier assigned to one candidate pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairClassification {
    pub key: PairKey,
    pub tier: DuplicateTier,
    pub similarity: f64,
    #[serde(rename = "similarityAvailable")]
    pub similarity_available: bool,
    #[serde(rename = "distanceMeters")]
    pub distance_meters: f64,
    #[serde(rename = "titleMatch")]
    pub title_match: bool,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
    #[serde(rename = "spatialRank")]
    pub spatial_rank: u32,
}

/// Strongest tier a record reached in the pairs where it is the duplicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordClassification {
    #[serde(rename = "contentId")]
    pub content_id: String,
    pub tier: DuplicateTier,
    pub similarity: f64,
    #[serde(rename = "distanceMeters")]
    pub distance_meters: Option<f64>,
    #[serde(rename = "matchedContentId")]
    pub matched_content_id: Option<String>,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
}

/// Per-record tuple handed to map rendering / file export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    #[serde(rename = "contentId")]
    pub content_id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "lat")]
    pub latitude: Option<f64>,
    #[serde(rename = "lon")]
    pub longitude: Option<f64>,
    pub tier: DuplicateTier,
    #[serde(rename = "isDuplicate")]
    pub is_duplicate: bool,
    /// Record kept in place of this one
    #[serde(rename = "duplicateOf", skip_serializing_if = "Option::is_none", default)]
    pub duplicate_of: Option<String>,
}

/// Pair-level classification joined with both records' titles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedPair {
    #[serde(rename = "contentIdA")]
    pub content_id_a: String,
    #[serde(rename = "contentIdB")]
    pub content_id_b: String,
    #[serde(rename = "titleA")]
    pub title_a: String,
    #[serde(rename = "titleB")]
    pub title_b: String,
    pub tier: DuplicateTier,
    pub similarity: f64,
    #[serde(rename = "distanceMeters")]
    pub distance_meters: Option<f64>,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
}

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// Filtered read against the record repository
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Case-insensitive city match
    pub city: Option<String>,
    pub require_coordinates: bool,
    /// Only used when reading classified records
    pub tier: Option<DuplicateTier>,
}

impl RecordFilter {
    pub fn for_city(city: Option<String>) -> Self {
        Self {
            city,
            ..Default::default()
        }
    }
}

/// Distance / similarity cut-offs of the tier decision table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_threshold_order"))]
pub struct ClassificationThresholds {
    #[serde(default = "default_confirmed_max_distance_m")]
    #[validate(range(min = 0.0))]
    pub confirmed_max_distance_m: f64,
    #[serde(default = "default_confirmed_min_similarity")]
    #[validate(range(min = -1.0, max = 1.0))]
    pub confirmed_min_similarity: f64,
    #[serde(default = "default_strong_max_distance_m")]
    #[validate(range(min = 0.0))]
    pub strong_max_distance_m: f64,
    #[serde(default = "default_strong_min_similarity")]
    #[validate(range(min = -1.0, max = 1.0))]
    pub strong_min_similarity: f64,
    /// Also the distance limit of the WEAK (exact title) rule
    #[serde(default = "default_moderate_max_distance_m")]
    #[validate(range(min = 0.0))]
    pub moderate_max_distance_m: f64,
    #[serde(default = "default_moderate_min_similarity")]
    #[validate(range(min = -1.0, max = 1.0))]
    pub moderate_min_similarity: f64,
}

fn default_confirmed_max_distance_m() -> f64 { 10.0 }
fn default_confirmed_min_similarity() -> f64 { 0.90 }
fn default_strong_max_distance_m() -> f64 { 50.0 }
fn default_strong_min_similarity() -> f64 { 0.70 }
fn default_moderate_max_distance_m() -> f64 { 150.0 }
fn default_moderate_min_similarity() -> f64 { 0.60 }

impl Default for ClassificationThresholds {
    fn default() -> Self {
        Self {
            confirmed_max_distance_m: default_confirmed_max_distance_m(),
            confirmed_min_similarity: default_confirmed_min_similarity(),
            strong_max_distance_m: default_strong_max_distance_m(),
            strong_min_similarity: default_strong_min_similarity(),
            moderate_max_distance_m: default_moderate_max_distance_m(),
            moderate_min_similarity: default_moderate_min_similarity(),
        }
    }
}

impl ClassificationThresholds {
    /// Largest distance at which any rule can still fire
    pub fn max_candidate_distance_m(&self) -> f64 {
        self.confirmed_max_distance_m
            .max(self.strong_max_distance_m)
            .max(self.moderate_max_distance_m)
    }
}

fn validate_threshold_order(t: &ClassificationThresholds) -> Result<(), ValidationError> {
    if t.confirmed_max_distance_m > t.strong_max_distance_m
        || t.strong_max_distance_m > t.moderate_max_distance_m
    {
        let mut err = ValidationError::new("distance_order");
        err.message = Some("distance limits must satisfy confirmed <= strong <= moderate".into());
        return Err(err);
    }
    if t.confirmed_min_similarity < t.strong_min_similarity
        || t.strong_min_similarity < t.moderate_min_similarity
    {
        let mut err = ValidationError::new("similarity_order");
        err.message = Some("similarity floors must satisfy confirmed >= strong >= moderate".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(DuplicateTier::Confirmed > DuplicateTier::Strong);
        assert!(DuplicateTier::Strong > DuplicateTier::Moderate);
        assert!(DuplicateTier::Moderate > DuplicateTier::Weak);
        assert!(DuplicateTier::Weak > DuplicateTier::None);
        assert_eq!(DuplicateTier::Confirmed.rank(), 4);
    }

    #[test]
    fn test_tier_parse_roundtrip_names() {
        for tier in DuplicateTier::ALL {
            assert_eq!(tier.as_str().parse::<DuplicateTier>().unwrap(), tier);
        }
        assert_eq!("strong".parse::<DuplicateTier>().unwrap(), DuplicateTier::Strong);
        assert!("purple".parse::<DuplicateTier>().is_err());
    }

    #[test]
    fn test_tier_serializes_upper_case() {
        let json = serde_json::to_string(&DuplicateTier::Moderate).unwrap();
        assert_eq!(json, "\"MODERATE\"");
    }

    #[test]
    fn test_pair_key_is_unordered() {
        assert_eq!(PairKey::new("b", "a"), PairKey::new("a", "b"));
        assert_eq!(PairKey::new("b", "a").a, "a");
        assert_eq!(PairKey::new("x", "y").to_string(), "x|y");
    }

    #[test]
    fn test_candidate_pair_normalizes_and_rejects_self() {
        let x = LocationRecord {
            content_id: "z".to_string(),
            title: "Z".to_string(),
            description: None,
            latitude: Some(0.0),
            longitude: Some(0.0),
            city: None,
            source_url: None,
        };
        let mut y = x.clone();
        y.content_id = "a".to_string();

        let pair = CandidatePair::new(&x, &y, 1.0, 0).unwrap();
        assert_eq!(pair.a.content_id, "a");
        assert_eq!(pair.b.content_id, "z");
        assert!(CandidatePair::new(&x, &x, 0.0, 0).is_none());
    }

    #[test]
    fn test_default_thresholds_validate() {
        assert!(ClassificationThresholds::default().validate().is_ok());
        assert_eq!(ClassificationThresholds::default().max_candidate_distance_m(), 150.0);
    }

    #[test]
    fn test_threshold_order_is_enforced() {
        let mut thresholds = ClassificationThresholds::default();
        thresholds.strong_max_distance_m = 500.0;
        assert!(thresholds.validate().is_err());

        let mut thresholds = ClassificationThresholds::default();
        thresholds.moderate_min_similarity = 0.95;
        assert!(thresholds.validate().is_err());
    }
}

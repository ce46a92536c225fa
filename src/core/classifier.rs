use super::similarity::scored_similarity;
use crate::models::{
    CandidatePair, ClassificationThresholds, DuplicateTier, LocationRecord, PairClassification,
    PairKey, RecordClassification,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Stateless tier assignment.
///
/// Rules are checked from strongest to weakest and the first match wins:
///
/// | Tier      | Rule                                                                |
/// |-----------|---------------------------------------------------------------------|
/// | CONFIRMED | manual override, or d ≤ confirmed distance and s ≥ confirmed floor |
/// | STRONG    | d ≤ strong distance and s ≥ strong floor                           |
/// | MODERATE  | d ≤ moderate distance and s ≥ moderate floor                       |
/// | WEAK      | d ≤ moderate distance and titles equal                             |
/// | NONE      | otherwise                                                           |
///
/// With validated thresholds the table is monotone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    thresholds: ClassificationThresholds,
}

impl Classifier {
    pub fn new(thresholds: ClassificationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn with_default_thresholds() -> Self {
        Self::default()
    }

    /// Assign a tier. Total: never fails, NaN similarity counts as 0.0 and a
    /// non-finite distance never matches a distance rule.
    pub fn classify(
        &self,
        _pair: &CandidatePair<'_>,
        distance_meters: f64,
        similarity: f64,
        title_exact_match: bool,
        manual_override: bool,
    ) -> DuplicateTier {
        self.tier_for(distance_meters, similarity, title_exact_match, manual_override)
    }

    /// Decision table without a pair, for callers scoring raw values
    pub fn tier_for(
        &self,
        distance_meters: f64,
        similarity: f64,
        title_exact_match: bool,
        manual_override: bool,
    ) -> DuplicateTier {
        if manual_override {
            return DuplicateTier::Confirmed;
        }

        let t = &self.thresholds;
        let s = if similarity.is_nan() { 0.0 } else { similarity };
        let d = distance_meters;
        // NaN fails every `<=`

        if d <= t.confirmed_max_distance_m && s >= t.confirmed_min_similarity {
            DuplicateTier::Confirmed
        } else if d <= t.strong_max_distance_m && s >= t.strong_min_similarity {
            DuplicateTier::Strong
        } else if d <= t.moderate_max_distance_m && s >= t.moderate_min_similarity {
            DuplicateTier::Moderate
        } else if d <= t.moderate_max_distance_m && title_exact_match {
            DuplicateTier::Weak
        } else {
            DuplicateTier::None
        }
    }

    /// Classify a candidate pair given its resolved embeddings.
    ///
    /// Missing or unusable embeddings score 0.0, so the pair is judged on
    /// distance and title alone.
    pub fn classify_candidate(
        &self,
        pair: &CandidatePair<'_>,
        embedding_a: Option<&[f32]>,
        embedding_b: Option<&[f32]>,
        manual_override: bool,
    ) -> PairClassification {
        let scored = scored_similarity(embedding_a, embedding_b);
        let similarity_available = scored.is_some();
        let similarity = scored.unwrap_or(0.0);
        let title_match = titles_match(&pair.a.title, &pair.b.title);
        let tier = self.classify(
            pair,
            pair.distance_meters,
            similarity,
            title_match,
            manual_override,
        );

        tracing::trace!(
            "{}|{}: d={:.1}m s={:.3} title={} override={} -> {}",
            pair.a.content_id,
            pair.b.content_id,
            pair.distance_meters,
            similarity,
            title_match,
            manual_override,
            tier
        );

        PairClassification {
            key: pair.key(),
            tier,
            similarity,
            similarity_available,
            distance_meters: pair.distance_meters,
            title_match,
            manual_override,
            spatial_rank: pair.spatial_rank,
        }
    }
}

/// Exact title equality after trimming, ignoring case
pub fn titles_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.to_lowercase() == b.to_lowercase()
}

/// Ordering of two candidate results for one record: tier, then higher
/// similarity, then shorter distance, then the smaller matched id
fn compare_strength(x: &RecordClassification, y: &RecordClassification) -> Ordering {
    let by_tier = x.tier.cmp(&y.tier);
    let by_similarity = x.similarity.partial_cmp(&y.similarity).unwrap_or(Ordering::Equal);
    let by_distance = y
        .distance_meters
        .unwrap_or(f64::INFINITY)
        .partial_cmp(&x.distance_meters.unwrap_or(f64::INFINITY))
        .unwrap_or(Ordering::Equal);
    let by_partner = match (&x.matched_content_id, &y.matched_content_id) {
        (Some(p), Some(q)) => q.cmp(p),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    };

    by_tier.then(by_similarity).then(by_distance).then(by_partner)
}

/// Replace `current` with `candidate` when the candidate is stronger.
///
/// Used to combine results for the same record coming from different
/// scopes of one run, so a scope that sees only part of a pair cannot
/// downgrade a tier found by another.
pub fn keep_strongest(current: &mut RecordClassification, candidate: RecordClassification) {
    if compare_strength(&candidate, current) == Ordering::Greater {
        *current = candidate;
    }
}

/// Reduce pair tiers to one tier per scoped record.
///
/// In every duplicate pair the record with the smaller content id is the
/// survivor and the other one is the duplicate. A record takes the strongest
/// tier among the pairs where it is the duplicate, with `matched_content_id`
/// naming the survivor; ties are broken by higher similarity, then shorter
/// distance, then the smaller survivor id. Survivors and unpaired records
/// are NONE, so removing every record with a tier keeps one copy of each
/// place. Output follows the order of `records`, one entry per distinct id.
pub fn strongest_per_record(
    records: &[&LocationRecord],
    pairs: &[PairClassification],
) -> Vec<RecordClassification> {
    let mut best: HashMap<&str, RecordClassification> = HashMap::with_capacity(records.len());
    let mut order = Vec::with_capacity(records.len());
    let mut seen = HashSet::new();

    for record in records {
        if !seen.insert(record.content_id.as_str()) {
            continue;
        }
        order.push(record.content_id.as_str());
        best.insert(record.content_id.as_str(), RecordClassification::unmatched(&record.content_id));
    }

    for pair in pairs.iter().filter(|p| p.tier.is_duplicate()) {
        let PairKey { a: survivor, b: duplicate } = &pair.key;
        let Some(current) = best.get_mut(duplicate.as_str()) else {
            continue;
        };
        keep_strongest(
            current,
            RecordClassification {
                content_id: duplicate.clone(),
                tier: pair.tier,
                similarity: pair.similarity,
                distance_meters: Some(pair.distance_meters),
                matched_content_id: Some(survivor.clone()),
                manual_override: pair.manual_override,
            },
        );
    }

    order
        .into_iter()
        .filter_map(|id| best.remove(id))
        .collect()
}

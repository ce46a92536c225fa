use crate::config::{PipelineSettings, ScopeSettings, ScopeStrategy};
use crate::core::candidates::{generate_by_polygon, generate_by_radius, generate_pairs, RadiusScope};
use crate::core::classifier::{keep_strongest, strongest_per_record, Classifier};
use crate::core::distance::{haversine_distance, is_valid_coordinate};
use crate::core::error::CoreError;
use crate::core::geofence::RegionPolygon;
use crate::models::{
    BoundingBox, CandidatePair, ClassificationKey, ClassificationOutcome, ClassificationThresholds,
    LocationRecord, PairClassification, PairKey, RecordClassification, RecordFilter, RunReport,
    ScopeReport,
};
use crate::services::boundary::{load_region, BoundaryError};
use crate::services::repository::{RecordRepository, RepositoryError};
use crate::services::scorer::SimilarityScorer;
use chrono::Utc;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can end a batch or a run
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Unknown scope: {0}")]
    UnknownScope(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Scope '{scope}' failed after {attempts} attempt(s): {source}")]
    BatchFailed {
        scope: String,
        attempts: u32,
        #[source]
        source: RepositoryError,
    },
}

/// Cooperative cancellation shared between a run and its controller
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DedupError> {
        if self.is_cancelled() {
            Err(DedupError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Why a configured scope could not be built
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    #[error("Scope '{scope}' is invalid: {source}")]
    Invalid {
        scope: String,
        #[source]
        source: CoreError,
    },
}

/// Spatial strategy of a scope
#[derive(Debug, Clone)]
pub enum ScopeKind {
    Radius(RadiusScope),
    Polygon(RegionPolygon),
}

/// A named batch of work
#[derive(Debug, Clone)]
pub struct Scope {
    pub name: String,
    /// Repository-side city filter
    pub city: Option<String>,
    pub kind: ScopeKind,
}

impl Scope {
    pub fn radius(name: impl Into<String>, city: Option<String>, scope: RadiusScope) -> Self {
        Self {
            name: name.into(),
            city,
            kind: ScopeKind::Radius(scope),
        }
    }

    pub fn polygon(name: impl Into<String>, city: Option<String>, polygon: RegionPolygon) -> Self {
        Self {
            name: name.into(),
            city,
            kind: ScopeKind::Polygon(polygon),
        }
    }

    /// Build from configuration. Boundary files are read here and radius
    /// scopes are checked; a malformed polygon still loads and is reported
    /// when the scope runs.
    pub fn from_settings(settings: &ScopeSettings) -> Result<Self, ScopeError> {
        let city = settings.city.clone();
        Ok(match &settings.strategy {
            ScopeStrategy::Radius {
                center_lat,
                center_lon,
                resolution,
                radius_in_cells,
            } => {
                let radius = RadiusScope {
                    center_lat: *center_lat,
                    center_lon: *center_lon,
                    resolution: *resolution,
                    radius_in_cells: *radius_in_cells,
                };
                radius.center_cell().map_err(|source| ScopeError::Invalid {
                    scope: settings.name.clone(),
                    source,
                })?;
                Self::radius(&settings.name, city, radius)
            }
            ScopeStrategy::Polygon { boundary_file } => {
                Self::polygon(&settings.name, city, load_region(&settings.name, boundary_file)?)
            }
            ScopeStrategy::BoundingBox {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            } => {
                let bbox = BoundingBox {
                    min_lat: *min_lat,
                    max_lat: *max_lat,
                    min_lon: *min_lon,
                    max_lon: *max_lon,
                };
                Self::polygon(&settings.name, city, RegionPolygon::from_bounding_box(&settings.name, &bbox))
            }
        })
    }

    fn select<'a>(&self, records: &'a [LocationRecord]) -> Result<Vec<&'a LocationRecord>, CoreError> {
        match &self.kind {
            ScopeKind::Radius(radius) => generate_by_radius(records, radius),
            ScopeKind::Polygon(polygon) => generate_by_polygon(records, polygon),
        }
    }
}

/// Retry and persistence knobs of a run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub write_chunk_size: usize,
    pub candidate_radius_meters: f64,
}

impl PipelineOptions {
    pub fn from_settings(settings: &PipelineSettings, thresholds: &ClassificationThresholds) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            write_chunk_size: settings.write_chunk_size.max(1),
            candidate_radius_meters: settings
                .candidate_radius_meters
                .unwrap_or_else(|| thresholds.max_candidate_distance_m()),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default(), &ClassificationThresholds::default())
    }
}

/// Runs duplicate classification over configured scopes.
///
/// One named scope is one batch: fetch, scope, pair, embed, classify,
/// reduce, persist. Repository outages abort the batch and the whole batch
/// is retried with exponential backoff. Writes are keyed upserts, so a
/// retried or re-run batch converges on the same stored tiers. Scoping,
/// pairing and classification run on the blocking pool.
pub struct DedupService {
    repository: Arc<dyn RecordRepository>,
    scorer: Arc<SimilarityScorer>,
    classifier: Classifier,
    scopes: Vec<Arc<Scope>>,
    options: PipelineOptions,
}

/// Record indices of one scope and its candidate pairs
struct PairPlan {
    invalid_coordinates: usize,
    scoped: Vec<usize>,
    pairs: Vec<IndexedPair>,
}

#[derive(Debug, Clone, Copy)]
struct IndexedPair {
    a: usize,
    b: usize,
    distance_meters: f64,
    spatial_rank: u32,
}

/// Move CPU-bound work off the async workers
async fn run_blocking<T, F>(task: F) -> Result<T, DedupError>
where
    F: FnOnce() -> Result<T, DedupError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| DedupError::Worker(e.to_string()))?
}

impl DedupService {
    pub fn new(
        repository: Arc<dyn RecordRepository>,
        scorer: Arc<SimilarityScorer>,
        classifier: Classifier,
        scopes: Vec<Scope>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            repository,
            scorer,
            classifier,
            scopes: scopes.into_iter().map(Arc::new).collect(),
            options,
        }
    }

    pub fn scorer(&self) -> &SimilarityScorer {
        &self.scorer
    }

    /// Run the named scopes (all when `None`) in configuration order.
    ///
    /// A malformed polygon fails only its own scope and is recorded in the
    /// report. A batch that still cannot reach the repository after
    /// `max_attempts` ends the run with `BatchFailed`; batches persisted
    /// before it stay valid. A record seen by several scopes keeps the
    /// strongest tier any of them found during this run.
    pub async fn run(
        &self,
        scope_names: Option<&[String]>,
        cancel: &CancelFlag,
    ) -> Result<RunReport, DedupError> {
        let selected = self.select_scopes(scope_names)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(selected.len());
        let mut merged: HashMap<String, RecordClassification> = HashMap::new();
        let mut cancelled = false;

        tracing::info!("Starting run {} over {} scope(s)", run_id, selected.len());

        for scope in selected {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match self.run_scope_with_retry(&scope, run_id, cancel, &mut merged).await {
                Ok(report) => reports.push(report),
                Err(DedupError::Cancelled) => {
                    let mut report = ScopeReport::new(&scope.name);
                    report.error = Some(DedupError::Cancelled.to_string());
                    reports.push(report);
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    tracing::error!("Run {} aborted: {}", run_id, e);
                    return Err(e);
                }
            }
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            scopes: reports,
        };
        tracing::info!(
            "Run {} finished: {} scope(s), {} failed, cancelled={}",
            run_id,
            report.scopes.len(),
            report.failed_scopes().count(),
            cancelled
        );
        Ok(report)
    }

    fn select_scopes(&self, names: Option<&[String]>) -> Result<Vec<Arc<Scope>>, DedupError> {
        let Some(names) = names else {
            return Ok(self.scopes.clone());
        };
        names
            .iter()
            .map(|name| {
                self.scopes
                    .iter()
                    .find(|s| &s.name == name)
                    .cloned()
                    .ok_or_else(|| DedupError::UnknownScope(name.clone()))
            })
            .collect()
    }

    /// Process one scope, retrying the whole batch on repository outages.
    ///
    /// Scope-local failures (malformed polygon, bad scope center) come back
    /// as an incomplete report rather than an error.
    async fn run_scope_with_retry(
        &self,
        scope: &Arc<Scope>,
        run_id: Uuid,
        cancel: &CancelFlag,
        merged: &mut HashMap<String, RecordClassification>,
    ) -> Result<ScopeReport, DedupError> {
        let mut backoff = self.options.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut report = ScopeReport::new(&scope.name);
            report.attempts = attempt;

            match self.process_scope(scope, run_id, cancel, merged, &mut report).await {
                Ok(()) => {
                    report.completed = true;
                    return Ok(report);
                }
                Err(DedupError::Repository(e)) if e.is_unavailable() => {
                    if attempt >= self.options.max_attempts {
                        tracing::error!(
                            "Scope '{}' failed after {} attempt(s): {}",
                            scope.name,
                            attempt,
                            e
                        );
                        return Err(DedupError::BatchFailed {
                            scope: scope.name.clone(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tracing::warn!(
                        "Scope '{}' attempt {} hit an unavailable repository ({}); retrying in {:?}",
                        scope.name,
                        attempt,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    cancel.check()?;
                    backoff = (backoff * 2).min(self.options.max_backoff);
                }
                Err(DedupError::Core(e)) => {
                    tracing::error!("Scope '{}' skipped: {}", scope.name, e);
                    report.error = Some(e.to_string());
                    return Ok(report);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process_scope(
        &self,
        scope: &Arc<Scope>,
        run_id: Uuid,
        cancel: &CancelFlag,
        merged: &mut HashMap<String, RecordClassification>,
        report: &mut ScopeReport,
    ) -> Result<(), DedupError> {
        if let ScopeKind::Polygon(polygon) = &scope.kind {
            polygon.validate()?;
        }

        let filter = RecordFilter::for_city(scope.city.clone());
        let records = Arc::new(self.repository.fetch_records(&filter).await?);
        report.records_fetched = records.len();

        let fetched_ids: Vec<String> = records.iter().map(|r| r.content_id.clone()).collect();
        let overrides = Arc::new(self.repository.fetch_manual_overrides(&fetched_ids).await?);
        cancel.check()?;

        let plan = run_blocking({
            let (scope, records, overrides) = (scope.clone(), records.clone(), overrides.clone());
            let radius = self.options.candidate_radius_meters;
            move || plan_pairs(&scope, &records, &overrides, radius)
        })
        .await?;
        report.invalid_coordinates = plan.invalid_coordinates;
        report.records_in_scope = plan.scoped.len();
        report.candidate_pairs = plan.pairs.len();
        cancel.check()?;

        let involved = involved_records(&records, &plan.pairs);
        let embeddings = self
            .scorer
            .resolve_embeddings(self.repository.as_ref(), &involved)
            .await?;
        report.embeddings_computed = embeddings.computed;
        cancel.check()?;

        let classifier = self.classifier;
        let (pair_results, record_results) = run_blocking(move || {
            let pairs: Vec<CandidatePair<'_>> = plan
                .pairs
                .iter()
                .filter_map(|p| {
                    CandidatePair::new(&records[p.a], &records[p.b], p.distance_meters, p.spatial_rank)
                })
                .collect();
            let pair_results: Vec<PairClassification> = pairs
                .par_iter()
                .map(|pair| {
                    classifier.classify_candidate(
                        pair,
                        embeddings.get(&pair.a.content_id),
                        embeddings.get(&pair.b.content_id),
                        overrides.contains(&pair.key()),
                    )
                })
                .collect();
            let scoped: Vec<&LocationRecord> = plan.scoped.iter().map(|&i| &records[i]).collect();
            let record_results = strongest_per_record(&scoped, &pair_results);
            Ok((pair_results, record_results))
        })
        .await?;

        report.missing_similarity = pair_results.iter().filter(|p| !p.similarity_available).count();
        for result in &pair_results {
            *report.pair_tier_counts.entry(result.tier).or_default() += 1;
        }

        // Another scope of this run may already hold a stronger result
        let record_results: Vec<RecordClassification> = record_results
            .into_iter()
            .map(|result| match merged.get_mut(&result.content_id) {
                Some(current) => {
                    keep_strongest(current, result);
                    current.clone()
                }
                None => {
                    merged.insert(result.content_id.clone(), result.clone());
                    result
                }
            })
            .collect();
        for result in &record_results {
            *report.tier_counts.entry(result.tier).or_default() += 1;
        }

        let classified_at = Utc::now();
        let outcomes: Vec<(ClassificationKey, ClassificationOutcome)> = pair_results
            .into_iter()
            .map(|p| {
                (
                    ClassificationKey::Pair(p.key),
                    ClassificationOutcome {
                        tier: p.tier,
                        similarity: p.similarity,
                        distance_meters: Some(p.distance_meters),
                        manual_override: p.manual_override,
                        matched_content_id: None,
                        run_id,
                        classified_at,
                    },
                )
            })
            .chain(record_results.into_iter().map(|r| {
                (
                    ClassificationKey::Record(r.content_id),
                    ClassificationOutcome {
                        tier: r.tier,
                        similarity: r.similarity,
                        distance_meters: r.distance_meters,
                        manual_override: r.manual_override,
                        matched_content_id: r.matched_content_id,
                        run_id,
                        classified_at,
                    },
                )
            }))
            .collect();

        for chunk in outcomes.chunks(self.options.write_chunk_size) {
            cancel.check()?;
            self.repository.write_classifications(chunk).await?;
            report.classifications_written += chunk.len();
        }

        tracing::info!(
            "Scope '{}': {} fetched, {} in scope, {} pairs, {} written",
            scope.name,
            report.records_fetched,
            report.records_in_scope,
            report.candidate_pairs,
            report.classifications_written
        );
        Ok(())
    }
}

/// Scope the records and pair them up, as indices into `records`
fn plan_pairs(
    scope: &Scope,
    records: &[LocationRecord],
    overrides: &HashSet<PairKey>,
    candidate_radius_meters: f64,
) -> Result<PairPlan, DedupError> {
    let invalid_coordinates = count_invalid_coordinates(records);
    let scoped = scope.select(records)?;

    let mut pairs = generate_pairs(&scoped, candidate_radius_meters);
    add_override_pairs(&mut pairs, &scoped, overrides);

    // Repository reads are keyed by content id, so ids are unique
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        index.entry(record.content_id.as_str()).or_insert(i);
    }
    let position = |record: &LocationRecord| index.get(record.content_id.as_str()).copied();

    Ok(PairPlan {
        invalid_coordinates,
        scoped: scoped.iter().filter_map(|&r| position(r)).collect(),
        pairs: pairs
            .iter()
            .filter_map(|p| {
                Some(IndexedPair {
                    a: position(p.a)?,
                    b: position(p.b)?,
                    distance_meters: p.distance_meters,
                    spatial_rank: p.spatial_rank,
                })
            })
            .collect(),
    })
}

fn count_invalid_coordinates(records: &[LocationRecord]) -> usize {
    records
        .iter()
        .filter(|record| match record.coordinates() {
            None => true,
            Some((lat, lon)) if !is_valid_coordinate(lat, lon) => {
                tracing::warn!(
                    "Skipping record {}: {}",
                    record.content_id,
                    CoreError::InvalidCoordinate { lat, lon }
                );
                true
            }
            Some(_) => false,
        })
        .count()
}

/// Operator-tagged pairs inside the scope but beyond the candidate radius
/// are still classified. Their `spatial_rank` is `u32::MAX`.
fn add_override_pairs<'a>(
    pairs: &mut Vec<CandidatePair<'a>>,
    scoped: &[&'a LocationRecord],
    overrides: &HashSet<PairKey>,
) {
    if overrides.is_empty() {
        return;
    }
    let present: HashSet<PairKey> = pairs.iter().map(|p| p.key()).collect();
    let by_id: HashMap<&str, &'a LocationRecord> =
        scoped.iter().map(|&r| (r.content_id.as_str(), r)).collect();

    for key in overrides.iter().filter(|k| !present.contains(*k)) {
        let (Some(&a), Some(&b)) = (by_id.get(key.a.as_str()), by_id.get(key.b.as_str())) else {
            continue;
        };
        let (Some((lat_a, lon_a)), Some((lat_b, lon_b))) = (a.coordinates(), b.coordinates()) else {
            continue;
        };
        let distance = haversine_distance(lat_a, lon_a, lat_b, lon_b);
        pairs.extend(CandidatePair::new(a, b, distance, u32::MAX));
    }
    pairs.sort_by(|p, q| {
        p.a.content_id
            .cmp(&q.a.content_id)
            .then_with(|| p.b.content_id.cmp(&q.b.content_id))
    });
}

fn involved_records<'a>(records: &'a [LocationRecord], pairs: &[IndexedPair]) -> Vec<&'a LocationRecord> {
    let mut seen = HashSet::new();
    pairs
        .iter()
        .flat_map(|p| [p.a, p.b])
        .filter(|&i| seen.insert(i))
        .map(|i| &records[i])
        .collect()
}

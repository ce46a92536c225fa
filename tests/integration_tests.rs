// Integration tests for POI Dedup

use async_trait::async_trait;
use poi_dedup::core::{Classifier, PolygonRings, RadiusScope, RegionPolygon};
use poi_dedup::models::{
    BoundingBox, ClassificationKey, ClassificationOutcome, ClassifiedPair, ClassifiedRecord,
    DuplicateTier, LocationRecord, PairKey, RecordFilter,
};
use poi_dedup::services::{
    CancelFlag, DedupError, DedupService, EmbeddingCache, EmbeddingError, EmbeddingProvider,
    MemoryRepository, PipelineOptions, RecordRepository, RepositoryError, Scope, SimilarityScorer,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn create_record(id: &str, title: &str, city: &str, lat: f64, lon: f64) -> LocationRecord {
    LocationRecord {
        content_id: id.to_string(),
        title: title.to_string(),
        description: None,
        latitude: Some(lat),
        longitude: Some(lon),
        city: Some(city.to_string()),
        source_url: None,
    }
}

fn nyc_scope() -> Scope {
    Scope::radius(
        "nyc-radius",
        Some("New York".to_string()),
        RadiusScope {
            center_lat: 40.7128,
            center_lon: -74.0060,
            resolution: 5,
            radius_in_cells: 3,
        },
    )
}

fn boston_scope() -> Scope {
    Scope::radius(
        "boston-radius",
        Some("Boston".to_string()),
        RadiusScope {
            center_lat: 42.3601,
            center_lon: -71.0589,
            resolution: 5,
            radius_in_cells: 2,
        },
    )
}

fn fast_options() -> PipelineOptions {
    PipelineOptions {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        write_chunk_size: 2,
        ..PipelineOptions::default()
    }
}

fn service(
    repository: Arc<dyn RecordRepository>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    scopes: Vec<Scope>,
) -> DedupService {
    DedupService::new(
        repository,
        Arc::new(SimilarityScorer::new(provider, EmbeddingCache::new(1_000, 60))),
        Classifier::with_default_thresholds(),
        scopes,
        fast_options(),
    )
}

/// Katz's pair ~7.8 m apart, plus an unrelated pizzeria ~1.5 km away
async fn seeded_repository() -> Arc<MemoryRepository> {
    let repository = Arc::new(MemoryRepository::with_records(vec![
        create_record("a", "Katz's Delicatessen", "New York", 40.72223, -73.98746),
        create_record("b", "Katz's Deli", "New York", 40.72230, -73.98746),
        create_record("c", "Joe's Pizza", "New York", 40.73056, -74.00213),
    ]));
    repository.store_embedding("a", &[0.9, 0.1, 0.2]).await.unwrap();
    repository.store_embedding("b", &[0.9, 0.1, 0.2]).await.unwrap();
    repository.store_embedding("c", &[-0.2, 0.8, 0.1]).await.unwrap();
    repository
}

/// Delegates to a memory store; reads for the listed cities fail as if the
/// database were down, and the first `write_failures` chunk writes fail too.
struct FlakyRepository {
    inner: Arc<MemoryRepository>,
    down_cities: HashSet<String>,
    write_failures: AtomicUsize,
}

impl FlakyRepository {
    fn new(inner: Arc<MemoryRepository>) -> Self {
        Self {
            inner,
            down_cities: HashSet::new(),
            write_failures: AtomicUsize::new(0),
        }
    }

    fn with_down_city(mut self, city: &str) -> Self {
        self.down_cities.insert(city.to_string());
        self
    }

    fn with_write_failures(self, n: usize) -> Self {
        self.write_failures.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl RecordRepository for FlakyRepository {
    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<LocationRecord>, RepositoryError> {
        if filter.city.as_ref().is_some_and(|c| self.down_cities.contains(c)) {
            return Err(RepositoryError::Unavailable("connection refused".to_string()));
        }
        self.inner.fetch_records(filter).await
    }

    async fn fetch_embedding(&self, content_id: &str) -> Result<Option<Vec<f32>>, RepositoryError> {
        self.inner.fetch_embedding(content_id).await
    }

    async fn store_embedding(&self, content_id: &str, embedding: &[f32]) -> Result<(), RepositoryError> {
        self.inner.store_embedding(content_id, embedding).await
    }

    async fn fetch_manual_overrides(
        &self,
        content_ids: &[String],
    ) -> Result<HashSet<PairKey>, RepositoryError> {
        self.inner.fetch_manual_overrides(content_ids).await
    }

    async fn write_classification(
        &self,
        key: &ClassificationKey,
        outcome: &ClassificationOutcome,
    ) -> Result<(), RepositoryError> {
        self.inner.write_classification(key, outcome).await
    }

    async fn write_classifications(
        &self,
        outcomes: &[(ClassificationKey, ClassificationOutcome)],
    ) -> Result<(), RepositoryError> {
        let remaining = self.write_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.write_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::Unavailable("write timed out".to_string()));
        }
        self.inner.write_classifications(outcomes).await
    }

    async fn fetch_classified(&self, filter: &RecordFilter) -> Result<Vec<ClassifiedRecord>, RepositoryError> {
        self.inner.fetch_classified(filter).await
    }

    async fn fetch_pair_classifications(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<ClassifiedPair>, RepositoryError> {
        self.inner.fetch_pair_classifications(filter).await
    }

    async fn health_check(&self) -> Result<bool, RepositoryError> {
        Ok(self.down_cities.is_empty())
    }
}

/// Delegates to a memory store and trips the cancel flag once the first
/// chunk has been written
struct CancellingRepository {
    inner: Arc<MemoryRepository>,
    cancel: CancelFlag,
}

#[async_trait]
impl RecordRepository for CancellingRepository {
    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<LocationRecord>, RepositoryError> {
        self.inner.fetch_records(filter).await
    }

    async fn fetch_embedding(&self, content_id: &str) -> Result<Option<Vec<f32>>, RepositoryError> {
        self.inner.fetch_embedding(content_id).await
    }

    async fn store_embedding(&self, content_id: &str, embedding: &[f32]) -> Result<(), RepositoryError> {
        self.inner.store_embedding(content_id, embedding).await
    }

    async fn fetch_manual_overrides(
        &self,
        content_ids: &[String],
    ) -> Result<HashSet<PairKey>, RepositoryError> {
        self.inner.fetch_manual_overrides(content_ids).await
    }

    async fn write_classification(
        &self,
        key: &ClassificationKey,
        outcome: &ClassificationOutcome,
    ) -> Result<(), RepositoryError> {
        self.inner.write_classification(key, outcome).await
    }

    async fn write_classifications(
        &self,
        outcomes: &[(ClassificationKey, ClassificationOutcome)],
    ) -> Result<(), RepositoryError> {
        self.inner.write_classifications(outcomes).await?;
        self.cancel.cancel();
        Ok(())
    }

    async fn fetch_classified(&self, filter: &RecordFilter) -> Result<Vec<ClassifiedRecord>, RepositoryError> {
        self.inner.fetch_classified(filter).await
    }

    async fn fetch_pair_classifications(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<ClassifiedPair>, RepositoryError> {
        self.inner.fetch_pair_classifications(filter).await
    }

    async fn health_check(&self) -> Result<bool, RepositoryError> {
        Ok(true)
    }
}

/// Embeds text as (length, vowel count, 1.0)
struct CountingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("fail") {
            return Err(EmbeddingError::ApiError("model overloaded".to_string()));
        }
        let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count();
        Ok(vec![text.len() as f32, vowels as f32, 1.0])
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

#[tokio::test]
async fn test_integration_end_to_end_classification() {
    let repository = seeded_repository().await;
    let service = service(repository.clone(), None, vec![nyc_scope()]);

    let report = service.run(None, &CancelFlag::new()).await.unwrap();

    assert!(report.is_success());
    let scope = &report.scopes[0];
    assert_eq!(scope.records_fetched, 3);
    assert_eq!(scope.records_in_scope, 3);
    assert_eq!(scope.candidate_pairs, 1);
    assert_eq!(scope.missing_similarity, 0);
    // b duplicates a; a survives
    assert_eq!(scope.tier_counts.get(&DuplicateTier::Confirmed), Some(&1));
    assert_eq!(scope.tier_counts.get(&DuplicateTier::None), Some(&2));
    // one pair row plus three record rows
    assert_eq!(scope.classifications_written, 4);

    let a = repository.record_outcome("a").await.unwrap();
    assert_eq!(a.tier, DuplicateTier::None);
    let b = repository.record_outcome("b").await.unwrap();
    assert_eq!(b.tier, DuplicateTier::Confirmed);
    assert_eq!(b.matched_content_id.as_deref(), Some("a"));
    assert_eq!(repository.record_outcome("c").await.unwrap().tier, DuplicateTier::None);

    let pair = repository.pair_outcome(&PairKey::new("b", "a")).await.unwrap();
    assert_eq!(pair.tier, DuplicateTier::Confirmed);
    assert!(pair.distance_meters.unwrap() < 10.0);
}

#[tokio::test]
async fn test_integration_rerun_is_idempotent() {
    let repository = seeded_repository().await;
    let service = service(repository.clone(), None, vec![nyc_scope()]);

    let first = service.run(None, &CancelFlag::new()).await.unwrap();
    let tiers_after_first: HashMap<String, DuplicateTier> = repository
        .record_outcomes()
        .await
        .into_iter()
        .map(|(id, o)| (id, o.tier))
        .collect();
    let pairs_after_first = repository.pair_outcomes().await.len();

    let second = service.run(None, &CancelFlag::new()).await.unwrap();
    let tiers_after_second: HashMap<String, DuplicateTier> = repository
        .record_outcomes()
        .await
        .into_iter()
        .map(|(id, o)| (id, o.tier))
        .collect();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(tiers_after_first, tiers_after_second);
    assert_eq!(repository.pair_outcomes().await.len(), pairs_after_first);
    assert_eq!(
        repository.record_outcome("a").await.unwrap().run_id,
        second.run_id
    );
}

#[tokio::test]
async fn test_integration_transient_outage_is_retried() {
    let memory = seeded_repository().await;
    let repository = Arc::new(FlakyRepository::new(memory.clone()).with_write_failures(1));
    let service = service(repository, None, vec![nyc_scope()]);

    let report = service.run(None, &CancelFlag::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.scopes[0].attempts, 2);
    assert_eq!(memory.record_outcomes().await.len(), 3);
}

#[tokio::test]
async fn test_integration_persistent_outage_fails_batch_and_keeps_earlier_batches() {
    let memory = seeded_repository().await;
    memory
        .insert_record(create_record("d", "Union Oyster House", "Boston", 42.3612, -71.0569))
        .await;
    let repository = Arc::new(FlakyRepository::new(memory.clone()).with_down_city("Boston"));
    let service = service(repository, None, vec![nyc_scope(), boston_scope()]);

    let result = service.run(None, &CancelFlag::new()).await;

    match result {
        Err(DedupError::BatchFailed { scope, attempts, source }) => {
            assert_eq!(scope, "boston-radius");
            assert_eq!(attempts, 3);
            assert!(source.is_unavailable());
        }
        other => panic!("expected BatchFailed, got {:?}", other.map(|r| r.scopes.len())),
    }

    // New York was persisted before Boston failed
    assert_eq!(memory.record_outcome("b").await.unwrap().tier, DuplicateTier::Confirmed);
    assert!(memory.record_outcome("d").await.is_none());
}

#[tokio::test]
async fn test_integration_malformed_polygon_fails_only_its_scope() {
    let repository = seeded_repository().await;
    let broken = RegionPolygon::new(
        "bowtie",
        vec![PolygonRings {
            exterior: vec![
                (-74.02, 40.70),
                (-73.97, 40.74),
                (-73.97, 40.70),
                (-74.02, 40.74),
                (-74.02, 40.70),
            ],
            holes: vec![],
        }],
    );
    let service = service(
        repository.clone(),
        None,
        vec![
            Scope::polygon("bowtie", Some("New York".to_string()), broken),
            nyc_scope(),
        ],
    );

    let report = service.run(None, &CancelFlag::new()).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.scopes.len(), 2);
    assert!(!report.scopes[0].completed);
    assert!(report.scopes[0].error.as_deref().unwrap().contains("bowtie"));
    assert!(report.scopes[1].completed);
    assert_eq!(report.failed_scopes().count(), 1);
    assert_eq!(repository.record_outcomes().await.len(), 3);
}

#[tokio::test]
async fn test_integration_cancelled_run_writes_nothing() {
    let repository = seeded_repository().await;
    let service = service(repository.clone(), None, vec![nyc_scope()]);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = service.run(None, &cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(report.scopes.is_empty());
    assert!(repository.record_outcomes().await.is_empty());
}

#[tokio::test]
async fn test_integration_unknown_scope_is_rejected() {
    let repository = seeded_repository().await;
    let service = service(repository, None, vec![nyc_scope()]);

    let result = service
        .run(Some(&["atlantis".to_string()]), &CancelFlag::new())
        .await;
    assert!(matches!(result, Err(DedupError::UnknownScope(name)) if name == "atlantis"));
}

#[tokio::test]
async fn test_integration_manual_override_confirms_distant_pair() {
    let repository = Arc::new(MemoryRepository::with_records(vec![
        create_record("hq", "Acme HQ", "New York", 40.7128, -74.0060),
        create_record("annex", "Acme Annex", "New York", 40.7306, -73.9866),
    ]));
    repository.add_manual_override("hq", "annex").await;
    let service = service(repository.clone(), None, vec![nyc_scope()]);

    let report = service.run(None, &CancelFlag::new()).await.unwrap();

    assert_eq!(report.scopes[0].candidate_pairs, 1);
    let pair = repository
        .pair_outcome(&PairKey::new("annex", "hq"))
        .await
        .unwrap();
    assert_eq!(pair.tier, DuplicateTier::Confirmed);
    assert!(pair.manual_override);
    assert!(pair.distance_meters.unwrap() > 1_000.0);
    assert_eq!(repository.record_outcome("hq").await.unwrap().tier, DuplicateTier::Confirmed);
}

#[tokio::test]
async fn test_integration_provider_fills_missing_embeddings() {
    let mut first = create_record("p1", "Prospect Park Boathouse", "New York", 40.66060, -73.96620);
    first.description = Some("Historic boathouse on the Lullwater".to_string());
    let mut second = create_record("p2", "Boathouse", "New York", 40.66065, -73.96620);
    second.description = Some("Historic BOATHOUSE on the Lullwater!".to_string());
    let mut third = create_record("p3", "Audubon Center", "New York", 40.66070, -73.96620);
    third.description = Some("please fail".to_string());

    let repository = Arc::new(MemoryRepository::with_records(vec![first, second, third]));
    let provider = Arc::new(CountingProvider {
        calls: AtomicUsize::new(0),
    });
    let service = service(
        repository.clone(),
        Some(provider.clone() as Arc<dyn EmbeddingProvider>),
        vec![nyc_scope()],
    );

    let report = service.run(None, &CancelFlag::new()).await.unwrap();

    let scope = &report.scopes[0];
    assert_eq!(scope.embeddings_computed, 2);
    // p3 has no embedding, so both of its pairs score 0.0
    assert_eq!(scope.missing_similarity, 2);
    assert!(repository.fetch_embedding("p1").await.unwrap().is_some());
    assert!(repository.fetch_embedding("p3").await.unwrap().is_none());

    // Same text after preprocessing, ~5.6 m apart
    let pair = repository.pair_outcome(&PairKey::new("p1", "p2")).await.unwrap();
    assert_eq!(pair.tier, DuplicateTier::Confirmed);

    // Second run is served from the cache and the stored embeddings
    let calls = provider.calls.load(Ordering::SeqCst);
    service.run(None, &CancelFlag::new()).await.unwrap();
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls + 1);
}

#[tokio::test]
async fn test_integration_records_without_coordinates_are_skipped() {
    let mut missing = create_record("n", "Mystery Spot", "New York", 0.0, 0.0);
    missing.latitude = None;
    let mut bogus = create_record("x", "Bad Pin", "New York", 0.0, 0.0);
    bogus.latitude = Some(123.0);

    let repository = seeded_repository().await;
    repository.insert_record(missing).await;
    repository.insert_record(bogus).await;
    let service = service(repository.clone(), None, vec![nyc_scope()]);

    let report = service.run(None, &CancelFlag::new()).await.unwrap();

    let scope = &report.scopes[0];
    assert_eq!(scope.records_fetched, 5);
    assert_eq!(scope.invalid_coordinates, 2);
    assert_eq!(scope.records_in_scope, 3);
    assert!(repository.record("n").await.is_some());
    assert!(repository.record_outcome("n").await.is_none());
}

#[tokio::test]
async fn test_integration_copies_of_one_place_keep_a_single_survivor() {
    let repository = Arc::new(MemoryRepository::with_records(vec![
        create_record("katz-1", "Katz's Deli", "New York", 40.72223, -73.98746),
        create_record("katz-2", "Katz's Deli", "New York", 40.72225, -73.98746),
    ]));
    repository.store_embedding("katz-1", &[0.9, 0.1, 0.2]).await.unwrap();
    repository.store_embedding("katz-2", &[0.9, 0.1, 0.2]).await.unwrap();
    let service = service(repository.clone(), None, vec![nyc_scope()]);

    service.run(None, &CancelFlag::new()).await.unwrap();

    let classified = repository
        .fetch_classified(&RecordFilter::for_city(Some("New York".to_string())))
        .await
        .unwrap();
    assert_eq!(classified.len(), 2);
    let duplicates: Vec<&ClassifiedRecord> = classified.iter().filter(|r| r.is_duplicate).collect();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].content_id, "katz-2");
    assert_eq!(duplicates[0].tier, DuplicateTier::Confirmed);
    assert_eq!(duplicates[0].duplicate_of.as_deref(), Some("katz-1"));

    let pairs = repository
        .fetch_pair_classifications(&RecordFilter::default())
        .await
        .unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].tier, DuplicateTier::Confirmed);
}

#[tokio::test]
async fn test_integration_overlapping_scopes_never_downgrade_a_record() {
    // ~5 m apart on either side of a resolution-7 cell border
    let repository = Arc::new(MemoryRepository::with_records(vec![
        create_record("a", "Katz's Deli", "New York", 40.72290, -73.98883),
        create_record("b", "Katz's Deli", "New York", 40.72290, -73.98877),
    ]));
    repository.store_embedding("a", &[0.9, 0.1, 0.2]).await.unwrap();
    repository.store_embedding("b", &[0.9, 0.1, 0.2]).await.unwrap();

    let lower_east_side = Scope::polygon(
        "lower-east-side",
        Some("New York".to_string()),
        RegionPolygon::from_bounding_box(
            "lower-east-side",
            &BoundingBox {
                min_lat: 40.71,
                max_lat: 40.73,
                min_lon: -74.00,
                max_lon: -73.97,
            },
        ),
    );
    // Only b's own cell: a sits in the neighbouring one
    let single_cell = Scope::radius(
        "single-cell",
        Some("New York".to_string()),
        RadiusScope {
            center_lat: 40.72290,
            center_lon: -73.98877,
            resolution: 7,
            radius_in_cells: 0,
        },
    );
    let service = service(repository.clone(), None, vec![lower_east_side, single_cell]);

    let report = service.run(None, &CancelFlag::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.scopes[0].records_in_scope, 2);
    assert_eq!(report.scopes[0].candidate_pairs, 1);
    assert_eq!(report.scopes[1].records_in_scope, 1);
    assert_eq!(report.scopes[1].candidate_pairs, 0);
    assert_eq!(report.scopes[1].tier_counts.get(&DuplicateTier::Confirmed), Some(&1));

    let b = repository.record_outcome("b").await.unwrap();
    assert_eq!(b.tier, DuplicateTier::Confirmed);
    assert_eq!(b.matched_content_id.as_deref(), Some("a"));
    assert_eq!(b.run_id, report.run_id);
}

#[tokio::test]
async fn test_integration_cancel_between_chunks_stops_writing() {
    let memory = seeded_repository().await;
    let cancel = CancelFlag::new();
    let repository = Arc::new(CancellingRepository {
        inner: memory.clone(),
        cancel: cancel.clone(),
    });
    let service = service(repository, None, vec![nyc_scope()]);

    let report = service.run(None, &cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(!report.is_success());
    assert_eq!(report.scopes.len(), 1);
    assert!(!report.scopes[0].completed);
    // Chunks hold two outcomes: the pair row and the first record row
    let written = memory.pair_outcomes().await.len() + memory.record_outcomes().await.len();
    assert_eq!(written, 2);
    assert_eq!(memory.pair_outcomes().await.len(), 1);
}

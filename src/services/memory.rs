use crate::models::{
    ClassificationKey, ClassificationOutcome, ClassifiedPair, ClassifiedRecord, LocationRecord, PairKey,
    RecordFilter,
};
use crate::services::repository::{RecordRepository, RepositoryError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Store {
    records: BTreeMap<String, LocationRecord>,
    embeddings: HashMap<String, Vec<f32>>,
    overrides: HashSet<PairKey>,
    record_outcomes: BTreeMap<String, ClassificationOutcome>,
    pair_outcomes: BTreeMap<PairKey, ClassificationOutcome>,
}

/// In-process repository for tests and dry runs
#[derive(Default)]
pub struct MemoryRepository {
    store: RwLock<Store>,
}

fn city_matches(filter: &RecordFilter, record: &LocationRecord) -> bool {
    match (&filter.city, &record.city) {
        (None, _) => true,
        (Some(wanted), Some(city)) => wanted.eq_ignore_ascii_case(city),
        (Some(_), None) => false,
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = LocationRecord>) -> Self {
        let store = Store {
            records: records
                .into_iter()
                .map(|r| (r.content_id.clone(), r))
                .collect(),
            ..Default::default()
        };
        Self {
            store: RwLock::new(store),
        }
    }

    pub async fn insert_record(&self, record: LocationRecord) {
        self.store
            .write()
            .await
            .records
            .insert(record.content_id.clone(), record);
    }

    pub async fn add_manual_override(&self, a: &str, b: &str) {
        self.store.write().await.overrides.insert(PairKey::new(a, b));
    }

    /// Latest record-level outcome
    pub async fn record_outcome(&self, content_id: &str) -> Option<ClassificationOutcome> {
        self.store.read().await.record_outcomes.get(content_id).cloned()
    }

    pub async fn pair_outcome(&self, key: &PairKey) -> Option<ClassificationOutcome> {
        self.store.read().await.pair_outcomes.get(key).cloned()
    }

    pub async fn record_outcomes(&self) -> BTreeMap<String, ClassificationOutcome> {
        self.store.read().await.record_outcomes.clone()
    }

    pub async fn pair_outcomes(&self) -> BTreeMap<PairKey, ClassificationOutcome> {
        self.store.read().await.pair_outcomes.clone()
    }

    pub async fn record(&self, content_id: &str) -> Option<LocationRecord> {
        self.store.read().await.records.get(content_id).cloned()
    }
}

#[async_trait]
impl RecordRepository for MemoryRepository {
    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<LocationRecord>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .records
            .values()
            .filter(|r| city_matches(filter, r))
            .filter(|r| !filter.require_coordinates || r.coordinates().is_some())
            .cloned()
            .collect())
    }

    async fn fetch_embedding(&self, content_id: &str) -> Result<Option<Vec<f32>>, RepositoryError> {
        Ok(self.store.read().await.embeddings.get(content_id).cloned())
    }

    async fn fetch_embeddings(
        &self,
        content_ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, RepositoryError> {
        let store = self.store.read().await;
        Ok(content_ids
            .iter()
            .filter_map(|id| store.embeddings.get(id).map(|e| (id.clone(), e.clone())))
            .collect())
    }

    async fn store_embedding(&self, content_id: &str, embedding: &[f32]) -> Result<(), RepositoryError> {
        self.store
            .write()
            .await
            .embeddings
            .insert(content_id.to_string(), embedding.to_vec());
        Ok(())
    }

    async fn fetch_manual_overrides(
        &self,
        content_ids: &[String],
    ) -> Result<HashSet<PairKey>, RepositoryError> {
        let wanted: HashSet<&str> = content_ids.iter().map(String::as_str).collect();
        let store = self.store.read().await;
        Ok(store
            .overrides
            .iter()
            .filter(|key| wanted.contains(key.a.as_str()) || wanted.contains(key.b.as_str()))
            .cloned()
            .collect())
    }

    async fn write_classification(
        &self,
        key: &ClassificationKey,
        outcome: &ClassificationOutcome,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        match key {
            ClassificationKey::Record(id) => {
                store.record_outcomes.insert(id.clone(), outcome.clone());
            }
            ClassificationKey::Pair(pair) => {
                store.pair_outcomes.insert(pair.clone(), outcome.clone());
            }
        }
        Ok(())
    }

    async fn write_classifications(
        &self,
        outcomes: &[(ClassificationKey, ClassificationOutcome)],
    ) -> Result<(), RepositoryError> {
        // One lock for the whole chunk, so a chunk lands atomically
        let mut store = self.store.write().await;
        for (key, outcome) in outcomes {
            match key {
                ClassificationKey::Record(id) => {
                    store.record_outcomes.insert(id.clone(), outcome.clone());
                }
                ClassificationKey::Pair(pair) => {
                    store.pair_outcomes.insert(pair.clone(), outcome.clone());
                }
            }
        }
        Ok(())
    }

    async fn fetch_classified(&self, filter: &RecordFilter) -> Result<Vec<ClassifiedRecord>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .record_outcomes
            .iter()
            .filter_map(|(id, outcome)| store.records.get(id).map(|record| (record, outcome)))
            .filter(|(record, _)| city_matches(filter, record))
            .filter(|(_, outcome)| filter.tier.map_or(true, |tier| outcome.tier == tier))
            .map(|(record, outcome)| ClassifiedRecord {
                content_id: record.content_id.clone(),
                title: record.title.clone(),
                description: record.description.clone(),
                latitude: record.latitude,
                longitude: record.longitude,
                tier: outcome.tier,
                is_duplicate: outcome.tier.is_duplicate(),
                duplicate_of: outcome.matched_content_id.clone(),
            })
            .collect())
    }

    async fn fetch_pair_classifications(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<ClassifiedPair>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .pair_outcomes
            .iter()
            .filter_map(|(key, outcome)| {
                let a = store.records.get(&key.a)?;
                let b = store.records.get(&key.b)?;
                Some((a, b, outcome))
            })
            .filter(|(a, b, _)| city_matches(filter, a) || city_matches(filter, b))
            .filter(|(_, _, outcome)| filter.tier.map_or(true, |tier| outcome.tier == tier))
            .map(|(a, b, outcome)| ClassifiedPair {
                content_id_a: a.content_id.clone(),
                content_id_b: b.content_id.clone(),
                title_a: a.title.clone(),
                title_b: b.title.clone(),
                tier: outcome.tier,
                similarity: outcome.similarity,
                distance_meters: outcome.distance_meters,
                manual_override: outcome.manual_override,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<bool, RepositoryError> {
        Ok(true)
    }
}

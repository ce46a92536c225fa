use crate::core::similarity::preprocess_description;
use crate::models::LocationRecord;
use crate::services::cache::EmbeddingCache;
use crate::services::embeddings::EmbeddingProvider;
use crate::services::repository::{RecordRepository, RepositoryError};
use std::collections::HashMap;
use std::sync::Arc;

/// Embeddings gathered for one batch
#[derive(Debug, Default)]
pub struct ResolvedEmbeddings {
    pub embeddings: HashMap<String, Arc<Vec<f32>>>,
    /// Freshly computed through the provider and stored back
    pub computed: usize,
    /// Records whose embedding could not be obtained
    pub unavailable: usize,
}

impl ResolvedEmbeddings {
    pub fn get(&self, content_id: &str) -> Option<&[f32]> {
        self.embeddings.get(content_id).map(|e| e.as_slice())
    }
}

/// Resolves description embeddings for classification.
///
/// Lookup order is cache, repository, then provider. Provider failures are
/// recovered per record (the record simply has no embedding); repository
/// failures abort the call so the batch can be retried.
pub struct SimilarityScorer {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    cache: EmbeddingCache,
}

impl SimilarityScorer {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>, cache: EmbeddingCache) -> Self {
        if let Some(p) = &provider {
            tracing::info!("Similarity scorer using embedding model '{}'", p.model_name());
        }
        Self { provider, cache }
    }

    /// Scorer that only uses stored embeddings
    pub fn without_provider(cache: EmbeddingCache) -> Self {
        Self::new(None, cache)
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub async fn resolve_embeddings(
        &self,
        repository: &dyn RecordRepository,
        records: &[&LocationRecord],
    ) -> Result<ResolvedEmbeddings, RepositoryError> {
        let mut resolved = ResolvedEmbeddings::default();

        let mut misses = Vec::new();
        for record in records {
            match self.cache.get(&record.content_id).await {
                Some(embedding) => {
                    resolved.embeddings.insert(record.content_id.clone(), embedding);
                }
                None => misses.push(record.content_id.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(resolved);
        }

        let stored = repository.fetch_embeddings(&misses).await?;
        for (content_id, embedding) in stored {
            let embedding = Arc::new(embedding);
            self.cache.insert(&content_id, embedding.clone()).await;
            resolved.embeddings.insert(content_id, embedding);
        }

        for record in records {
            if resolved.embeddings.contains_key(&record.content_id) {
                continue;
            }
            let text = record
                .description
                .as_deref()
                .map(preprocess_description)
                .unwrap_or_default();
            let Some(provider) = self.provider.as_ref().filter(|_| !text.is_empty()) else {
                resolved.unavailable += 1;
                continue;
            };

            match provider.embed(&text).await {
                Ok(embedding) => {
                    repository.store_embedding(&record.content_id, &embedding).await?;
                    let embedding = Arc::new(embedding);
                    self.cache.insert(&record.content_id, embedding.clone()).await;
                    resolved.embeddings.insert(record.content_id.clone(), embedding);
                    resolved.computed += 1;
                }
                Err(e) => {
                    tracing::warn!("Embedding unavailable for {}: {}", record.content_id, e);
                    resolved.unavailable += 1;
                }
            }
        }

        tracing::debug!(
            "Resolved {} embeddings ({} computed, {} unavailable)",
            resolved.embeddings.len(),
            resolved.computed,
            resolved.unavailable
        );
        Ok(resolved)
    }

    /// Drop cached state at shutdown
    pub fn release(&self) {
        self.cache.clear();
        tracing::debug!("Similarity scorer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::embeddings::EmbeddingError;
    use crate::services::memory::MemoryRepository;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct LengthProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for LengthProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("fail") {
                return Err(EmbeddingError::ApiError("boom".into()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn model_name(&self) -> &str {
            "length"
        }
    }

    fn record(id: &str, description: Option<&str>) -> LocationRecord {
        LocationRecord {
            content_id: id.to_string(),
            title: id.to_string(),
            description: description.map(str::to_string),
            latitude: Some(40.7),
            longitude: Some(-74.0),
            city: None,
            source_url: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_prefers_stored_then_computes_and_stores() {
        let records = vec![
            record("stored", Some("Anything")),
            record("fresh", Some("Joe's Pizza!")),
            record("blank", None),
            record("broken", Some("fail here")),
        ];
        let repo = MemoryRepository::with_records(records.clone());
        repo.store_embedding("stored", &[9.0, 9.0]).await.unwrap();

        let provider = Arc::new(LengthProvider {
            calls: AtomicUsize::new(0),
        });
        let scorer = SimilarityScorer::new(Some(provider.clone()), EmbeddingCache::new(100, 60));
        let refs: Vec<&LocationRecord> = records.iter().collect();

        let resolved = scorer.resolve_embeddings(&repo, &refs).await.unwrap();
        assert_eq!(resolved.get("stored"), Some(&[9.0f32, 9.0][..]));
        // "joe s pizza" is 11 characters
        assert_eq!(resolved.get("fresh"), Some(&[11.0f32, 1.0][..]));
        assert_eq!(resolved.get("blank"), None);
        assert_eq!(resolved.get("broken"), None);
        assert_eq!(resolved.computed, 1);
        assert_eq!(resolved.unavailable, 2);
        assert_eq!(repo.fetch_embedding("fresh").await.unwrap(), Some(vec![11.0, 1.0]));

        // Second pass is served from cache and storage
        let again = scorer.resolve_embeddings(&repo, &refs).await.unwrap();
        assert_eq!(again.computed, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_without_provider_only_reads_storage() {
        let records = vec![record("a", Some("text"))];
        let repo = MemoryRepository::with_records(records.clone());
        let scorer = SimilarityScorer::without_provider(EmbeddingCache::new(10, 60));
        let refs: Vec<&LocationRecord> = records.iter().collect();

        let resolved = scorer.resolve_embeddings(&repo, &refs).await.unwrap();
        assert!(resolved.embeddings.is_empty());
        assert_eq!(resolved.unavailable, 1);
        scorer.release();
    }
}

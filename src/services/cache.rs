use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// In-memory embedding cache
///
/// Keeps recently used description embeddings so repeated runs over the
/// same scope skip the repository round trip.
#[derive(Clone)]
pub struct EmbeddingCache {
    entries: moka::future::Cache<String, Arc<Vec<f32>>>,
}

impl EmbeddingCache {
    /// Create a new cache bounded by entry count
    pub fn new(max_entries: u64, ttl_secs: u64) -> Self {
        let entries = moka::future::CacheBuilder::new(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { entries }
    }

    pub async fn get(&self, content_id: &str) -> Option<Arc<Vec<f32>>> {
        let hit = self.entries.get(content_id).await;
        if hit.is_some() {
            tracing::trace!("Embedding cache hit: {}", content_id);
        }
        hit
    }

    pub async fn insert(&self, content_id: &str, embedding: Arc<Vec<f32>>) {
        self.entries.insert(content_id.to_string(), embedding).await;
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Get cache statistics. Pending inserts and evictions are applied
    /// first so the count is current.
    pub async fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks().await;
        CacheStats {
            entries: self.entries.entry_count(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
}

use crate::models::{
    ClassificationKey, ClassificationOutcome, ClassifiedPair, ClassifiedRecord, LocationRecord, PairKey,
    RecordFilter,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors raised by a record repository
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Store unreachable; the whole batch should be retried
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl RepositoryError {
    /// Connection, pool and I/O failures that a later attempt may not hit
    pub fn is_unavailable(&self) -> bool {
        match self {
            RepositoryError::Unavailable(_) => true,
            RepositoryError::SqlxError(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            RepositoryError::MigrateError(_) | RepositoryError::InvalidData(_) => false,
        }
    }
}

/// Narrow read/write interface to the persistent record store.
///
/// Writes are keyed upserts: writing the same key twice leaves one row
/// holding the latest outcome, so retried batches are idempotent.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Filtered read of location records
    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<LocationRecord>, RepositoryError>;

    /// Stored description embedding, if any
    async fn fetch_embedding(&self, content_id: &str) -> Result<Option<Vec<f32>>, RepositoryError>;

    /// Stored embeddings for many records; absent ids are left out
    async fn fetch_embeddings(
        &self,
        content_ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, RepositoryError> {
        let mut found = HashMap::with_capacity(content_ids.len());
        for id in content_ids {
            if let Some(embedding) = self.fetch_embedding(id).await? {
                found.insert(id.clone(), embedding);
            }
        }
        Ok(found)
    }

    async fn store_embedding(&self, content_id: &str, embedding: &[f32]) -> Result<(), RepositoryError>;

    /// Operator-tagged duplicate pairs touching any of `content_ids`
    async fn fetch_manual_overrides(
        &self,
        content_ids: &[String],
    ) -> Result<HashSet<PairKey>, RepositoryError>;

    async fn write_classification(
        &self,
        key: &ClassificationKey,
        outcome: &ClassificationOutcome,
    ) -> Result<(), RepositoryError>;

    /// Write a chunk of outcomes. Implementations may make this atomic.
    async fn write_classifications(
        &self,
        outcomes: &[(ClassificationKey, ClassificationOutcome)],
    ) -> Result<(), RepositoryError> {
        for (key, outcome) in outcomes {
            self.write_classification(key, outcome).await?;
        }
        Ok(())
    }

    /// Record-level classifications joined with their records
    async fn fetch_classified(&self, filter: &RecordFilter) -> Result<Vec<ClassifiedRecord>, RepositoryError>;

    /// Pair-level classifications where either record matches the city
    async fn fetch_pair_classifications(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<ClassifiedPair>, RepositoryError>;

    async fn health_check(&self) -> Result<bool, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(RepositoryError::Unavailable("down".into()).is_unavailable());
        assert!(RepositoryError::SqlxError(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(!RepositoryError::SqlxError(sqlx::Error::RowNotFound).is_unavailable());
        assert!(!RepositoryError::InvalidData("bad".into()).is_unavailable());
    }
}

use crate::models::domain::{ClassifiedRecord, DuplicateTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Description embeddings currently held in memory
    pub embedding_cache_entries: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

/// Outcome of one scope (batch) within a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeReport {
    pub scope: String,
    pub records_fetched: usize,
    /// Records dropped for null or out-of-range coordinates
    pub invalid_coordinates: usize,
    pub records_in_scope: usize,
    pub candidate_pairs: usize,
    /// Pairs scored 0.0 because an embedding was missing or unusable
    pub missing_similarity: usize,
    pub embeddings_computed: usize,
    pub classifications_written: usize,
    /// Record-level tier histogram
    pub tier_counts: BTreeMap<DuplicateTier, usize>,
    /// Pair-level tier histogram
    pub pair_tier_counts: BTreeMap<DuplicateTier, usize>,
    pub attempts: u32,
    pub completed: bool,
    pub error: Option<String>,
}

impl ScopeReport {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }
}

/// Summary of a classification run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub scopes: Vec<ScopeReport>,
}

impl RunReport {
    /// Every requested scope completed
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.scopes.iter().all(|s| s.completed)
    }

    pub fn failed_scopes(&self) -> impl Iterator<Item = &ScopeReport> {
        self.scopes.iter().filter(|s| s.error.is_some())
    }
}

/// Classified records grouped by tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBucketsResponse {
    pub counts: BTreeMap<DuplicateTier, usize>,
    pub buckets: BTreeMap<DuplicateTier, Vec<ClassifiedRecord>>,
    pub total: usize,
}

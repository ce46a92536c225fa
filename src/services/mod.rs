// Service exports
pub mod boundary;
pub mod cache;
pub mod dedup;
pub mod embeddings;
pub mod export;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod scorer;

pub use boundary::{load_region, BoundaryError};
pub use cache::{CacheStats, EmbeddingCache};
pub use dedup::{CancelFlag, DedupError, DedupService, PipelineOptions, Scope, ScopeError, ScopeKind};
pub use embeddings::{EmbeddingError, EmbeddingProvider, HttpEmbeddingProvider};
pub use export::{partition_by_tier, tier_counts, to_geojson};
pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::{RecordRepository, RepositoryError};
pub use scorer::{ResolvedEmbeddings, SimilarityScorer};

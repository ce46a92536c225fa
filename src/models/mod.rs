// Model exports
pub mod domain;
pub mod requests;
pub mod responses;

pub use domain::{
    BoundingBox, CandidatePair, ClassificationKey, ClassificationOutcome, ClassificationThresholds,
    ClassifiedPair, ClassifiedRecord, DuplicateTier, LocationRecord, PairClassification, PairKey,
    RecordClassification, RecordFilter,
};
pub use requests::{ClassificationQuery, RunRequest};
pub use responses::{ErrorResponse, HealthResponse, RunReport, ScopeReport, TierBucketsResponse};

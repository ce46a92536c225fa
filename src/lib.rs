//! POI Dedup - spatial + semantic duplicate classification for geotagged places
//!
//! Records are bucketed into geohash cells, scoped to an area (cell disk or
//! boundary polygon), paired by great-circle distance, scored by embedding
//! cosine similarity and assigned an ordered duplicate tier.

pub mod config;
pub mod core;
pub mod models;
pub mod routes;
pub mod services;

// Re-export commonly used types
pub use crate::core::{
    cell_of, disk_around, generate_pairs, haversine_distance, text_similarity, Classifier,
    CoreError, RegionPolygon,
};
pub use models::{CandidatePair, ClassifiedRecord, DuplicateTier, LocationRecord};

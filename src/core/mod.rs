// Core algorithm exports
pub mod candidates;
pub mod classifier;
pub mod distance;
pub mod error;
pub mod geofence;
pub mod similarity;
pub mod spatial;

pub use candidates::{generate_by_polygon, generate_by_radius, generate_pairs, RadiusScope};
pub use classifier::{strongest_per_record, titles_match, Classifier};
pub use distance::{calculate_bounding_box, haversine_distance, is_valid_coordinate, is_within_bounding_box};
pub use error::{CoreError, PolygonDefect};
pub use geofence::{filter_within_polygon, PolygonRings, RegionPolygon};
pub use similarity::{preprocess_description, scored_similarity, text_similarity};
pub use spatial::{cell_of, disk_around, SpatialCell};

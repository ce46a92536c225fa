use thiserror::Error;

/// Why a region polygon was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolygonDefect {
    /// Ring has no vertices at all, or the polygon has no rings
    Empty,
    /// Ring has fewer than 4 vertices (a closed triangle is the minimum)
    TooFewVertices { ring: usize, vertices: usize },
    /// First vertex differs from the last vertex
    Unclosed { ring: usize },
    /// A vertex is NaN or infinite
    NonFiniteVertex { ring: usize },
    /// Two non-adjacent edges of the same ring touch or cross
    SelfIntersecting { ring: usize },
}

impl std::fmt::Display for PolygonDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolygonDefect::Empty => write!(f, "polygon has no vertices"),
            PolygonDefect::TooFewVertices { ring, vertices } => {
                write!(f, "ring {} has only {} vertices", ring, vertices)
            }
            PolygonDefect::Unclosed { ring } => write!(f, "ring {} is not closed", ring),
            PolygonDefect::NonFiniteVertex { ring } => {
                write!(f, "ring {} contains a non-finite vertex", ring)
            }
            PolygonDefect::SelfIntersecting { ring } => {
                write!(f, "ring {} intersects itself", ring)
            }
        }
    }
}

/// Errors raised by the pure spatial / similarity algorithms
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("Invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Invalid resolution {0}: expected 1..=12")]
    InvalidResolution(u8),

    #[error("Disk radius {radius} exceeds the maximum of {max} cells")]
    RadiusTooLarge { radius: u32, max: u32 },

    #[error("Invalid spatial cell: {0}")]
    InvalidCell(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Polygon '{name}' is malformed: {defect}")]
    PolygonMalformed { name: String, defect: PolygonDefect },
}

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Request to start a classification run
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RunRequest {
    /// Named scopes to process; all configured scopes when absent
    #[validate(length(min = 1))]
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

/// Query string for reading classified records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationQuery {
    #[serde(default)]
    pub city: Option<String>,
    /// Tier name, case-insensitive
    #[serde(default)]
    pub tier: Option<String>,
}

//! Error types for building and parsing crates.

/// Errors raised by [`crate::CrateBuilder`] and [`crate::MetadataCrate`].
#[derive(Debug, thiserror::Error)]
pub enum CrateError {
    /// A required descriptive field is absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field is present but unusable.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// The document is not valid JSON or does not match the entity layout.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The document parsed but lacks an entity every crate must carry.
    #[error("malformed crate: {0}")]
    Malformed(String),
}

impl CrateError {
    /// Name of the offending field, for validation failures.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            CrateError::MissingField(field) => Some(field),
            CrateError::InvalidField { field, .. } => Some(field),
            _ => None,
        }
    }
}

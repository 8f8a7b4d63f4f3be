//! Error types for the stampscan library

use thiserror::Error;

/// Result type alias for stampscan operations
pub type Result<T> = std::result::Result<T, StampError>;

/// Error types for detection and identification operations
#[derive(Error, Debug)]
pub enum StampError {
    /// Input image is empty or has an unsupported layout
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },

    /// Image file could not be opened or decoded
    #[error("Image load error: {message}")]
    ImageLoad {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A candidate crop has no pixels to score
    #[error("Degenerate crop: {width}x{height}")]
    DegenerateCrop { width: i32, height: i32 },

    /// OpenCV operation failed
    #[error("OpenCV error: {operation}")]
    OpenCv {
        operation: String,
        #[source]
        source: opencv::Error,
    },

    /// A model artifact could not be loaded or provisioned
    #[error("Model load error: {message}")]
    ModelLoad {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Crop could not be encoded for the describer
    #[error("Crop encoding failed: {message}")]
    Encoding {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The external describer failed to produce a description
    #[error("Description failed: {message}")]
    Description { message: String },

    /// The external embedder failed or was given empty input
    #[error("Embedding failed: {message}")]
    Embedding { message: String },

    /// The external vector store failed
    #[error("Vector store error: {message}")]
    VectorStore { message: String },

    /// Reference entry does not exist in the store
    #[error("Reference entry not found: {id}")]
    EntryNotFound { id: String },

    /// Similarity search could not be completed
    #[error("Search failed: {message}")]
    Search { message: String },

    /// Configuration values violate an invariant
    #[error("Invalid configuration: {parameter} = {value} ({reason})")]
    InvalidConfig {
        parameter: String,
        value: String,
        reason: String,
    },

    /// Configuration file could not be read or written
    #[error("Configuration I/O error: {path}")]
    ConfigIo {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StampError {
    /// Create an OpenCV error with context
    pub fn opencv(operation: impl Into<String>, source: opencv::Error) -> Self {
        Self::OpenCv {
            operation: operation.into(),
            source,
        }
    }

    /// Create an image load error with context
    pub fn image_load<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ImageLoad {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a model load error with context
    pub fn model_load<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelLoad {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a crop encoding error with context
    pub fn encoding<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Encoding {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_config(
        parameter: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfig {
            parameter: parameter.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error only affects a single candidate or stamp.
    ///
    /// Batch operations drop the affected item and continue on these.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StampError::DegenerateCrop { .. }
                | StampError::OpenCv { .. }
                | StampError::Encoding { .. }
                | StampError::ModelLoad { .. }
        )
    }

    /// Check if this error came from an external collaborator
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            StampError::Description { .. }
                | StampError::Embedding { .. }
                | StampError::VectorStore { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_crop_is_recoverable() {
        let err = StampError::DegenerateCrop { width: 0, height: 12 };
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Degenerate crop: 0x12");
    }

    #[test]
    fn test_collaborator_errors_are_not_recoverable() {
        let err = StampError::Embedding {
            message: "provider returned 500".into(),
        };
        assert!(!err.is_recoverable());
        assert!(err.is_collaborator_failure());

        let err = StampError::VectorStore {
            message: "connection reset".into(),
        };
        assert!(err.is_collaborator_failure());
    }

    #[test]
    fn test_invalid_config_message() {
        let err = StampError::invalid_config("auto_threshold", 0.4, "must exceed min_threshold");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: auto_threshold = 0.4 (must exceed min_threshold)"
        );
    }
}

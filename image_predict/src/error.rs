use std::path::Path;

use thiserror::Error;

/// Every way a prediction run can fail. None of them are recovered from.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("failed to read checkpoint {path}: {reason}")]
    CheckpointRead { path: String, reason: String },

    #[error("failed to write checkpoint {path}: {reason}")]
    CheckpointWrite { path: String, reason: String },

    #[error("unsupported architecture `{name}`, expected one of: {supported}")]
    UnsupportedArchitecture { name: String, supported: String },

    #[error("parameter shape mismatch at {param}: model expects {expected}, checkpoint has {found}")]
    ParameterShapeMismatch {
        param: String,
        expected: String,
        found: String,
    },

    #[error("failed to preprocess image {path}: {reason}")]
    ImagePreprocessing { path: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("class `{0}` has no entry in the category names file")]
    UnknownClassIdentifier(String),

    #[error("failed to read category names from {path}: {reason}")]
    NameMappingRead { path: String, reason: String },
}

impl PredictError {
    pub fn checkpoint_read(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::CheckpointRead {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn checkpoint_write(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::CheckpointWrite {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_architecture(name: impl Into<String>, supported: &[&str]) -> Self {
        Self::UnsupportedArchitecture {
            name: name.into(),
            supported: supported.join(", "),
        }
    }

    pub fn parameter_shape_mismatch(
        param: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::ParameterShapeMismatch {
            param: param.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn image_preprocessing(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::ImagePreprocessing {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    pub fn name_mapping_read(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::NameMappingRead {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PredictError>;

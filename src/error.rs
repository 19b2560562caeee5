use thiserror::Error;

use crate::image::ImageId;

/// Root error type for classification runs.
#[derive(Error, Debug)]
pub enum Cl2dError {
    /// Invalid or unparsable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Invalid input data (empty image set, mismatched shapes, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// The external image store could not produce an image.
    #[error("image store error for image {id}: {reason}")]
    ImageStore { id: ImageId, reason: String },

    /// Every class lost all of its members; the data is too noisy for the
    /// similarity measure in use.
    #[error("unclassifiable data: {0}")]
    Unclassifiable(String),

    /// Workers disagreed on a collective exchange.
    #[error("collective exchange error: {0}")]
    Collective(String),

    #[error("output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Cl2dResult<T> = Result<T, Cl2dError>;

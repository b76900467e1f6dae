//! Error types for the document store and the export pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A required document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// A local dump could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A document could not be decoded.
    #[error("invalid document: {0}")]
    Json(#[from] serde_json::Error),

    /// The HTTP request itself failed.
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The store could not be reached at all.
    #[error("cannot connect to document store at {0}")]
    Unavailable(String),

    /// The store settings cannot work.
    #[error("invalid store configuration: {0}")]
    Config(String),
}

/// Failures raised by an export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("dataSet \"{0}\" is not defined")]
    DataSetNotDefined(String),

    #[error("dataSet \"{0}\" has no dataElements")]
    NoDataElements(String),

    #[error("invalid period \"{input}\": {reason}")]
    InvalidPeriod { input: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExportError {
    /// True for errors caused by the DHIS configuration rather than the store.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ExportError::DataSetNotDefined(_) | ExportError::NoDataElements(_)
        )
    }
}

//! Error taxonomy for the churn pipeline

use thiserror::Error;

/// Failures surfaced by pipeline operations.
///
/// Every variant is terminal for the call that raised it: the pipeline is
/// deterministic over its inputs, so nothing is retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An expected column is missing, ambiguous or holds unusable values.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// A required table, group or fold has zero rows.
    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    /// An invalid parameter was supplied.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The classifier could not be fit.
    #[error("model fit error: {0}")]
    ModelFit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    pub(crate) fn empty(msg: impl Into<String>) -> Self {
        Self::EmptyDataset(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn fit(msg: impl Into<String>) -> Self {
        Self::ModelFit(msg.into())
    }
}

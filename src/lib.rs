//! ChurnForge: customer churn prediction and purchase-trend analysis
//!
//! Raw customer, product and purchase tables are turned into per-customer RFM
//! (Recency, Frequency, Monetary) features, a churn label is derived from
//! recency, and a logistic regression classifier is trained and scored on a
//! seeded hold-out split. A second path projects per-purchase features onto
//! principal components before training. Descriptive purchase trends are
//! computed from the same tables.

pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod features;
pub mod metrics;
pub mod model;
pub mod reduction;
pub mod scaling;
pub mod service;
pub mod split;
pub mod trends;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use config::AppConfig;
pub use data::{CsvDataSource, DataSource, Tables};
pub use error::PipelineError;
pub use events::{NoopSink, PipelineEvent, PipelineVariant, ResultSink, SnapshotWorker};
pub use metrics::ClassificationReport;
pub use model::Evaluation;
pub use service::{AnalysisSettings, CustomerAnalysis};
pub use trends::{TieBreak, TrendReport};

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, PipelineError>;

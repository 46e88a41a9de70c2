//! Configuration management for the churn pipeline

use crate::data::{parse_timestamp, CsvDataSource, CUSTOMERS_FILE, PRODUCTS_FILE, PURCHASES_FILE};
use crate::error::PipelineError;
use crate::events::SnapshotSettings;
use crate::features::CHURN_THRESHOLD_DAYS;
use crate::model::TrainParams;
use crate::reduction::DEFAULT_COMPONENTS;
use crate::service::AnalysisSettings;
use crate::split::SplitParams;
use crate::trends::TieBreak;
use chrono::NaiveDateTime;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "CHURNFORGE";
/// Looked up in the working directory when no explicit file is given
pub const DEFAULT_CONFIG_FILE: &str = "churnforge.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub data: DataConfig,
    pub output: OutputConfig,
    pub model: ModelConfig,
    pub trends: TrendsConfig,
    pub logging: LoggingConfig,
}

/// Where the three input tables live
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    pub dir: PathBuf,
    pub customers_file: String,
    pub products_file: String,
    pub purchases_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            customers_file: CUSTOMERS_FILE.to_string(),
            products_file: PRODUCTS_FILE.to_string(),
            purchases_file: PURCHASES_FILE.to_string(),
        }
    }
}

/// Side artifacts
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Metric snapshots and charts go here
    pub dir: PathBuf,
    /// RFM table dump; empty disables it
    pub rfm_snapshot: Option<PathBuf>,
    pub snapshots: bool,
    pub charts: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("graphs"),
            rfm_snapshot: Some(PathBuf::from("rfm_snapshot.csv")),
            snapshots: true,
            charts: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub churn_threshold_days: i64,
    pub test_fraction: f64,
    pub seed: u64,
    pub reuse_train_scaler: bool,
    /// Inverse regularization strength
    pub c: f64,
    pub baseline_max_iter: usize,
    pub reduced_max_iter: usize,
    /// Principal components kept by `churn-reduced` unless `-k` is given
    pub components: usize,
    /// Fixed "now" for recency (RFC 3339, `YYYY-MM-DD HH:MM:SS` or a bare date)
    pub reference_date: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let baseline = TrainParams::baseline();
        Self {
            churn_threshold_days: CHURN_THRESHOLD_DAYS,
            test_fraction: SplitParams::default().test_fraction,
            seed: SplitParams::default().seed,
            reuse_train_scaler: true,
            c: baseline.c,
            baseline_max_iter: baseline.max_iter,
            reduced_max_iter: TrainParams::reduced().max_iter,
            components: DEFAULT_COMPONENTS,
            reference_date: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrendsConfig {
    pub tie_break: TieBreak,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration, later sources overriding earlier ones:
    /// 1. `churnforge.toml` in the working directory, if present
    /// 2. `path`, if given (must exist)
    /// 3. `CHURNFORGE__SECTION__KEY` environment variables
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder =
            Config::builder().add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| PipelineError::config(format!("failed to load configuration: {e}")))
    }

    pub fn data_source(&self) -> CsvDataSource {
        let dir = &self.data.dir;
        CsvDataSource::with_files(
            dir.join(&self.data.customers_file),
            dir.join(&self.data.products_file),
            dir.join(&self.data.purchases_file),
        )
    }

    /// The configured reference date, if any
    pub fn as_of(&self) -> crate::Result<Option<NaiveDateTime>> {
        self.model
            .reference_date
            .as_deref()
            .map(|raw| {
                parse_timestamp(raw).ok_or_else(|| {
                    PipelineError::config(format!("unparseable reference_date {raw:?}"))
                })
            })
            .transpose()
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        let model = &self.model;
        AnalysisSettings {
            churn_threshold_days: model.churn_threshold_days,
            split: SplitParams {
                test_fraction: model.test_fraction,
                seed: model.seed,
            },
            baseline: TrainParams {
                c: model.c,
                max_iter: model.baseline_max_iter,
                ..TrainParams::baseline()
            },
            reduced: TrainParams {
                c: model.c,
                max_iter: model.reduced_max_iter,
                ..TrainParams::reduced()
            },
            reuse_train_scaler: model.reuse_train_scaler,
            tie_break: self.trends.tie_break,
            rfm_snapshot: self
                .output
                .rfm_snapshot
                .clone()
                .filter(|p| !p.as_os_str().is_empty()),
        }
    }

    /// `None` when snapshots are switched off
    pub fn snapshot_settings(&self) -> Option<SnapshotSettings> {
        self.output.snapshots.then(|| SnapshotSettings {
            output_dir: self.output.dir.clone(),
            render_charts: self.output.charts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.data.dir, PathBuf::from("data"));
        assert_eq!(config.output.dir, PathBuf::from("graphs"));
        assert_eq!(config.model.churn_threshold_days, 90);
        assert_eq!(config.model.components, 2);
        assert_eq!(config.trends.tie_break, TieBreak::FirstOccurrence);

        let settings = config.analysis_settings();
        assert_eq!(settings.split, SplitParams::default());
        assert_eq!(settings.baseline, TrainParams::baseline());
        assert_eq!(settings.reduced, TrainParams::reduced());
        assert!(settings.reuse_train_scaler);
        assert_eq!(settings.rfm_snapshot, Some(PathBuf::from("rfm_snapshot.csv")));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[data]
dir = "/srv/shop"

[model]
test_fraction = 0.25
components = 4
reference_date = "2024-06-30"

[trends]
tie_break = "customer-id"

[output]
rfm_snapshot = ""
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.data.dir, PathBuf::from("/srv/shop"));
        assert_eq!(config.data.purchases_file, "purchases.csv");
        assert_eq!(config.model.test_fraction, 0.25);
        assert_eq!(config.model.components, 4);
        assert_eq!(config.trends.tie_break, TieBreak::CustomerId);
        assert_eq!(config.analysis_settings().rfm_snapshot, None);

        let as_of = config.as_of().unwrap().unwrap();
        assert_eq!(as_of.to_string(), "2024-06-30 00:00:00");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/churnforge.toml")));
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_bad_reference_date() {
        let mut config = AppConfig::default();
        config.model.reference_date = Some("last tuesday".to_string());
        assert!(config.as_of().is_err());

        config.model.reference_date = None;
        assert_eq!(config.as_of().unwrap(), None);
    }

    #[test]
    fn test_snapshot_settings_toggle() {
        let mut config = AppConfig::default();
        let settings = config.snapshot_settings().unwrap();
        assert_eq!(settings.output_dir, PathBuf::from("graphs"));
        assert!(settings.render_charts);

        config.output.snapshots = false;
        assert!(config.snapshot_settings().is_none());
    }
}

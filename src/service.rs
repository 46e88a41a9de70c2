//! Pipeline entry points
//!
//! `CustomerAnalysis` holds no state between calls: each operation reloads the
//! tables from its source and runs the full chain from scratch.

use crate::data::DataSource;
use crate::events::{NoopSink, PipelineEvent, PipelineVariant, ResultSink};
use crate::features::{baseline_matrix, build_features, try_write_rfm_snapshot, CHURN_THRESHOLD_DAYS};
use crate::model::{evaluate, train, Evaluation, TrainParams};
use crate::reduction::reduce;
use crate::split::{train_test_split, Split, SplitParams};
use crate::trends::{self, TieBreak, TrendReport};
use chrono::{Local, NaiveDateTime};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

/// Tunables shared by every pipeline call
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub churn_threshold_days: i64,
    pub split: SplitParams,
    pub baseline: TrainParams,
    pub reduced: TrainParams,
    /// Standardize the test fold with the scaler fitted on the training fold
    pub reuse_train_scaler: bool,
    pub tie_break: TieBreak,
    /// Where to drop the RFM table after each baseline run, if anywhere
    pub rfm_snapshot: Option<PathBuf>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            churn_threshold_days: CHURN_THRESHOLD_DAYS,
            split: SplitParams::default(),
            baseline: TrainParams::baseline(),
            reduced: TrainParams::reduced(),
            reuse_train_scaler: true,
            tie_break: TieBreak::default(),
            rfm_snapshot: None,
        }
    }
}

pub struct CustomerAnalysis<S: DataSource> {
    source: S,
    settings: AnalysisSettings,
    as_of: Option<NaiveDateTime>,
    sink: Arc<dyn ResultSink>,
}

impl<S: DataSource> CustomerAnalysis<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            settings: AnalysisSettings::default(),
            as_of: None,
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_settings(mut self, settings: AnalysisSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Pin "now" for recency. Without it the local wall-clock time is read per call,
    /// matching naive purchase timestamps recorded in local time.
    pub fn with_as_of(mut self, as_of: NaiveDateTime) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    fn as_of(&self) -> NaiveDateTime {
        self.as_of.unwrap_or_else(|| Local::now().naive_local())
    }

    /// Baseline churn model over per-customer RFM features.
    #[instrument(skip(self))]
    pub fn predict_churn(&self) -> crate::Result<Evaluation> {
        let tables = self.source.load()?;
        let features = build_features(&tables, self.as_of(), self.settings.churn_threshold_days)?;
        if let Some(path) = &self.settings.rfm_snapshot {
            try_write_rfm_snapshot(&features, path);
        }

        let (x, y) = baseline_matrix(&features);
        let split = train_test_split(&x, &y, &self.settings.split)?;
        let evaluation = self.fit_and_score(&split, &self.settings.baseline)?;

        self.publish_evaluation(PipelineVariant::Baseline, &evaluation);
        Ok(evaluation)
    }

    /// Churn model over principal components of per-purchase features.
    #[instrument(skip(self))]
    pub fn predict_churn_reduced(&self, n_components: usize) -> crate::Result<Evaluation> {
        let tables = self.source.load()?;
        let split = reduce(
            &tables,
            self.as_of(),
            self.settings.churn_threshold_days,
            n_components,
            &self.settings.split,
        )?;
        let evaluation = self.fit_and_score(&split, &self.settings.reduced)?;

        self.publish_evaluation(PipelineVariant::Reduced, &evaluation);
        Ok(evaluation)
    }

    #[instrument(skip(self))]
    pub fn analyze_trends(&self) -> crate::Result<TrendReport> {
        let tables = self.source.load()?;
        let report = trends::analyze_trends(&tables, self.settings.tie_break)?;

        self.sink.publish(PipelineEvent::TrendsAnalyzed {
            report: report.clone(),
        });
        Ok(report)
    }

    fn fit_and_score(&self, split: &Split, params: &TrainParams) -> crate::Result<Evaluation> {
        let model = train(&split.x_train, &split.y_train, params)?;
        evaluate(
            &model,
            &split.x_test,
            &split.y_test,
            self.settings.reuse_train_scaler,
        )
    }

    fn publish_evaluation(&self, variant: PipelineVariant, evaluation: &Evaluation) {
        info!(
            variant = variant.key(),
            accuracy = evaluation.accuracy,
            "Churn prediction complete"
        );
        self.sink.publish(PipelineEvent::ChurnEvaluated {
            variant,
            evaluation: evaluation.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;
    use crate::data::Tables;
    use crate::error::PipelineError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<PipelineEvent>>,
    }

    impl ResultSink for RecordingSink {
        fn publish(&self, event: PipelineEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn analysis(tables: Tables) -> CustomerAnalysis<Tables> {
        CustomerAnalysis::new(tables).with_as_of(as_of())
    }

    fn assert_well_formed(evaluation: &Evaluation, test_rows: usize) {
        let report = &evaluation.classification_report;
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
        assert_eq!(evaluation.accuracy, report.accuracy);
        assert!(report.class(0).is_some());
        assert!(report.class(1).is_some());
        let support: usize = report.classes.values().map(|m| m.support).sum();
        assert_eq!(support, test_rows);
        assert_eq!(report.weighted_avg.support, test_rows);
    }

    #[test]
    fn test_predict_churn() {
        let evaluation = analysis(cohort_tables()).predict_churn().unwrap();
        // 20 customers, round(0.3 * 20) held out
        assert_well_formed(&evaluation, 6);
        // Recency alone separates the classes
        assert!(evaluation.accuracy > 0.8);
    }

    #[test]
    fn test_predict_churn_is_deterministic() {
        let service = analysis(cohort_tables());
        assert_eq!(service.predict_churn().unwrap(), service.predict_churn().unwrap());
    }

    #[test]
    fn test_predict_churn_reduced() {
        let service = analysis(cohort_tables());
        let purchases = cohort_tables().purchases.len();

        for k in 1..=3 {
            let evaluation = service.predict_churn_reduced(k).unwrap();
            assert_well_formed(&evaluation, (0.3 * purchases as f64).round() as usize);
        }

        assert!(matches!(
            service.predict_churn_reduced(0),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            service.predict_churn_reduced(7),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_fresh_test_scaler_still_scores() {
        let settings = AnalysisSettings {
            reuse_train_scaler: false,
            ..AnalysisSettings::default()
        };
        let evaluation = analysis(cohort_tables())
            .with_settings(settings)
            .predict_churn()
            .unwrap();
        assert_well_formed(&evaluation, 6);
    }

    #[test]
    fn test_results_are_published() {
        let sink = Arc::new(RecordingSink::default());
        let service = analysis(cohort_tables()).with_sink(sink.clone());

        service.predict_churn().unwrap();
        service.predict_churn_reduced(2).unwrap();
        service.analyze_trends().unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            PipelineEvent::ChurnEvaluated {
                variant: PipelineVariant::Baseline,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            PipelineEvent::ChurnEvaluated {
                variant: PipelineVariant::Reduced,
                ..
            }
        ));
        assert!(matches!(events[2], PipelineEvent::TrendsAnalyzed { .. }));
    }

    #[test]
    fn test_failures_publish_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let mut tables = cohort_tables();
        tables.purchases.clear();
        let service = analysis(tables).with_sink(sink.clone());

        assert!(matches!(
            service.predict_churn(),
            Err(PipelineError::EmptyDataset(_))
        ));
        assert!(matches!(
            service.analyze_trends(),
            Err(PipelineError::EmptyDataset(_))
        ));
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rfm_snapshot_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("rfm_snapshot.csv");
        let settings = AnalysisSettings {
            rfm_snapshot: Some(path.clone()),
            ..AnalysisSettings::default()
        };

        analysis(cohort_tables())
            .with_settings(settings)
            .predict_churn()
            .unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.starts_with("CustomerID,Recency"));
        assert_eq!(written.lines().count(), 21);
    }

    #[test]
    fn test_single_class_training_fails() {
        // Every customer is active, so only one label exists
        let mut tables = cohort_tables();
        for purchase in &mut tables.purchases {
            purchase.purchase_date = as_of();
        }
        assert!(matches!(
            analysis(tables).predict_churn(),
            Err(PipelineError::ModelFit(_))
        ));
    }

    #[test]
    fn test_reference_time_defaults_to_local_clock() {
        let before = Local::now().naive_local();
        let now = CustomerAnalysis::new(example_tables()).as_of();
        let after = Local::now().naive_local();
        assert!(before <= now && now <= after);

        assert_eq!(analysis(example_tables()).as_of(), as_of());
    }

    #[test]
    fn test_service_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CustomerAnalysis<Tables>>();
    }
}

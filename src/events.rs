//! Outbound result events and the background snapshot worker
//!
//! The pipeline publishes each finished result here and moves on. Whatever a
//! sink does with it (JSON snapshots, charts) happens off the caller's thread
//! and can never fail the pipeline call.

use crate::model::Evaluation;
use crate::trends::TrendReport;
use crate::viz;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Which modeling path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    Baseline,
    Reduced,
}

impl PipelineVariant {
    pub const ALL: [PipelineVariant; 2] = [Self::Baseline, Self::Reduced];

    /// Stable key used in snapshot and chart file names
    pub fn key(self) -> &'static str {
        match self {
            Self::Baseline => "logistic_regression",
            Self::Reduced => "pca_logistic_regression",
        }
    }

    /// Human-readable name for chart captions
    pub fn label(self) -> &'static str {
        match self {
            Self::Baseline => "Logistic Regression",
            Self::Reduced => "PCA + Logistic Regression",
        }
    }

    pub fn snapshot_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_metrics.json", self.key()))
    }
}

/// A finished pipeline result
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ChurnEvaluated {
        variant: PipelineVariant,
        evaluation: Evaluation,
    },
    TrendsAnalyzed {
        report: TrendReport,
    },
}

/// Fire-and-forget consumer of pipeline results
pub trait ResultSink: Send + Sync {
    /// Hand off an event. Must not block on, or report, downstream work.
    fn publish(&self, event: PipelineEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ResultSink for NoopSink {
    fn publish(&self, _event: PipelineEvent) {}
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub output_dir: PathBuf,
    pub render_charts: bool,
}

/// Writes metric snapshots (and optionally charts) on a dedicated thread
pub struct SnapshotWorker {
    sender: Mutex<Option<Sender<PipelineEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotWorker {
    /// Start the writer thread.
    ///
    /// # Arguments
    /// * `settings` - Output directory and whether to render charts
    ///
    /// # Returns
    /// A sink handle; the thread runs until [`SnapshotWorker::shutdown`] or drop
    pub fn spawn(settings: SnapshotSettings) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("snapshot-worker".to_string())
            .spawn(move || run(receiver, settings))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop accepting events and wait for queued ones to drain.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Snapshot worker panicked");
            }
        }
    }
}

impl ResultSink for SnapshotWorker {
    fn publish(&self, event: PipelineEvent) {
        let Ok(guard) = self.sender.lock() else {
            return;
        };
        match guard.as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    warn!("Snapshot worker is gone; dropping event");
                }
            }
            None => debug!("Snapshot worker shut down; dropping event"),
        }
    }
}

impl Drop for SnapshotWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(receiver: Receiver<PipelineEvent>, settings: SnapshotSettings) {
    for event in receiver {
        if let Err(e) = handle_event(&event, &settings) {
            warn!(error = %format!("{e:#}"), "Snapshot task failed");
        }
    }
    debug!("Snapshot worker stopped");
}

fn handle_event(event: &PipelineEvent, settings: &SnapshotSettings) -> anyhow::Result<()> {
    std::fs::create_dir_all(&settings.output_dir).with_context(|| {
        format!("creating output directory {}", settings.output_dir.display())
    })?;

    match event {
        PipelineEvent::ChurnEvaluated {
            variant,
            evaluation,
        } => {
            let path = variant.snapshot_path(&settings.output_dir);
            write_json(&path, evaluation)?;
            info!(variant = variant.key(), path = %path.display(), "Wrote metrics snapshot");

            if settings.render_charts {
                viz::render_variant_chart(&settings.output_dir, *variant, evaluation)?;
                viz::render_comparison_if_ready(&settings.output_dir)?;
            }
        }
        PipelineEvent::TrendsAnalyzed { report } => {
            let path = settings.output_dir.join("trends.json");
            write_json(&path, report)?;
            info!(path = %path.display(), "Wrote trends snapshot");
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("serializing {}", path.display()))?;
    Ok(())
}

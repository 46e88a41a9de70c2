//! Evaluation charts rendered with Plotters from metric snapshots

use crate::events::PipelineVariant;
use crate::model::Evaluation;
use anyhow::Context;
use plotters::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;

pub const ACCURACY_CHART: &str = "model_accuracy_comparison.png";
pub const COMPARISON_CHART: &str = "model_comparison_f1_accuracy.png";

const SKY_BLUE: RGBColor = RGBColor(135, 206, 235);
const ORANGE: RGBColor = RGBColor(255, 165, 0);
const SERIES_COLORS: [RGBColor; 2] = [SKY_BLUE, ORANGE];

pub fn f1_chart_path(dir: &Path, variant: PipelineVariant) -> PathBuf {
    dir.join(format!("{}_f1_scores.png", variant.key()))
}

/// Read a variant's metric snapshot; `None` when it has not been written yet.
pub fn load_snapshot(dir: &Path, variant: PipelineVariant) -> anyhow::Result<Option<Evaluation>> {
    let path = variant.snapshot_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let evaluation = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(evaluation))
}

/// F1 per class followed by the macro and weighted averages
pub fn f1_bars(evaluation: &Evaluation) -> Vec<(String, f64)> {
    let report = &evaluation.classification_report;
    let mut bars: Vec<(String, f64)> = report
        .classes
        .iter()
        .map(|(label, metrics)| (format!("class {label}"), metrics.f1_score))
        .collect();
    bars.push(("macro avg".to_string(), report.macro_avg.f1_score));
    bars.push(("weighted avg".to_string(), report.weighted_avg.f1_score));
    bars
}

pub fn render_variant_chart(
    dir: &Path,
    variant: PipelineVariant,
    evaluation: &Evaluation,
) -> anyhow::Result<PathBuf> {
    let path = f1_chart_path(dir, variant);
    let bars = f1_bars(evaluation);
    draw_bar_chart(
        &path,
        &format!("{} F1 Scores", variant.label()),
        "F1 Score",
        &bars,
    )?;
    info!(path = %path.display(), "Saved F1 chart");
    Ok(path)
}

/// Draw the cross-model charts once both snapshots exist.
///
/// Returns whether anything was rendered.
pub fn render_comparison_if_ready(dir: &Path) -> anyhow::Result<bool> {
    let mut loaded = Vec::with_capacity(PipelineVariant::ALL.len());
    for variant in PipelineVariant::ALL {
        match load_snapshot(dir, variant)? {
            Some(evaluation) => loaded.push((variant, evaluation)),
            None => return Ok(false),
        }
    }

    let accuracy: Vec<(String, f64)> = loaded
        .iter()
        .map(|(variant, e)| (variant.label().to_string(), e.accuracy))
        .collect();
    draw_bar_chart(
        &dir.join(ACCURACY_CHART),
        "Model Accuracy Comparison",
        "Accuracy",
        &accuracy,
    )?;

    let groups: Vec<&str> = loaded.iter().map(|(variant, _)| variant.label()).collect();
    let f1: Vec<f64> = loaded
        .iter()
        .map(|(_, e)| e.classification_report.weighted_avg.f1_score)
        .collect();
    let acc: Vec<f64> = loaded.iter().map(|(_, e)| e.accuracy).collect();
    draw_grouped_chart(
        &dir.join(COMPARISON_CHART),
        "F1 Score vs Accuracy",
        &groups,
        &[("Weighted F1", f1), ("Accuracy", acc)],
    )?;

    info!(dir = %dir.display(), "Saved model comparison charts");
    Ok(true)
}

/// One bar per entry, value printed above it
fn draw_bar_chart(
    output_path: &Path,
    title: &str,
    y_desc: &str,
    bars: &[(String, f64)],
) -> anyhow::Result<()> {
    let n = bars.len().max(1) as f64;

    let root = BitMapBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(20)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5f64..(n - 0.5), 0f64..1.1)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_label_formatter(&|_| String::new())
        .y_desc(y_desc)
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    for (i, (label, value)) in bars.iter().enumerate() {
        let x = i as f64;
        let color = SERIES_COLORS[i % SERIES_COLORS.len()];
        chart.draw_series(std::iter::once(Rectangle::new(
            [(x - 0.35, 0.0), (x + 0.35, *value)],
            color.filled(),
        )))?;
        chart.draw_series(std::iter::once(Text::new(
            format!("{label}: {value:.2}"),
            (x - 0.35, value + 0.03),
            ("sans-serif", 14),
        )))?;
    }

    root.present()?;
    Ok(())
}

/// Side-by-side bars per group, one color per series
fn draw_grouped_chart(
    output_path: &Path,
    title: &str,
    groups: &[&str],
    series: &[(&str, Vec<f64>)],
) -> anyhow::Result<()> {
    let n = groups.len().max(1) as f64;
    let width = 0.8 / series.len().max(1) as f64;

    let root = BitMapBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(20)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5f64..(n - 0.5), 0f64..1.1)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_label_formatter(&|_| String::new())
        .y_desc("Score")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    for (s, (name, values)) in series.iter().enumerate() {
        let color = SERIES_COLORS[s % SERIES_COLORS.len()];
        let offset = -0.4 + s as f64 * width;
        chart
            .draw_series(values.iter().enumerate().map(|(g, &value)| {
                let left = g as f64 + offset;
                Rectangle::new([(left, 0.0), (left + width, value)], color.filled())
            }))?
            .label(*name)
            .legend(move |(x, y)| Rectangle::new([(x, y), (x + 10, y + 10)], color.filled()));
    }

    for (g, group) in groups.iter().enumerate() {
        chart.draw_series(std::iter::once(Text::new(
            group.to_string(),
            (g as f64 - 0.4, 1.05),
            ("sans-serif", 14),
        )))?;
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

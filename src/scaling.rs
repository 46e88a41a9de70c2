//! Feature standardization (zero mean, unit variance)

use crate::error::PipelineError;
use ndarray::{Array1, Array2, Axis};

/// Columns with a standard deviation below this are left unscaled
const MIN_SCALE: f64 = 1e-12;

/// Per-column z-score transform fitted on one feature block
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    /// Fit column means and population standard deviations.
    pub fn fit(x: &Array2<f64>) -> crate::Result<Self> {
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| PipelineError::empty("cannot fit a scaler on zero rows"))?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > MIN_SCALE { s } else { 1.0 });

        Ok(Self { mean, scale })
    }

    pub fn transform(&self, x: &Array2<f64>) -> crate::Result<Array2<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(PipelineError::config(format!(
                "scaler fitted on {} features, got {}",
                self.mean.len(),
                x.ncols()
            )));
        }
        Ok((x - &self.mean) / &self.scale)
    }

    pub fn fit_transform(x: &Array2<f64>) -> crate::Result<(Self, Array2<f64>)> {
        let scaler = Self::fit(x)?;
        let scaled = scaler.transform(x)?;
        Ok((scaler, scaled))
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}

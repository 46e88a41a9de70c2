//! Seeded train/test partitioning

use crate::error::PipelineError;
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SplitParams {
    /// Fraction of rows held out for evaluation, in (0, 1)
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for SplitParams {
    fn default() -> Self {
        Self {
            test_fraction: 0.3,
            seed: 42,
        }
    }
}

/// Train and test folds of one feature matrix
#[derive(Debug, Clone)]
pub struct Split {
    pub x_train: Array2<f64>,
    pub x_test: Array2<f64>,
    pub y_train: Array1<usize>,
    pub y_test: Array1<usize>,
    /// Source row of each training sample
    pub train_indices: Vec<usize>,
    /// Source row of each test sample
    pub test_indices: Vec<usize>,
}

/// Partition rows uniformly at random.
///
/// |test| = round(test_fraction * N). The same input and seed always yield
/// the same rows in the same order. Class balance is not enforced.
pub fn train_test_split(
    x: &Array2<f64>,
    y: &Array1<usize>,
    params: &SplitParams,
) -> crate::Result<Split> {
    if !(params.test_fraction > 0.0 && params.test_fraction < 1.0) {
        return Err(PipelineError::config(format!(
            "test_fraction must be in (0, 1), got {}",
            params.test_fraction
        )));
    }
    if x.nrows() != y.len() {
        return Err(PipelineError::config(format!(
            "feature rows ({}) and labels ({}) differ in length",
            x.nrows(),
            y.len()
        )));
    }

    let n = x.nrows();
    let n_test = (params.test_fraction * n as f64).round() as usize;

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    indices.shuffle(&mut rng);

    let test_indices = indices[..n_test].to_vec();
    let train_indices = indices[n_test..].to_vec();

    Ok(Split {
        x_train: x.select(Axis(0), &train_indices),
        x_test: x.select(Axis(0), &test_indices),
        y_train: y.select(Axis(0), &train_indices),
        y_test: y.select(Axis(0), &test_indices),
        train_indices,
        test_indices,
    })
}

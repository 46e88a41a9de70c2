//! Logistic regression churn classifier training and evaluation

use crate::error::PipelineError;
use crate::metrics::{accuracy, classification_report, ClassificationReport};
use crate::scaling::StandardScaler;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const MAX_BACKTRACK: usize = 30;

/// How training samples are weighted in the loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassWeight {
    /// Every sample counts once
    #[default]
    Uniform,
    /// Each class contributes equally: w_c = n / (2 * n_c)
    Balanced,
}

/// Classifier hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    /// Inverse L2 regularization strength
    pub c: f64,
    pub max_iter: usize,
    pub tol: f64,
    pub class_weight: ClassWeight,
}

impl TrainParams {
    /// Settings for the RFM feature path
    pub fn baseline() -> Self {
        Self {
            c: 1.0,
            max_iter: 100,
            tol: 1e-6,
            class_weight: ClassWeight::Uniform,
        }
    }

    /// Settings for the principal component path, which is skewed and slower
    /// to converge
    pub fn reduced() -> Self {
        Self {
            max_iter: 1000,
            class_weight: ClassWeight::Balanced,
            ..Self::baseline()
        }
    }
}

impl Default for TrainParams {
    fn default() -> Self {
        Self::baseline()
    }
}

/// L2-regularized binary logistic regression fitted by Newton's method
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    pub coefficients: Array1<f64>,
    pub intercept: f64,
    /// Newton iterations actually taken
    pub n_iter: usize,
    pub converged: bool,
}

impl LogisticRegression {
    /// Fit on labels in {0, 1}.
    pub fn fit(x: &Array2<f64>, y: &Array1<usize>, params: &TrainParams) -> crate::Result<Self> {
        let (n, d) = x.dim();
        if n == 0 {
            return Err(PipelineError::empty("training set has zero rows"));
        }
        if y.len() != n {
            return Err(PipelineError::config(format!(
                "training rows ({n}) and labels ({}) differ in length",
                y.len()
            )));
        }
        if params.c <= 0.0 {
            return Err(PipelineError::config(format!("C must be positive, got {}", params.c)));
        }
        if let Some(bad) = y.iter().find(|&&label| label > 1) {
            return Err(PipelineError::fit(format!("labels must be 0 or 1, found {bad}")));
        }
        let positives = y.iter().filter(|&&label| label == 1).count();
        if positives == 0 || positives == n {
            return Err(PipelineError::fit(format!(
                "training labels contain a single class ({} samples of class {})",
                n,
                usize::from(positives == n)
            )));
        }

        let weights = sample_weights(y, positives, params.class_weight);
        let targets = y.mapv(|label| label as f64);

        // Design matrix with a trailing intercept column
        let mut design = Array2::ones((n, d + 1));
        design.slice_mut(s![.., ..d]).assign(x);

        let penalty = 1.0 / params.c;
        let mut theta = Array1::<f64>::zeros(d + 1);
        let mut loss = objective(&design, &targets, &weights, &theta, penalty);
        let mut converged = false;
        let mut n_iter = 0;

        while n_iter < params.max_iter {
            n_iter += 1;
            let p = sigmoid(&design.dot(&theta));

            let residual = (&p - &targets) * &weights;
            let mut gradient = design.t().dot(&residual);
            for j in 0..d {
                gradient[j] += penalty * theta[j];
            }

            let curvature = &weights * &p.mapv(|v| v * (1.0 - v));
            let weighted = &design * &curvature.view().insert_axis(ndarray::Axis(1));
            let mut hessian = design.t().dot(&weighted);
            for j in 0..d {
                hessian[[j, j]] += penalty;
            }
            hessian[[d, d]] += 1e-10;

            let step = cholesky_solve(&hessian, &gradient).ok_or_else(|| {
                PipelineError::fit("Hessian is not positive definite".to_string())
            })?;

            // Backtracking keeps each update a descent step
            let mut scale = 1.0;
            let mut accepted = false;
            for _ in 0..MAX_BACKTRACK {
                let candidate = &theta - &(&step * scale);
                let candidate_loss = objective(&design, &targets, &weights, &candidate, penalty);
                if candidate_loss <= loss {
                    theta = candidate;
                    loss = candidate_loss;
                    accepted = true;
                    break;
                }
                scale *= 0.5;
            }

            let step_size = step.iter().fold(0.0_f64, |m, v| m.max(v.abs())) * scale;
            if !accepted || step_size < params.tol {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(
                max_iter = params.max_iter,
                "Logistic regression did not converge; raise max_iter"
            );
        }
        debug!(n_iter, loss, "Fitted logistic regression");

        if theta.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::fit("coefficients diverged".to_string()));
        }

        Ok(Self {
            coefficients: theta.slice(s![..d]).to_owned(),
            intercept: theta[d],
            n_iter,
            converged,
        })
    }

    pub fn decision_function(&self, x: &Array2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        sigmoid(&self.decision_function(x))
    }

    pub fn predict(&self, x: &Array2<f64>) -> Array1<usize> {
        self.decision_function(x)
            .mapv(|z| if z > 0.0 { 1 } else { 0 })
    }
}

fn sigmoid(z: &Array1<f64>) -> Array1<f64> {
    z.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Weighted negative log-likelihood plus the L2 penalty on coefficients
fn objective(
    design: &Array2<f64>,
    targets: &Array1<f64>,
    weights: &Array1<f64>,
    theta: &Array1<f64>,
    penalty: f64,
) -> f64 {
    let d = theta.len() - 1;
    let z = design.dot(theta);
    let nll: f64 = z
        .iter()
        .zip(targets)
        .zip(weights)
        .map(|((&z, &t), &w)| {
            // log(1 + e^z) - t*z, computed without overflow
            let softplus = if z > 0.0 {
                z + (-z).exp().ln_1p()
            } else {
                z.exp().ln_1p()
            };
            w * (softplus - t * z)
        })
        .sum();
    let ridge: f64 = theta.slice(s![..d]).mapv(|v| v * v).sum();
    nll + 0.5 * penalty * ridge
}

fn sample_weights(y: &Array1<usize>, positives: usize, class_weight: ClassWeight) -> Array1<f64> {
    match class_weight {
        ClassWeight::Uniform => Array1::ones(y.len()),
        ClassWeight::Balanced => {
            let n = y.len() as f64;
            let w1 = n / (2.0 * positives as f64);
            let w0 = n / (2.0 * (y.len() - positives) as f64);
            y.mapv(|label| if label == 1 { w1 } else { w0 })
        }
    }
}

/// Solve the symmetric positive-definite system A x = b.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward substitution: L y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let sum: f64 = (0..i).map(|j| l[[i, j]] * y[j]).sum();
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // Back substitution: L^T x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = ((i + 1)..n).map(|j| l[[j, i]] * x[j]).sum();
        x[i] = (y[i] - sum) / l[[i, i]];
    }

    Some(x)
}

/// Scaler and classifier fitted together on the training fold
#[derive(Debug, Clone)]
pub struct ChurnModel {
    pub scaler: StandardScaler,
    pub classifier: LogisticRegression,
}

/// Accuracy plus the full classification report on the test fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub accuracy: f64,
    pub classification_report: ClassificationReport,
}

/// Standardize on the training fold and fit the classifier.
pub fn train(
    x_train: &Array2<f64>,
    y_train: &Array1<usize>,
    params: &TrainParams,
) -> crate::Result<ChurnModel> {
    if x_train.nrows() == 0 {
        return Err(PipelineError::empty("training fold has zero rows"));
    }
    let (scaler, scaled) = StandardScaler::fit_transform(x_train)?;
    let classifier = LogisticRegression::fit(&scaled, y_train, params)?;

    info!(
        rows = x_train.nrows(),
        features = x_train.ncols(),
        iterations = classifier.n_iter,
        converged = classifier.converged,
        class_weight = ?params.class_weight,
        "Trained churn classifier"
    );
    Ok(ChurnModel { scaler, classifier })
}

/// Score the model on the test fold.
///
/// With `reuse_train_scaler` the training fit standardizes the test rows;
/// otherwise a fresh scaler is fitted on the test rows themselves.
pub fn evaluate(
    model: &ChurnModel,
    x_test: &Array2<f64>,
    y_test: &Array1<usize>,
    reuse_train_scaler: bool,
) -> crate::Result<Evaluation> {
    if x_test.nrows() == 0 {
        return Err(PipelineError::empty("test fold has zero rows"));
    }
    let scaled = if reuse_train_scaler {
        model.scaler.transform(x_test)?
    } else {
        StandardScaler::fit_transform(x_test)?.1
    };

    let y_pred = model.classifier.predict(&scaled);
    let accuracy = accuracy(y_test, &y_pred)?;
    let classification_report = classification_report(y_test, &y_pred)?;

    info!(accuracy, rows = x_test.nrows(), reuse_train_scaler, "Evaluated churn classifier");
    Ok(Evaluation {
        accuracy,
        classification_report,
    })
}

//! Principal component projection of the per-purchase feature block

use crate::data::{floats, integers, require_unit_prices, strings, Tables};
use crate::error::PipelineError;
use crate::features::{build_features, features_frame};
use crate::scaling::StandardScaler;
use crate::split::{train_test_split, Split, SplitParams};
use chrono::NaiveDateTime;
use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use tracing::{debug, info};

/// Numeric source block, one row per joined purchase
pub const REDUCTION_FEATURES: [&str; 6] = [
    "Quantity",
    "UnitPrice",
    "TotalAmount",
    "SatisfactionScore",
    "Age",
    "GenderEncoded",
];

pub const DEFAULT_COMPONENTS: usize = 2;

const MAX_SWEEPS: usize = 100;
const OFF_DIAGONAL_TOL: f64 = 1e-20;

/// Fitted principal component projection
#[derive(Debug, Clone)]
pub struct Pca {
    mean: Array1<f64>,
    /// n_features x n_components, one eigenvector per column
    components: Array2<f64>,
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
}

impl Pca {
    /// Fit the top `n_components` directions of maximum variance.
    pub fn fit(x: &Array2<f64>, n_components: usize) -> crate::Result<Self> {
        let (n, d) = x.dim();
        if n_components == 0 || n_components > d {
            return Err(PipelineError::config(format!(
                "n_components must be in [1, {d}], got {n_components}"
            )));
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| PipelineError::empty("cannot fit PCA on zero rows"))?;

        let centered = x - &mean;
        let denom = n.saturating_sub(1).max(1) as f64;
        let covariance = centered.t().dot(&centered) / denom;

        let (eigenvalues, eigenvectors) = symmetric_eigen(&covariance);

        let mut order: Vec<usize> = (0..d).collect();
        order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

        let total: f64 = eigenvalues.iter().map(|v| v.max(0.0)).sum();
        let mut components = Array2::zeros((d, n_components));
        let mut explained_variance = Array1::zeros(n_components);
        for (c, &idx) in order.iter().take(n_components).enumerate() {
            let mut vector = eigenvectors.column(idx).to_owned();
            // Deterministic sign: largest-magnitude loading is positive
            let pivot = vector
                .iter()
                .copied()
                .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            if pivot < 0.0 {
                vector.mapv_inplace(|v| -v);
            }
            components.column_mut(c).assign(&vector);
            explained_variance[c] = eigenvalues[idx].max(0.0);
        }
        let explained_variance_ratio = if total > 0.0 {
            &explained_variance / total
        } else {
            Array1::zeros(n_components)
        };

        Ok(Self {
            mean,
            components,
            explained_variance,
            explained_variance_ratio,
        })
    }

    /// Project rows onto the fitted components.
    ///
    /// # Arguments
    /// * `x` - Rows with the same feature columns the projection was fitted on
    ///
    /// # Returns
    /// An `n_rows x n_components` matrix of scores
    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.mean).dot(&self.components)
    }

    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }

    pub fn explained_variance_ratio(&self) -> &Array1<f64> {
        &self.explained_variance_ratio
    }
}

/// Cyclic Jacobi eigen-decomposition of a symmetric matrix.
///
/// Returns eigenvalues and a matrix whose columns are the matching unit
/// eigenvectors, both in no particular order.
fn symmetric_eigen(matrix: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let d = matrix.nrows();
    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(d);

    for sweep in 0..MAX_SWEEPS {
        let off: f64 = (0..d)
            .flat_map(|p| (0..d).filter(move |&q| q != p).map(move |q| (p, q)))
            .map(|(p, q)| a[[p, q]] * a[[p, q]])
            .sum();
        if off < OFF_DIAGONAL_TOL {
            debug!(sweeps = sweep, "Jacobi converged");
            break;
        }

        for p in 0..d {
            for q in (p + 1)..d {
                let apq = a[[p, q]];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..d {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..d {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..d {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    (a.diag().to_owned(), v)
}

/// Per-purchase principal components joined to each customer's churn label
#[derive(Debug, Clone)]
pub struct ReducedFeatures {
    pub customer_ids: Vec<String>,
    /// n_rows x n_components
    pub components: Array2<f64>,
    pub churn: Array1<usize>,
    pub explained_variance_ratio: Vec<f64>,
}

/// Standardize the purchase-level block, project it to `n_components`
/// components and attach churn labels.
pub fn reduce_features(
    tables: &Tables,
    as_of: NaiveDateTime,
    churn_threshold_days: i64,
    n_components: usize,
) -> crate::Result<ReducedFeatures> {
    let n_features = REDUCTION_FEATURES.len();
    if n_components == 0 || n_components > n_features {
        return Err(PipelineError::config(format!(
            "n_components must be in [1, {n_features}], got {n_components}"
        )));
    }

    let joined = tables.joined()?;
    if joined.height() == 0 {
        return Err(PipelineError::empty(
            "no purchases joined to a known product and customer",
        ));
    }
    require_unit_prices(&joined)?;

    let rfm = build_features(tables, as_of, churn_threshold_days)?;
    let labels = features_frame(&rfm)?
        .lazy()
        .select([col("CustomerID"), col("Churn")]);
    let labelled = joined
        .lazy()
        .inner_join(labels, col("CustomerID"), col("CustomerID"))
        .sort(["Row"], SortMultipleOptions::default())
        .collect()?;

    const TABLE: &str = "joined purchases";
    let mut block = Array2::zeros((labelled.height(), n_features));
    for (j, &name) in REDUCTION_FEATURES.iter().enumerate() {
        let values = floats(&labelled, TABLE, &[name])?;
        block.column_mut(j).assign(&Array1::from(values));
    }

    let (_, standardized) = StandardScaler::fit_transform(&block)?;
    let pca = Pca::fit(&standardized, n_components)?;
    let components = pca.transform(&standardized);

    let customer_ids = strings(&labelled, TABLE, &["CustomerID"])?;
    let churn: Vec<usize> = integers(&labelled, TABLE, &["Churn"])?
        .into_iter()
        .map(|label| label as usize)
        .collect();

    let explained_variance_ratio = pca.explained_variance_ratio().to_vec();
    info!(
        rows = components.nrows(),
        n_components,
        explained = ?explained_variance_ratio,
        "Projected purchase features"
    );

    Ok(ReducedFeatures {
        customer_ids,
        components,
        churn: Array1::from(churn),
        explained_variance_ratio,
    })
}

/// Reduce, then partition into train and test folds.
pub fn reduce(
    tables: &Tables,
    as_of: NaiveDateTime,
    churn_threshold_days: i64,
    n_components: usize,
    params: &SplitParams,
) -> crate::Result<Split> {
    let reduced = reduce_features(tables, as_of, churn_threshold_days, n_components)?;
    train_test_split(&reduced.components, &reduced.churn, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;
    use crate::data::Gender;
    use crate::features::CHURN_THRESHOLD_DAYS;
    use ndarray::array;

    fn wider_tables() -> Tables {
        let mut tables = example_tables();
        tables.customers.push(customer("C3", 55, Gender::Female));
        tables.products.push(product("P2", "Merlot", "Wine", 30.0));
        tables.purchases.extend([
            purchase("T4", "C3", "P2", 3, 90.0, 5, 9),
            purchase("T5", "C2", "P2", 1, 30.0, 120, 2),
            purchase("T6", "C3", "P1", 4, 40.0, 30, 6),
        ]);
        tables
    }

    #[test]
    fn test_pca_recovers_dominant_axis() {
        let x = array![[-2.0, -2.0], [-1.0, -1.0], [1.0, 1.0], [2.0, 2.0]];
        let pca = Pca::fit(&x, 1).unwrap();

        let axis = pca.components().column(0);
        let expected = 1.0 / 2.0_f64.sqrt();
        assert!((axis[0] - expected).abs() < 1e-9);
        assert!((axis[1] - expected).abs() < 1e-9);
        assert!((pca.explained_variance_ratio()[0] - 1.0).abs() < 1e-9);

        let projected = pca.transform(&x);
        assert!((projected[[3, 0]] - 2.0 * 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_pca_components_are_orthonormal() {
        let x = array![
            [1.0, 2.0, 0.5],
            [2.0, 1.0, 1.5],
            [3.0, 4.0, 0.0],
            [4.0, 3.0, 2.5],
            [0.5, 0.0, 1.0],
        ];
        let pca = Pca::fit(&x, 3).unwrap();
        let gram = pca.components().t().dot(pca.components());
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-9);
            }
        }
        let ev = pca.explained_variance();
        assert!(ev[0] >= ev[1] && ev[1] >= ev[2]);
    }

    #[test]
    fn test_output_width_matches_request() {
        for k in 1..=REDUCTION_FEATURES.len() {
            let reduced = reduce_features(&wider_tables(), as_of(), CHURN_THRESHOLD_DAYS, k).unwrap();
            assert_eq!(reduced.components.ncols(), k);
            assert_eq!(reduced.components.nrows(), 6);
            assert_eq!(reduced.customer_ids.len(), 6);
        }
    }

    #[test]
    fn test_rows_carry_customer_churn() {
        let reduced = reduce_features(&wider_tables(), as_of(), CHURN_THRESHOLD_DAYS, 2).unwrap();
        assert_eq!(reduced.customer_ids, vec!["C1", "C1", "C2", "C3", "C2", "C3"]);
        // C2's latest purchase is 120 days old; C1 and C3 are active
        assert_eq!(reduced.churn.to_vec(), vec![0, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_invalid_component_count() {
        for k in [0, REDUCTION_FEATURES.len() + 1] {
            let err = reduce_features(&wider_tables(), as_of(), CHURN_THRESHOLD_DAYS, k).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{err}");
        }
    }

    #[test]
    fn test_unresolvable_price_is_integrity_error() {
        let mut tables = wider_tables();
        tables.purchases[0].unit_price = None;
        tables.products[0].unit_price = None;
        let err = reduce_features(&tables, as_of(), CHURN_THRESHOLD_DAYS, 2).unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity(_)), "{err}");
    }

    #[test]
    fn test_reduce_splits_rows() {
        let split = reduce(
            &wider_tables(),
            as_of(),
            CHURN_THRESHOLD_DAYS,
            3,
            &SplitParams::default(),
        )
        .unwrap();
        assert_eq!(split.x_test.nrows(), 2);
        assert_eq!(split.x_train.nrows(), 4);
        assert_eq!(split.x_train.ncols(), 3);
    }
}

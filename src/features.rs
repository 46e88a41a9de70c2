//! RFM + satisfaction feature computation and churn labelling

use crate::data::{floats, integers, strings, Tables};
use crate::error::PipelineError;
use chrono::NaiveDateTime;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

/// Customers inactive for more than this many days are labelled as churned
pub const CHURN_THRESHOLD_DAYS: i64 = 90;

/// Baseline model inputs, in column order
pub const BASELINE_FEATURES: [&str; 4] = ["Recency", "Frequency", "Monetary", "SatisfactionAvg"];

/// Per-customer behavioral summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomerFeatures {
    #[serde(rename = "CustomerID")]
    pub customer_id: String,
    /// Whole days since the most recent purchase
    pub recency: i64,
    pub frequency: usize,
    pub monetary: f64,
    pub satisfaction_avg: f64,
    pub age: i64,
    pub gender_encoded: u8,
    pub churn: u8,
}

impl CustomerFeatures {
    fn baseline_row(&self) -> [f64; 4] {
        [
            self.recency as f64,
            self.frequency as f64,
            self.monetary,
            self.satisfaction_avg,
        ]
    }
}

const SECONDS_PER_DAY: i64 = 86_400;

/// Build one feature row per customer with at least one joined purchase.
///
/// # Arguments
/// * `tables` - Raw tables; purchases are inner-joined to products and customers
/// * `as_of` - The "now" that recency is measured from
/// * `churn_threshold_days` - Recency above this many days marks a churned customer
///
/// # Returns
/// Feature rows ordered by customer ID
pub fn build_features(
    tables: &Tables,
    as_of: NaiveDateTime,
    churn_threshold_days: i64,
) -> crate::Result<Vec<CustomerFeatures>> {
    let joined = tables.joined()?;
    if joined.height() == 0 {
        return Err(PipelineError::empty(
            "no purchases joined to a known product and customer",
        ));
    }

    let rfm = aggregate_rfm(&joined, as_of.and_utc().timestamp())?;

    const TABLE: &str = "rfm";
    let customer_ids = strings(&rfm, TABLE, &["CustomerID"])?;
    let elapsed = integers(&rfm, TABLE, &["ElapsedSecs"])?;
    let frequency = integers(&rfm, TABLE, &["Frequency"])?;
    let monetary = floats(&rfm, TABLE, &["Monetary"])?;
    let satisfaction = floats(&rfm, TABLE, &["SatisfactionAvg"])?;
    let ages = integers(&rfm, TABLE, &["Age"])?;
    let genders = integers(&rfm, TABLE, &["GenderEncoded"])?;

    let features: Vec<CustomerFeatures> = customer_ids
        .into_iter()
        .enumerate()
        .map(|(row, customer_id)| {
            // Future-dated purchases count as "today"
            let recency = (elapsed[row] / SECONDS_PER_DAY).max(0);
            CustomerFeatures {
                customer_id,
                recency,
                frequency: frequency[row] as usize,
                monetary: monetary[row],
                satisfaction_avg: satisfaction[row],
                age: ages[row],
                gender_encoded: u8::from(genders[row] != 0),
                churn: u8::from(recency > churn_threshold_days),
            }
        })
        .collect();

    let churned = features.iter().filter(|f| f.churn == 1).count();
    info!(
        customers = features.len(),
        churned,
        purchases = joined.height(),
        "Built RFM features"
    );

    Ok(features)
}

/// Group joined purchases per customer, ordered by customer ID
fn aggregate_rfm(joined: &DataFrame, as_of_secs: i64) -> PolarsResult<DataFrame> {
    joined
        .clone()
        .lazy()
        .group_by([col("CustomerID")])
        .agg([
            col("PurchasedAt").max().alias("LastPurchasedAt"),
            col("PurchaseID").count().cast(DataType::Int64).alias("Frequency"),
            col("TotalAmount").sum().alias("Monetary"),
            col("SatisfactionScore")
                .cast(DataType::Float64)
                .mean()
                .alias("SatisfactionAvg"),
            col("Age").first(),
            col("GenderEncoded").first(),
        ])
        .with_columns([(lit(as_of_secs) - col("LastPurchasedAt")).alias("ElapsedSecs")])
        .sort(["CustomerID"], SortMultipleOptions::default())
        .collect()
}

/// Baseline feature matrix and churn labels, label column excluded from X
pub fn baseline_matrix(features: &[CustomerFeatures]) -> (Array2<f64>, Array1<usize>) {
    let mut x = Array2::zeros((features.len(), BASELINE_FEATURES.len()));
    for (i, row) in features.iter().enumerate() {
        for (j, value) in row.baseline_row().into_iter().enumerate() {
            x[[i, j]] = value;
        }
    }
    let y = features.iter().map(|f| f.churn as usize).collect();
    (x, y)
}

/// The RFM table as a frame, in snapshot column order
pub fn features_frame(features: &[CustomerFeatures]) -> PolarsResult<DataFrame> {
    df!(
        "CustomerID" => features.iter().map(|f| f.customer_id.clone()).collect::<Vec<_>>(),
        "Recency" => features.iter().map(|f| f.recency).collect::<Vec<_>>(),
        "Frequency" => features.iter().map(|f| f.frequency as i64).collect::<Vec<_>>(),
        "Monetary" => features.iter().map(|f| f.monetary).collect::<Vec<_>>(),
        "SatisfactionAvg" => features.iter().map(|f| f.satisfaction_avg).collect::<Vec<_>>(),
        "Age" => features.iter().map(|f| f.age).collect::<Vec<_>>(),
        "GenderEncoded" => features.iter().map(|f| f.gender_encoded as i64).collect::<Vec<_>>(),
        "Churn" => features.iter().map(|f| f.churn as i64).collect::<Vec<_>>()
    )
}

/// Write the RFM table to CSV for inspection.
pub fn write_rfm_snapshot(features: &[CustomerFeatures], path: &Path) -> crate::Result<()> {
    let mut df = features_frame(features)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)?;

    debug!(path = %path.display(), rows = features.len(), "Wrote RFM snapshot");
    Ok(())
}

/// Snapshot write that never fails the caller
pub fn try_write_rfm_snapshot(features: &[CustomerFeatures], path: &Path) {
    if let Err(e) = write_rfm_snapshot(features, path) {
        warn!(path = %path.display(), error = %e, "Skipping RFM snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;
    use crate::data::Gender;
    use tempfile::TempDir;

    fn example() -> Vec<CustomerFeatures> {
        build_features(&example_tables(), as_of(), CHURN_THRESHOLD_DAYS).unwrap()
    }

    #[test]
    fn test_example_scenario() {
        let features = example();
        assert_eq!(features.len(), 2);

        let c1 = &features[0];
        assert_eq!(c1.customer_id, "C1");
        assert_eq!(c1.recency, 10);
        assert_eq!(c1.frequency, 2);
        assert_eq!(c1.monetary, 30.0);
        assert_eq!(c1.satisfaction_avg, 6.0);
        assert_eq!(c1.age, 30);
        assert_eq!(c1.gender_encoded, 0);
        assert_eq!(c1.churn, 0);

        let c2 = &features[1];
        assert_eq!(c2.customer_id, "C2");
        assert_eq!(c2.recency, 200);
        assert_eq!(c2.frequency, 1);
        assert_eq!(c2.monetary, 15.0);
        assert_eq!(c2.satisfaction_avg, 3.0);
        assert_eq!(c2.gender_encoded, 1);
        assert_eq!(c2.churn, 1);
    }

    #[test]
    fn test_churn_threshold_is_strict() {
        let tables = Tables::new(
            vec![customer("A", 20, Gender::Male), customer("B", 21, Gender::Male)],
            vec![product("P1", "Cass", "Beer", 5.0)],
            vec![
                purchase("T1", "A", "P1", 1, 5.0, 90, 5),
                purchase("T2", "B", "P1", 1, 5.0, 91, 5),
            ],
        )
        .unwrap();

        let features = build_features(&tables, as_of(), CHURN_THRESHOLD_DAYS).unwrap();
        assert_eq!((features[0].recency, features[0].churn), (90, 0));
        assert_eq!((features[1].recency, features[1].churn), (91, 1));
    }

    #[test]
    fn test_interleaved_purchases_group_per_customer() {
        let tables = Tables::new(
            vec![customer("B", 41, Gender::Female), customer("A", 20, Gender::Male)],
            vec![
                product("P1", "Cass", "Beer", 5.0),
                product("P2", "Merlot", "Wine", 20.0),
            ],
            vec![
                purchase("T1", "B", "P2", 1, 20.0, 40, 2),
                purchase("T2", "A", "P1", 2, 10.0, 12, 9),
                purchase("T3", "B", "P1", 1, 5.0, 7, 4),
                purchase("T4", "A", "P2", 1, 20.0, 30, 6),
                purchase("T5", "B", "P1", 3, 15.0, 95, 3),
            ],
        )
        .unwrap();

        let features = build_features(&tables, as_of(), CHURN_THRESHOLD_DAYS).unwrap();
        let ids: Vec<&str> = features.iter().map(|f| f.customer_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        let a = &features[0];
        assert_eq!((a.recency, a.frequency, a.monetary), (12, 2, 30.0));
        assert_eq!(a.satisfaction_avg, 7.5);
        assert_eq!((a.age, a.gender_encoded), (20, 0));

        let b = &features[1];
        assert_eq!((b.recency, b.frequency, b.monetary), (7, 3, 40.0));
        assert_eq!(b.satisfaction_avg, 3.0);
        assert_eq!((b.age, b.gender_encoded, b.churn), (41, 1, 0));
    }

    #[test]
    fn test_customers_without_purchases_are_excluded() {
        let mut tables = example_tables();
        tables.customers.push(customer("C3", 50, Gender::Female));

        let features = build_features(&tables, as_of(), CHURN_THRESHOLD_DAYS).unwrap();
        assert!(features.iter().all(|f| f.customer_id != "C3"));
    }

    #[test]
    fn test_future_purchase_clamps_recency() {
        let mut tables = example_tables();
        tables.purchases.push(purchase("T9", "C1", "P1", 1, 10.0, -3, 5));

        let features = build_features(&tables, as_of(), CHURN_THRESHOLD_DAYS).unwrap();
        assert_eq!(features[0].recency, 0);
    }

    #[test]
    fn test_no_purchases_is_empty_dataset() {
        let mut tables = example_tables();
        tables.purchases.clear();
        assert!(matches!(
            build_features(&tables, as_of(), CHURN_THRESHOLD_DAYS),
            Err(PipelineError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_baseline_matrix_excludes_label() {
        let (x, y) = baseline_matrix(&example());
        assert_eq!(x.shape(), &[2, 4]);
        assert_eq!(x.row(0).to_vec(), vec![10.0, 2.0, 30.0, 6.0]);
        assert_eq!(y.to_vec(), vec![0, 1]);
    }

    #[test]
    fn test_snapshot_written_and_failure_swallowed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rfm").join("rfm_snapshot.csv");
        write_rfm_snapshot(&example(), &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next(),
            Some("CustomerID,Recency,Frequency,Monetary,SatisfactionAvg,Age,GenderEncoded,Churn")
        );
        assert_eq!(lines.count(), 2);

        // A directory cannot be opened as a file; this must only log
        try_write_rfm_snapshot(&example(), dir.path());
    }
}

//! Descriptive purchase-trend aggregation

use crate::data::{floats, integers, strings, Tables};
use crate::error::PipelineError;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Length of each product ranking
pub const TOP_N: usize = 10;

const TABLE: &str = "purchase trends";

/// Which customer wins when several share the highest purchased quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// The tied customer whose first purchase appears earliest
    #[default]
    FirstOccurrence,
    /// The lexicographically smallest customer ID
    CustomerId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductTrend {
    #[serde(rename = "ProductName")]
    pub product_name: String,
    #[serde(rename = "Quantity")]
    pub total_quantity: i64,
    #[serde(rename = "Satisfaction")]
    pub avg_satisfaction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopCustomer {
    #[serde(rename = "CustomerID")]
    pub customer_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Total Purchases")]
    pub total_quantity: i64,
    #[serde(rename = "Total Spent")]
    pub total_spent: f64,
    #[serde(rename = "SignupDate")]
    pub signup_date: NaiveDate,
    #[serde(rename = "Location")]
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendReport {
    pub category_sales: BTreeMap<String, i64>,
    pub top_products_by_satisfaction: Vec<ProductTrend>,
    pub top_products_by_quantity: Vec<ProductTrend>,
    pub most_frequent_customer: TopCustomer,
}

/// Summarize category sales, product rankings and the top customer.
///
/// # Arguments
/// * `tables` - Raw tables; product statistics use purchases joined to products
/// * `tie_break` - Rule for choosing among customers tied on total quantity
///
/// # Returns
/// The trend report, or `EmptyDataset` when there are no purchases
pub fn analyze_trends(tables: &Tables, tie_break: TieBreak) -> crate::Result<TrendReport> {
    if tables.purchases.is_empty() {
        return Err(PipelineError::empty("no purchases to analyze"));
    }

    let joined = tables.joined_products()?.lazy();

    let categories = joined
        .clone()
        .group_by([col("Category")])
        .agg([col("Quantity").sum()])
        .sort(["Category"], SortMultipleOptions::default())
        .collect()?;
    let category_sales: BTreeMap<String, i64> = strings(&categories, TABLE, &["Category"])?
        .into_iter()
        .zip(integers(&categories, TABLE, &["Quantity"])?)
        .collect();

    // Groups come out in name order; the rankings sort with maintain_order
    // so ties keep it
    let products = joined
        .group_by([col("ProductName")])
        .agg([
            col("Quantity").sum(),
            col("SatisfactionScore").cast(DataType::Float64).mean(),
        ])
        .sort(["ProductName"], SortMultipleOptions::default());

    let top_products_by_satisfaction = top_products(products.clone(), "SatisfactionScore")?;
    let top_products_by_quantity = top_products(products, "Quantity")?;

    let most_frequent_customer = most_frequent_customer(tables, tie_break)?;

    info!(
        categories = category_sales.len(),
        top_customer = %most_frequent_customer.customer_id,
        "Analyzed purchase trends"
    );

    Ok(TrendReport {
        category_sales,
        top_products_by_satisfaction,
        top_products_by_quantity,
        most_frequent_customer,
    })
}

fn top_products(products: LazyFrame, by: &str) -> crate::Result<Vec<ProductTrend>> {
    let ranked = products
        .sort(
            [by],
            SortMultipleOptions::default()
                .with_order_descending(true)
                .with_maintain_order(true),
        )
        .limit(TOP_N as IdxSize)
        .collect()?;

    let names = strings(&ranked, TABLE, &["ProductName"])?;
    let quantities = integers(&ranked, TABLE, &["Quantity"])?;
    let satisfaction = floats(&ranked, TABLE, &["SatisfactionScore"])?;
    Ok(names
        .into_iter()
        .zip(quantities)
        .zip(satisfaction)
        .map(|((product_name, total_quantity), avg_satisfaction)| ProductTrend {
            product_name,
            total_quantity,
            avg_satisfaction,
        })
        .collect())
}

/// Customer with the highest total purchased quantity over all purchase rows
fn most_frequent_customer(tables: &Tables, tie_break: TieBreak) -> crate::Result<TopCustomer> {
    // Ascending on the tie column puts the earlier or smaller key first
    let tie_column = match tie_break {
        TieBreak::FirstOccurrence => "FirstRow",
        TieBreak::CustomerId => "CustomerID",
    };
    let top = tables
        .purchases_frame()?
        .lazy()
        .group_by([col("CustomerID")])
        .agg([
            col("Row").min().alias("FirstRow"),
            col("Quantity").sum(),
            col("TotalAmount").sum(),
        ])
        .sort(
            ["Quantity", tie_column],
            SortMultipleOptions::default().with_order_descending_multi([true, false]),
        )
        .limit(1)
        .collect()?;

    let ids = strings(&top, TABLE, &["CustomerID"])?;
    let quantities = integers(&top, TABLE, &["Quantity"])?;
    let totals = floats(&top, TABLE, &["TotalAmount"])?;
    let (Some(customer_id), Some(&quantity), Some(&spent)) =
        (ids.first(), quantities.first(), totals.first())
    else {
        return Err(PipelineError::empty("no purchases to analyze"));
    };

    let customer = tables.customer(customer_id).ok_or_else(|| {
        PipelineError::integrity(format!(
            "top customer {customer_id} is missing from the customers table"
        ))
    })?;

    Ok(TopCustomer {
        customer_id: customer.id.clone(),
        name: customer.name.clone(),
        total_quantity: quantity,
        total_spent: spent,
        signup_date: customer.signup_date,
        location: customer.location.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::*;
    use crate::data::Gender;
    use std::collections::HashMap;

    fn catalog_tables() -> Tables {
        let customers = vec![
            customer("C1", 30, Gender::Male),
            customer("C2", 40, Gender::Female),
            customer("C3", 22, Gender::Female),
        ];
        let mut products = Vec::new();
        for i in 0..12 {
            let category = if i % 2 == 0 { "Beer" } else { "Wine" };
            products.push(product(&format!("P{i:02}"), &format!("Item {i:02}"), category, 5.0));
        }
        let mut purchases = Vec::new();
        for i in 0..12_i64 {
            let buyer = ["C1", "C2", "C3"][i as usize % 3];
            purchases.push(purchase(
                &format!("T{i:02}"),
                buyer,
                &format!("P{i:02}"),
                i + 1,
                5.0 * (i + 1) as f64,
                i,
                (i % 10) + 1,
            ));
        }
        Tables::new(customers, products, purchases).unwrap()
    }

    #[test]
    fn test_category_sales_sum_to_total_quantity() {
        let tables = catalog_tables();
        let report = analyze_trends(&tables, TieBreak::default()).unwrap();

        let total: i64 = tables.purchases.iter().map(|p| p.quantity).sum();
        assert_eq!(report.category_sales.values().sum::<i64>(), total);
        // Beer gets quantities 1,3,5,...,11; Wine 2,4,...,12
        assert_eq!(report.category_sales["Beer"], 36);
        assert_eq!(report.category_sales["Wine"], 42);
    }

    #[test]
    fn test_rankings_are_capped_and_descending() {
        let report = analyze_trends(&catalog_tables(), TieBreak::default()).unwrap();

        let by_qty = &report.top_products_by_quantity;
        assert_eq!(by_qty.len(), TOP_N);
        assert_eq!(by_qty[0].product_name, "Item 11");
        assert!(by_qty.windows(2).all(|w| w[0].total_quantity > w[1].total_quantity));

        let by_sat = &report.top_products_by_satisfaction;
        assert_eq!(by_sat.len(), TOP_N);
        assert!(by_sat
            .windows(2)
            .all(|w| w[0].avg_satisfaction >= w[1].avg_satisfaction));
        // Satisfaction 10 belongs to Item 09 only; 1 and 2 repeat at 10 and 11
        assert_eq!(by_sat[0].product_name, "Item 09");
        assert_eq!(by_sat[0].avg_satisfaction, 10.0);
        assert_eq!(by_sat[0].total_quantity, 10);
    }

    #[test]
    fn test_satisfaction_ties_keep_name_order() {
        let tables = Tables::new(
            vec![customer("C1", 30, Gender::Male)],
            vec![
                product("P1", "Terra", "Beer", 4.0),
                product("P2", "Asahi", "Beer", 4.0),
            ],
            vec![
                purchase("T1", "C1", "P1", 1, 4.0, 1, 8),
                purchase("T2", "C1", "P2", 3, 12.0, 1, 8),
            ],
        )
        .unwrap();

        let report = analyze_trends(&tables, TieBreak::default()).unwrap();
        let names: Vec<&str> = report
            .top_products_by_satisfaction
            .iter()
            .map(|p| p.product_name.as_str())
            .collect();
        assert_eq!(names, vec!["Asahi", "Terra"]);
    }

    #[test]
    fn test_most_frequent_customer() {
        let tables = catalog_tables();
        let report = analyze_trends(&tables, TieBreak::default()).unwrap();

        let mut per_customer: HashMap<&str, i64> = HashMap::new();
        for p in &tables.purchases {
            *per_customer.entry(p.customer_id.as_str()).or_default() += p.quantity;
        }
        let max = per_customer.values().copied().max().unwrap();

        let top = &report.most_frequent_customer;
        assert_eq!(top.total_quantity, max);
        // C3 bought items 3,6,9,12
        assert_eq!(top.customer_id, "C3");
        assert_eq!(top.name, "Name C3");
        assert_eq!(top.total_spent, 5.0 * 30.0);
        assert_eq!(top.location, "Seoul");
    }

    #[test]
    fn test_tie_break_modes() {
        let tables = Tables::new(
            vec![customer("B", 30, Gender::Male), customer("A", 31, Gender::Female)],
            vec![product("P1", "Cass", "Beer", 2.0)],
            vec![
                purchase("T1", "B", "P1", 2, 4.0, 3, 5),
                purchase("T2", "A", "P1", 2, 4.0, 2, 5),
            ],
        )
        .unwrap();

        let first = analyze_trends(&tables, TieBreak::FirstOccurrence).unwrap();
        assert_eq!(first.most_frequent_customer.customer_id, "B");

        let by_id = analyze_trends(&tables, TieBreak::CustomerId).unwrap();
        assert_eq!(by_id.most_frequent_customer.customer_id, "A");
    }

    #[test]
    fn test_unknown_product_counts_only_for_customers() {
        let mut tables = example_tables();
        // C2 overtakes C1 only through a product missing from the catalog
        tables.purchases.push(purchase("T4", "C2", "P9", 5, 50.0, 1, 9));

        let report = analyze_trends(&tables, TieBreak::default()).unwrap();
        assert_eq!(report.category_sales.len(), 1);
        assert_eq!(report.category_sales["Beer"], 4);
        assert_eq!(report.top_products_by_quantity.len(), 1);
        assert_eq!(report.top_products_by_quantity[0].total_quantity, 4);

        let top = &report.most_frequent_customer;
        assert_eq!(top.customer_id, "C2");
        assert_eq!(top.total_quantity, 6);
        assert_eq!(top.total_spent, 65.0);
    }

    #[test]
    fn test_json_keys() {
        let report = analyze_trends(&example_tables(), TieBreak::default()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["category_sales"]["Beer"], 4);
        assert_eq!(json["most_frequent_customer"]["Total Purchases"], 3);
        assert_eq!(json["most_frequent_customer"]["SignupDate"], "2023-01-15");
        assert_eq!(json["top_products_by_quantity"][0]["ProductName"], "Cass");
    }

    #[test]
    fn test_errors() {
        let mut tables = example_tables();
        tables.customers.retain(|c| c.id != "C1");
        assert!(matches!(
            analyze_trends(&tables, TieBreak::default()),
            Err(PipelineError::DataIntegrity(_))
        ));

        tables.purchases.clear();
        assert!(matches!(
            analyze_trends(&tables, TieBreak::default()),
            Err(PipelineError::EmptyDataset(_))
        ));
    }
}

//! Raw table loading and schema normalization using Polars
//!
//! The three source tables are read into typed rows once per pipeline call.
//! Column headers are resolved against a declared alias list so that the rest
//! of the crate never inspects column names.

use crate::error::PipelineError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CUSTOMERS_FILE: &str = "customers.csv";
pub const PRODUCTS_FILE: &str = "products.csv";
pub const PURCHASES_FILE: &str = "purchases.csv";

/// Customer gender as recorded in the customers table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Gender {
    /// Parse the customers-table gender code.
    ///
    /// # Arguments
    /// * `raw` - Cell text; surrounding whitespace is ignored
    ///
    /// # Returns
    /// `Some` for "M" or "F", `None` for anything else
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "M" => Some(Self::Male),
            "F" => Some(Self::Female),
            _ => None,
        }
    }

    /// M -> 0, F -> 1
    pub fn encoded(self) -> u8 {
        match self {
            Self::Male => 0,
            Self::Female => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub age: i64,
    pub gender: Gender,
    pub location: String,
    pub signup_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub category: String,
    /// List price, when the products table carries one
    pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub id: String,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: i64,
    /// Price charged on this purchase, when the purchases table carries one
    pub unit_price: Option<f64>,
    pub total_amount: f64,
    pub purchase_date: NaiveDateTime,
    pub satisfaction: i64,
}

/// The three raw tables, immutable for the lifetime of one pipeline call
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub customers: Vec<Customer>,
    pub products: Vec<Product>,
    pub purchases: Vec<Purchase>,
}

impl Tables {
    /// Build a table set, rejecting duplicate customer or product keys.
    pub fn new(
        customers: Vec<Customer>,
        products: Vec<Product>,
        purchases: Vec<Purchase>,
    ) -> crate::Result<Self> {
        ensure_unique("customers", "CustomerID", customers.iter().map(|c| c.id.as_str()))?;
        ensure_unique("products", "ProductID", products.iter().map(|p| p.id.as_str()))?;

        Ok(Self {
            customers,
            products,
            purchases,
        })
    }

    /// Purchases as a frame, in table order.
    ///
    /// `Row` is the position in the purchases table and `PurchasedAt` is
    /// seconds since the Unix epoch.
    pub fn purchases_frame(&self) -> PolarsResult<DataFrame> {
        let purchases = &self.purchases;
        df!(
            "Row" => (0..purchases.len() as i64).collect::<Vec<_>>(),
            "PurchaseID" => purchases.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
            "CustomerID" => purchases.iter().map(|p| p.customer_id.clone()).collect::<Vec<_>>(),
            "ProductID" => purchases.iter().map(|p| p.product_id.clone()).collect::<Vec<_>>(),
            "Quantity" => purchases.iter().map(|p| p.quantity).collect::<Vec<_>>(),
            "UnitPrice" => purchases.iter().map(|p| p.unit_price).collect::<Vec<_>>(),
            "TotalAmount" => purchases.iter().map(|p| p.total_amount).collect::<Vec<_>>(),
            "PurchasedAt" => purchases
                .iter()
                .map(|p| p.purchase_date.and_utc().timestamp())
                .collect::<Vec<_>>(),
            "SatisfactionScore" => purchases.iter().map(|p| p.satisfaction).collect::<Vec<_>>()
        )
    }

    pub fn products_frame(&self) -> PolarsResult<DataFrame> {
        let products = &self.products;
        df!(
            "ProductID" => products.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
            "ProductName" => products.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
            "Category" => products.iter().map(|p| p.category.clone()).collect::<Vec<_>>(),
            "ListPrice" => products.iter().map(|p| p.unit_price).collect::<Vec<_>>()
        )
    }

    /// Customer attributes the models consume, gender already encoded
    pub fn customers_frame(&self) -> PolarsResult<DataFrame> {
        let customers = &self.customers;
        df!(
            "CustomerID" => customers.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            "Age" => customers.iter().map(|c| c.age).collect::<Vec<_>>(),
            "GenderEncoded" => customers
                .iter()
                .map(|c| i64::from(c.gender.encoded()))
                .collect::<Vec<_>>()
        )
    }

    /// Inner join Purchase -> Product -> Customer, preserving purchase order.
    ///
    /// Purchases referencing an unknown product or customer are dropped.
    /// `UnitPrice` holds the canonical price: the purchase's own price wins
    /// over the product list price, and stays null when neither exists (see
    /// [`require_unit_prices`]).
    ///
    /// # Returns
    /// One row per surviving purchase with the purchase, product and
    /// customer columns side by side.
    pub fn joined(&self) -> crate::Result<DataFrame> {
        let customers = self.customers_frame()?.lazy();
        let df = self
            .purchases_with_products()?
            .inner_join(customers, col("CustomerID"), col("CustomerID"))
            .with_columns([col("UnitPrice").fill_null(col("ListPrice")).alias("UnitPrice")])
            .sort(["Row"], SortMultipleOptions::default())
            .collect()?;
        Ok(df)
    }

    /// Inner join Purchase -> Product only, preserving purchase order.
    pub fn joined_products(&self) -> crate::Result<DataFrame> {
        let df = self
            .purchases_with_products()?
            .sort(["Row"], SortMultipleOptions::default())
            .collect()?;
        Ok(df)
    }

    /// Look up a customer by ID.
    ///
    /// # Arguments
    /// * `id` - Customer key as it appears in the customers table
    ///
    /// # Returns
    /// The matching customer, or `None` when the key is unknown
    pub fn customer(&self, id: &str) -> Option<&Customer> {
        self.customers.iter().find(|c| c.id == id)
    }

    fn purchases_with_products(&self) -> PolarsResult<LazyFrame> {
        let products = self.products_frame()?.lazy();
        Ok(self
            .purchases_frame()?
            .lazy()
            .inner_join(products, col("ProductID"), col("ProductID")))
    }
}

/// Fail on the first joined row whose unit price could not be resolved.
pub fn require_unit_prices(joined: &DataFrame) -> crate::Result<()> {
    let prices = joined.column("UnitPrice")?.f64()?;
    if prices.null_count() == 0 {
        return Ok(());
    }

    let row = prices.into_iter().position(|p| p.is_none()).unwrap_or(0);
    let purchase_ids = joined.column("PurchaseID")?.str()?;
    let product_ids = joined.column("ProductID")?.str()?;
    Err(PipelineError::integrity(format!(
        "unit price unresolved for purchase {}: neither the purchase nor product {} carries one",
        purchase_ids.get(row).unwrap_or_default(),
        product_ids.get(row).unwrap_or_default()
    )))
}

fn ensure_unique<'a>(
    table: &str,
    key: &str,
    ids: impl Iterator<Item = &'a str>,
) -> crate::Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(PipelineError::integrity(format!(
                "{table}: duplicate {key} '{id}'"
            )));
        }
    }
    Ok(())
}

/// A capability that yields fresh raw tables on every call
pub trait DataSource: Send + Sync {
    fn load(&self) -> crate::Result<Tables>;
}

/// In-memory tables act as their own source.
impl DataSource for Tables {
    fn load(&self) -> crate::Result<Tables> {
        Ok(self.clone())
    }
}

/// Reads the three tables from CSV files
#[derive(Debug, Clone)]
pub struct CsvDataSource {
    customers: PathBuf,
    products: PathBuf,
    purchases: PathBuf,
}

impl CsvDataSource {
    /// Use the default file names inside `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::with_files(
            dir.join(CUSTOMERS_FILE),
            dir.join(PRODUCTS_FILE),
            dir.join(PURCHASES_FILE),
        )
    }

    /// Use explicit paths for each table
    ///
    /// # Arguments
    /// * `customers` - Customers CSV
    /// * `products` - Products CSV
    /// * `purchases` - Purchases CSV
    pub fn with_files(
        customers: impl Into<PathBuf>,
        products: impl Into<PathBuf>,
        purchases: impl Into<PathBuf>,
    ) -> Self {
        Self {
            customers: customers.into(),
            products: products.into(),
            purchases: purchases.into(),
        }
    }
}

impl DataSource for CsvDataSource {
    fn load(&self) -> crate::Result<Tables> {
        let customers = parse_customers(&read_csv(&self.customers)?)?;
        let products = parse_products(&read_csv(&self.products)?)?;
        let purchases = parse_purchases(&read_csv(&self.purchases)?)?;

        info!(
            customers = customers.len(),
            products = products.len(),
            purchases = purchases.len(),
            "Loaded raw tables"
        );

        Tables::new(customers, products, purchases)
    }
}

/// Declared header aliases, first match wins.
mod schema {
    pub const CUSTOMER_ID: &[&str] = &["CustomerID"];
    pub const CUSTOMER_NAME: &[&str] = &["Name", "CustomerName"];
    pub const AGE: &[&str] = &["Age"];
    pub const GENDER: &[&str] = &["Gender"];
    pub const LOCATION: &[&str] = &["Location"];
    pub const SIGNUP_DATE: &[&str] = &["SignupDate"];

    pub const PRODUCT_ID: &[&str] = &["ProductID"];
    pub const PRODUCT_NAME: &[&str] = &["ProductName", "Name"];
    pub const CATEGORY: &[&str] = &["Category"];
    pub const PRODUCT_PRICE: &[&str] = &["UnitPrice", "Price", "UnitPrice_y", "Price_y"];

    pub const PURCHASE_ID: &[&str] = &["PurchaseID", "purchaseID"];
    pub const QUANTITY: &[&str] = &["Quantity"];
    pub const PURCHASE_PRICE: &[&str] = &["UnitPrice", "Price", "UnitPrice_x", "Price_x"];
    pub const TOTAL_AMOUNT: &[&str] = &["TotalAmount"];
    pub const PURCHASE_DATE: &[&str] = &["PurchaseDate", "purchaseDate"];
    pub const SATISFACTION: &[&str] = &["SatisfactionScore", "Satisfaction"];
}

fn read_csv(path: &Path) -> crate::Result<DataFrame> {
    debug!(path = %path.display(), "Reading CSV");
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(df)
}

fn parse_customers(df: &DataFrame) -> crate::Result<Vec<Customer>> {
    const TABLE: &str = "customers";
    let ids = strings(df, TABLE, schema::CUSTOMER_ID)?;
    let names = strings(df, TABLE, schema::CUSTOMER_NAME)?;
    let ages = integers(df, TABLE, schema::AGE)?;
    let genders = strings(df, TABLE, schema::GENDER)?;
    let locations = strings(df, TABLE, schema::LOCATION)?;
    let signups = strings(df, TABLE, schema::SIGNUP_DATE)?;

    let mut customers = Vec::with_capacity(ids.len());
    for (row, id) in ids.into_iter().enumerate() {
        let gender = Gender::parse(&genders[row]).ok_or_else(|| {
            PipelineError::integrity(format!(
                "{TABLE}: row {row}: gender must be M or F, got '{}'",
                genders[row]
            ))
        })?;
        let signup_date = parse_timestamp(&signups[row])
            .ok_or_else(|| bad_date(TABLE, "SignupDate", row, &signups[row]))?
            .date();

        customers.push(Customer {
            id,
            name: names[row].clone(),
            age: ages[row],
            gender,
            location: locations[row].clone(),
            signup_date,
        });
    }
    Ok(customers)
}

fn parse_products(df: &DataFrame) -> crate::Result<Vec<Product>> {
    const TABLE: &str = "products";
    let ids = strings(df, TABLE, schema::PRODUCT_ID)?;
    let names = strings(df, TABLE, schema::PRODUCT_NAME)?;
    let categories = strings(df, TABLE, schema::CATEGORY)?;
    let prices = optional_floats(df, schema::PRODUCT_PRICE)?;

    Ok(ids
        .into_iter()
        .enumerate()
        .map(|(row, id)| Product {
            id,
            name: names[row].clone(),
            category: categories[row].clone(),
            unit_price: prices.as_ref().and_then(|p| p[row]),
        })
        .collect())
}

fn parse_purchases(df: &DataFrame) -> crate::Result<Vec<Purchase>> {
    const TABLE: &str = "purchases";
    let ids = strings(df, TABLE, schema::PURCHASE_ID)?;
    let customer_ids = strings(df, TABLE, schema::CUSTOMER_ID)?;
    let product_ids = strings(df, TABLE, schema::PRODUCT_ID)?;
    let quantities = integers(df, TABLE, schema::QUANTITY)?;
    let prices = optional_floats(df, schema::PURCHASE_PRICE)?;
    let totals = floats(df, TABLE, schema::TOTAL_AMOUNT)?;
    let dates = strings(df, TABLE, schema::PURCHASE_DATE)?;
    let satisfaction = integers(df, TABLE, schema::SATISFACTION)?;

    let mut purchases = Vec::with_capacity(ids.len());
    for (row, id) in ids.into_iter().enumerate() {
        let purchase_date = parse_timestamp(&dates[row])
            .ok_or_else(|| bad_date(TABLE, "PurchaseDate", row, &dates[row]))?;

        purchases.push(Purchase {
            id,
            customer_id: customer_ids[row].clone(),
            product_id: product_ids[row].clone(),
            quantity: quantities[row],
            unit_price: prices.as_ref().and_then(|p| p[row]),
            total_amount: totals[row],
            purchase_date,
            satisfaction: satisfaction[row],
        });
    }
    Ok(purchases)
}

/// Parse a date or timestamp in any of the accepted layouts.
///
/// Bare dates are taken at midnight.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn resolve<'a>(df: &DataFrame, aliases: &[&'a str]) -> Option<&'a str> {
    aliases.iter().copied().find(|name| df.column(name).is_ok())
}

fn require<'a>(df: &DataFrame, table: &str, aliases: &[&'a str]) -> crate::Result<&'a str> {
    resolve(df, aliases).ok_or_else(|| {
        PipelineError::integrity(format!(
            "{table}: missing required column (accepted: {})",
            aliases.join(", ")
        ))
    })
}

fn null_cell(table: &str, column: &str, row: usize) -> PipelineError {
    PipelineError::integrity(format!("{table}: null or non-numeric {column} at row {row}"))
}

fn bad_date(table: &str, column: &str, row: usize, raw: &str) -> PipelineError {
    PipelineError::integrity(format!("{table}: unparseable {column} '{raw}' at row {row}"))
}

pub(crate) fn strings(df: &DataFrame, table: &str, aliases: &[&str]) -> crate::Result<Vec<String>> {
    let name = require(df, table, aliases)?;
    let series = df.column(name)?.cast(&DataType::String)?;
    series
        .str()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.map(str::to_owned).ok_or_else(|| null_cell(table, name, row)))
        .collect()
}

pub(crate) fn integers(df: &DataFrame, table: &str, aliases: &[&str]) -> crate::Result<Vec<i64>> {
    let name = require(df, table, aliases)?;
    let series = df.column(name)?.cast(&DataType::Int64)?;
    series
        .i64()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.ok_or_else(|| null_cell(table, name, row)))
        .collect()
}

pub(crate) fn floats(df: &DataFrame, table: &str, aliases: &[&str]) -> crate::Result<Vec<f64>> {
    let name = require(df, table, aliases)?;
    let series = df.column(name)?.cast(&DataType::Float64)?;
    series
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.ok_or_else(|| null_cell(table, name, row)))
        .collect()
}

/// Nullable numeric column that may be absent altogether
fn optional_floats(df: &DataFrame, aliases: &[&str]) -> crate::Result<Option<Vec<Option<f64>>>> {
    let Some(name) = resolve(df, aliases) else {
        return Ok(None);
    };
    let series = df.column(name)?.cast(&DataType::Float64)?;
    Ok(Some(series.f64()?.into_iter().collect()))
}

//! Command-line interface definitions and argument parsing

use crate::config::AppConfig;
use crate::trends::TieBreak;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Customer churn prediction and purchase-trend analysis over RFM features
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file (defaults to ./churnforge.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory containing customers.csv, products.csv and purchases.csv
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory for metric snapshots and charts
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Reference "now" for recency, e.g. 2024-06-30 or 2024-06-30T12:00:00
    #[arg(long, global = true)]
    pub as_of: Option<String>,

    /// Seed for the train/test split
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Skip metric snapshots and charts
    #[arg(long, global = true)]
    pub no_snapshots: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Train and evaluate the baseline churn model on RFM features
    Churn,

    /// Train and evaluate the churn model on principal components
    ChurnReduced {
        /// Number of principal components to keep (defaults to model.components)
        #[arg(short = 'k', long)]
        components: Option<usize>,
    },

    /// Summarize category sales, product rankings and the top customer
    Trends {
        /// How to pick the top customer among equal quantities
        #[arg(long, value_enum)]
        tie_break: Option<TieBreakArg>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreakArg {
    FirstOccurrence,
    CustomerId,
}

impl From<TieBreakArg> for TieBreak {
    fn from(arg: TieBreakArg) -> Self {
        match arg {
            TieBreakArg::FirstOccurrence => TieBreak::FirstOccurrence,
            TieBreakArg::CustomerId => TieBreak::CustomerId,
        }
    }
}

impl Args {
    /// Layer command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.data_dir {
            config.data.dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output.dir = dir.clone();
        }
        if let Some(as_of) = &self.as_of {
            config.model.reference_date = Some(as_of.clone());
        }
        if let Some(seed) = self.seed {
            config.model.seed = seed;
        }
        if self.no_snapshots {
            config.output.snapshots = false;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        match self.command {
            Command::ChurnReduced {
                components: Some(components),
            } => config.model.components = components,
            Command::Trends {
                tie_break: Some(tie_break),
            } => config.trends.tie_break = tie_break.into(),
            _ => {}
        }
    }
}

pub mod commands;
pub mod config;
pub mod index;
pub mod logcat;
pub mod query;
pub mod report;

pub use commands::{BugreportService, CommandError, ParseHandle, ParseSummary};
pub use config::MilkteaConfig;
pub use query::executor::{LogcatStats, QueryResponse};
pub use query::filters::LogFilters;

pub mod builder;
pub mod cache;
pub mod postings;
pub mod store;
pub mod summary;
pub mod time_index;

use thiserror::Error;

pub use builder::{build_index, BuildError, ParsePhase, ParseProgress};
pub use cache::ReportCache;
pub use store::{RowReader, RowWriter};
pub use summary::{DerivedCounts, IndexSummary, SCHEMA_VERSION};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache artifact: {0}")]
    Corrupt(String),

    #[error("cache is stale: {0}")]
    Stale(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

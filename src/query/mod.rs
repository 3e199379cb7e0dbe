pub mod cursor;
pub mod executor;
pub mod filters;

use thiserror::Error;

pub use cursor::{Direction, QueryCursor};
pub use executor::{LogcatStats, QueryExecutor, QueryResponse, QueryRow};
pub use filters::{LogFilters, TextMode};

use crate::index::IndexError;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid cursor: {0}")]
    CursorInvalid(String),

    #[error("invalid filter: {0}")]
    FilterInvalid(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

//! Read-only analytical query engine over a single uploaded CSV/Parquet file.
//!
//! The uploaded file is exposed to SQL as one virtual table named `data`.
//! Every query goes through the guard (SELECT/WITH only, keyword denylist,
//! relation allowlist) before DataFusion ever sees it.

pub mod execute;
pub mod guard;
pub mod profile;
mod value;

pub use execute::{QueryEngine, QueryOutput};
pub use profile::{profile_dataset, ColumnKind, ColumnProfile, DatasetProfile};

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("SQL syntax error: {0}")]
    Syntax(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("query failed: {0}")]
    Execution(String),

    #[error("query timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

//! Query execution against the session's dataset file.

use std::path::Path;
use std::time::Duration;

use datafusion::prelude::{CsvReadOptions, ParquetReadOptions, SessionContext};
use serde_json::Value;
use tracing::debug;

use crate::{guard, value, QueryError};

/// Result of one engine call. `truncated` means the underlying result had
/// more rows than the cap; that is not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub truncated: bool,
}

/// Stateless executor: each call registers the file as table `data` in a
/// fresh DataFusion context, so nothing leaks between queries or sessions.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    sql_timeout: Duration,
}

impl QueryEngine {
    pub fn new(sql_timeout: Duration) -> Self {
        Self { sql_timeout }
    }

    /// Validate and run `sql`, materializing at most `max_rows` rows.
    pub async fn execute(
        &self,
        file: &Path,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryOutput, QueryError> {
        guard::validate(sql)?;

        match tokio::time::timeout(self.sql_timeout, run(file, sql, max_rows)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(self.sql_timeout)),
        }
    }
}

/// Open a context with the dataset mounted as `data`.
pub(crate) async fn open_context(file: &Path) -> Result<SessionContext, QueryError> {
    let ctx = SessionContext::new();
    let path = file
        .to_str()
        .ok_or_else(|| QueryError::Execution(format!("non-UTF-8 path: {}", file.display())))?;

    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let registered = match extension.as_str() {
        "csv" => ctx.register_csv("data", path, CsvReadOptions::new()).await,
        "parquet" | "pq" => {
            ctx.register_parquet("data", path, ParquetReadOptions::default())
                .await
        }
        other => {
            return Err(QueryError::Execution(format!(
                "unsupported file extension '{other}'; expected .csv or .parquet"
            )))
        }
    };
    registered.map_err(|e| QueryError::Execution(e.to_string()))?;

    Ok(ctx)
}

async fn run(file: &Path, sql: &str, max_rows: usize) -> Result<QueryOutput, QueryError> {
    let ctx = open_context(file).await?;

    // The guard already parsed the statement, so planner failures here are
    // semantic (unknown column, bad function) rather than syntactic.
    let df = ctx
        .sql(sql)
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?;

    let columns: Vec<String> = df
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().to_string())
        .collect();

    // Fetch one row past the cap to learn whether the result was cut off.
    let df = df
        .limit(0, Some(max_rows + 1))
        .map_err(|e| QueryError::Execution(e.to_string()))?;
    let batches = df
        .collect()
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?;

    let mut rows: Vec<Vec<Value>> = Vec::new();
    'outer: for batch in &batches {
        for row_idx in 0..batch.num_rows() {
            if rows.len() > max_rows {
                break 'outer;
            }
            let row = (0..batch.num_columns())
                .map(|col_idx| value::cell(batch.column(col_idx), row_idx))
                .collect();
            rows.push(row);
        }
    }

    let truncated = rows.len() > max_rows;
    rows.truncate(max_rows);

    debug!(rows = rows.len(), truncated, "query executed");

    Ok(QueryOutput {
        columns,
        rows,
        truncated,
    })
}

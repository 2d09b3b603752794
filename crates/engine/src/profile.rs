//! Dataset profiling — computed once at upload, cached with the session.
//!
//! The profile is the only thing the agent sees about the file at turn time;
//! no file I/O happens while building prompts.

use std::path::Path;

use datafusion::arrow::array::Int64Array;
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::prelude::SessionContext;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::execute::open_context;
use crate::{value, QueryError};

/// Broad column classification used in prompts and restore payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Float,
    Boolean,
    Temporal,
    Text,
}

impl ColumnKind {
    pub fn from_arrow(data_type: &DataType) -> Self {
        match data_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => Self::Integer,
            DataType::Float16 | DataType::Float32 | DataType::Float64 => Self::Float,
            DataType::Decimal128(_, _) | DataType::Decimal256(_, _) => Self::Float,
            DataType::Boolean => Self::Boolean,
            DataType::Timestamp(_, _)
            | DataType::Date32
            | DataType::Date64
            | DataType::Time32(_)
            | DataType::Time64(_)
            | DataType::Duration(_)
            | DataType::Interval(_) => Self::Temporal,
            _ => Self::Text,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Temporal => "temporal",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ColumnKind,
    pub null_count: u64,
    pub unique_count: u64,
    /// Up to five distinct non-null values, stringified.
    pub sample_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub row_count: u64,
    pub column_count: usize,
    pub columns: Vec<ColumnProfile>,
    /// First rows of the table as JSON objects, bounded at upload time.
    pub preview: Vec<Value>,
}

impl DatasetProfile {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Profile a dataset file. Fails on unreadable files and on tables with no
/// rows or no columns (the upload collaborator surfaces that as a 400).
pub async fn profile_dataset(file: &Path, preview_rows: usize) -> Result<DatasetProfile, QueryError> {
    let ctx = open_context(file).await?;

    let schema_fields: Vec<(String, DataType)> = {
        let df = ctx
            .table("data")
            .await
            .map_err(|e| QueryError::Execution(e.to_string()))?;
        df.schema()
            .fields()
            .iter()
            .map(|f| (f.name().to_string(), f.data_type().clone()))
            .collect()
    };
    if schema_fields.is_empty() {
        return Err(QueryError::Execution("file contains no columns".into()));
    }

    let row_count = scalar_u64(&collect_sql(&ctx, "SELECT count(*) FROM data").await?)?;
    if row_count == 0 {
        return Err(QueryError::Execution("file contains no data rows".into()));
    }

    let mut columns = Vec::with_capacity(schema_fields.len());
    for (name, data_type) in &schema_fields {
        let quoted = quote_ident(name);

        let null_count = scalar_u64(
            &collect_sql(&ctx, &format!("SELECT count(*) FROM data WHERE {quoted} IS NULL")).await?,
        )?;
        let unique_count = scalar_u64(
            &collect_sql(&ctx, &format!("SELECT count(DISTINCT {quoted}) FROM data")).await?,
        )?;

        let sample_batches = collect_sql(
            &ctx,
            &format!("SELECT DISTINCT {quoted} FROM data WHERE {quoted} IS NOT NULL LIMIT 5"),
        )
        .await?;
        let sample_values = stringify_column(&sample_batches);

        columns.push(ColumnProfile {
            name: name.clone(),
            kind: ColumnKind::from_arrow(data_type),
            null_count,
            unique_count,
            sample_values,
        });
    }

    let preview_batches =
        collect_sql(&ctx, &format!("SELECT * FROM data LIMIT {preview_rows}")).await?;
    let preview = preview_objects(&preview_batches);

    info!(
        file = %file.display(),
        rows = row_count,
        columns = columns.len(),
        "dataset profiled"
    );

    Ok(DatasetProfile {
        row_count,
        column_count: columns.len(),
        columns,
        preview,
    })
}

async fn collect_sql(ctx: &SessionContext, sql: &str) -> Result<Vec<RecordBatch>, QueryError> {
    ctx.sql(sql)
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?
        .collect()
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))
}

/// First cell of the first batch as u64 (COUNT results are Int64).
fn scalar_u64(batches: &[RecordBatch]) -> Result<u64, QueryError> {
    let batch = batches
        .first()
        .filter(|b| b.num_rows() > 0)
        .ok_or_else(|| QueryError::Execution("expected a scalar result".into()))?;
    let array = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| QueryError::Execution("expected an integer scalar".into()))?;
    Ok(array.value(0).max(0) as u64)
}

fn stringify_column(batches: &[RecordBatch]) -> Vec<String> {
    let mut values = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            match value::cell(batch.column(0), row) {
                Value::String(s) => values.push(s),
                Value::Null => {}
                other => values.push(other.to_string()),
            }
        }
    }
    values
}

fn preview_objects(batches: &[RecordBatch]) -> Vec<Value> {
    let mut rows = Vec::new();
    for batch in batches {
        let names: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        for row in 0..batch.num_rows() {
            let mut object = Map::with_capacity(names.len());
            for (idx, name) in names.iter().enumerate() {
                object.insert(name.clone(), value::cell(batch.column(idx), row));
            }
            rows.push(Value::Object(object));
        }
    }
    rows
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

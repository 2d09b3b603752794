//! Arrow cell → JSON value normalization.
//!
//! Integers and floats stay numeric (NaN collapses to null), booleans and
//! strings map directly, and everything else (timestamps, dates, decimals,
//! binary, nested types) renders through Arrow's display form as a string.

use datafusion::arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeStringArray, StringArray, StringViewArray, UInt16Array, UInt32Array,
    UInt64Array, UInt8Array,
};
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::util::display::array_value_to_string;
use serde_json::{Number, Value};

pub(crate) fn cell(array: &ArrayRef, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }

    match array.data_type() {
        DataType::Boolean => downcast::<BooleanArray>(array)
            .map(|a| Value::Bool(a.value(row)))
            .unwrap_or(Value::Null),

        DataType::Int8 => int_cell(downcast::<Int8Array>(array).map(|a| a.value(row) as i64)),
        DataType::Int16 => int_cell(downcast::<Int16Array>(array).map(|a| a.value(row) as i64)),
        DataType::Int32 => int_cell(downcast::<Int32Array>(array).map(|a| a.value(row) as i64)),
        DataType::Int64 => int_cell(downcast::<Int64Array>(array).map(|a| a.value(row))),
        DataType::UInt8 => int_cell(downcast::<UInt8Array>(array).map(|a| a.value(row) as i64)),
        DataType::UInt16 => int_cell(downcast::<UInt16Array>(array).map(|a| a.value(row) as i64)),
        DataType::UInt32 => int_cell(downcast::<UInt32Array>(array).map(|a| a.value(row) as i64)),
        DataType::UInt64 => downcast::<UInt64Array>(array)
            .map(|a| Value::Number(Number::from(a.value(row))))
            .unwrap_or(Value::Null),

        DataType::Float32 => float_cell(downcast::<Float32Array>(array).map(|a| a.value(row) as f64)),
        DataType::Float64 => float_cell(downcast::<Float64Array>(array).map(|a| a.value(row))),

        DataType::Utf8 => downcast::<StringArray>(array)
            .map(|a| Value::String(a.value(row).to_string()))
            .unwrap_or(Value::Null),
        DataType::LargeUtf8 => downcast::<LargeStringArray>(array)
            .map(|a| Value::String(a.value(row).to_string()))
            .unwrap_or(Value::Null),
        DataType::Utf8View => downcast::<StringViewArray>(array)
            .map(|a| Value::String(a.value(row).to_string()))
            .unwrap_or(Value::Null),

        // Timestamps render as ISO-8601; binary/nested as their textual form.
        _ => array_value_to_string(array, row)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn downcast<T: 'static>(array: &ArrayRef) -> Option<&T> {
    array.as_any().downcast_ref::<T>()
}

fn int_cell(value: Option<i64>) -> Value {
    value.map(|v| Value::Number(Number::from(v))).unwrap_or(Value::Null)
}

fn float_cell(value: Option<f64>) -> Value {
    // Number::from_f64 rejects NaN/Inf, which is exactly the null collapse
    // the wire format wants.
    value
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

//! The closed tool set the LLM may invoke.
//!
//! Dispatch is a tagged enum rather than dynamic lookup: every tool the
//! registry knows has a variant with typed arguments, and anything else
//! collapses into `Unknown`, which the loop feeds back to the LLM as an
//! error result so it can correct itself.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::tool::ToolDefinition;

/// Chart-type discriminators accepted by `create_plot`.
const RECOGNIZED_MARKS: &[&str] = &[
    "arc", "area", "bar", "boxplot", "circle", "line", "point", "rect", "square", "tick",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SqlQueryArgs {
    pub sql: String,
    /// Present-progressive status shown to the user while the query runs.
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputTextArgs {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputTableArgs {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatePlotArgs {
    pub title: String,
    pub spec: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct FinalizeArgs {
    #[serde(default)]
    pub session_title: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// One parsed tool call, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    SqlQuery(SqlQueryArgs),
    OutputText(OutputTextArgs),
    OutputTable(OutputTableArgs),
    CreatePlot(CreatePlotArgs),
    Finalize(FinalizeArgs),
    Unknown { name: String },
}

impl ToolInvocation {
    /// Parse a (name, input) pair from the LLM. Unknown names are a variant,
    /// not an error; malformed arguments for a known tool are an error string
    /// destined for the LLM.
    pub fn parse(name: &str, input: Value) -> Result<Self, String> {
        fn args<T: serde::de::DeserializeOwned>(tool: &str, input: Value) -> Result<T, String> {
            serde_json::from_value(input).map_err(|e| format!("invalid arguments for {tool}: {e}"))
        }

        match name {
            "sql_query" => args("sql_query", input).map(Self::SqlQuery),
            "output_text" => args("output_text", input).map(Self::OutputText),
            "output_table" => args("output_table", input).map(Self::OutputTable),
            "create_plot" => {
                let parsed: CreatePlotArgs = args("create_plot", input)?;
                validate_plot_spec(&parsed.spec)?;
                Ok(Self::CreatePlot(parsed))
            }
            "finalize" => args("finalize", input).map(Self::Finalize),
            other => Ok(Self::Unknown {
                name: other.to_string(),
            }),
        }
    }
}

/// The chart spec is opaque to us except for two structural requirements: a
/// recognized mark discriminator and inline data.
fn validate_plot_spec(spec: &Value) -> Result<(), String> {
    let object = spec
        .as_object()
        .ok_or_else(|| "plot spec must be a JSON object".to_string())?;

    let mark = match object.get("mark") {
        Some(Value::String(mark)) => mark.clone(),
        Some(Value::Object(mark)) => mark
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| "plot spec mark object is missing 'type'".to_string())?,
        _ => return Err("plot spec is missing a 'mark' chart type".to_string()),
    };

    if !RECOGNIZED_MARKS.contains(&mark.as_str()) {
        return Err(format!(
            "unrecognized chart type '{mark}'; expected one of {}",
            RECOGNIZED_MARKS.join(", ")
        ));
    }

    if !object.contains_key("data") {
        return Err("plot spec is missing inline 'data'".to_string());
    }

    Ok(())
}

/// Cap the inline data rows a plot ships to the client.
pub fn truncate_plot_data(spec: &mut Value, max_rows: usize) {
    if let Some(values) = spec
        .get_mut("data")
        .and_then(|d| d.get_mut("values"))
        .and_then(|v| v.as_array_mut())
    {
        values.truncate(max_rows);
    }
}

/// Tool schemas sent to the LLM on every request. The set is fixed.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "sql_query".into(),
            description: "Execute a read-only SQL query against the dataset. \
                          The table is named `data`. Only SELECT statements are allowed."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "SQL query (SELECT only)"
                    },
                    "description": {
                        "type": "string",
                        "description": "Present-progressive status shown to the user while running, e.g. 'Counting null values per column...'"
                    }
                },
                "required": ["sql", "description"]
            }),
        },
        ToolDefinition {
            name: "output_text".into(),
            description: "Send a text message to the user. Use for explanations, insights, summaries.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Markdown-formatted text" }
                },
                "required": ["text"]
            }),
        },
        ToolDefinition {
            name: "output_table".into(),
            description: "Display a structured table to the user.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Table title" },
                    "headers": { "type": "array", "items": { "type": "string" } },
                    "rows": {
                        "type": "array",
                        "items": { "type": "array" },
                        "description": "Row data; each row is an array of values"
                    }
                },
                "required": ["title", "headers", "rows"]
            }),
        },
        ToolDefinition {
            name: "create_plot".into(),
            description: "Create a visualization from a declarative Vega-Lite v5 spec. \
                          Include the data inline as data.values (array of objects) and keep it \
                          under 100 rows — aggregate with sql_query first. Supported marks: bar, \
                          line, point, area, rect, tick, circle, boxplot. Use 'width': 'container'."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Chart title" },
                    "spec": { "type": "object", "description": "Vega-Lite v5 spec with inline data.values" }
                },
                "required": ["title", "spec"]
            }),
        },
        ToolDefinition {
            name: "finalize".into(),
            description: "End the current turn. Call this once you have fully answered the user.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_title": {
                        "type": ["string", "null"],
                        "description": "Short descriptive session title (set after initial analysis, null otherwise)"
                    },
                    "suggestions": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Up to three follow-up questions the user might ask next"
                    }
                },
                "required": []
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_form_the_closed_set() {
        let names: Vec<String> = definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["sql_query", "output_text", "output_table", "create_plot", "finalize"]
        );
    }

    #[test]
    fn parses_sql_query() {
        let parsed = ToolInvocation::parse(
            "sql_query",
            json!({"sql": "SELECT 1 FROM data", "description": "Peeking..."}),
        )
        .unwrap();
        assert!(matches!(parsed, ToolInvocation::SqlQuery(args) if args.description == "Peeking..."));
    }

    #[test]
    fn unknown_name_is_a_variant_not_a_crash() {
        let parsed = ToolInvocation::parse("rm_rf", json!({})).unwrap();
        assert_eq!(parsed, ToolInvocation::Unknown { name: "rm_rf".into() });
    }

    #[test]
    fn bad_arguments_become_an_error_string() {
        let err = ToolInvocation::parse("output_text", json!({"txt": "typo"})).unwrap_err();
        assert!(err.contains("output_text"));
    }

    #[test]
    fn finalize_accepts_empty_input() {
        let parsed = ToolInvocation::parse("finalize", json!({})).unwrap();
        assert_eq!(parsed, ToolInvocation::Finalize(FinalizeArgs::default()));
    }

    #[test]
    fn plot_spec_requires_mark_and_data() {
        let good = json!({"mark": "bar", "data": {"values": [{"x": 1}]}, "encoding": {}});
        assert!(validate_plot_spec(&good).is_ok());

        let object_mark = json!({"mark": {"type": "line"}, "data": {"values": []}});
        assert!(validate_plot_spec(&object_mark).is_ok());

        assert!(validate_plot_spec(&json!({"data": {}})).is_err());
        assert!(validate_plot_spec(&json!({"mark": "pie3d", "data": {}})).is_err());
        assert!(validate_plot_spec(&json!({"mark": "bar"})).is_err());
        assert!(validate_plot_spec(&json!("not an object")).is_err());
    }

    #[test]
    fn plot_data_is_truncated_in_place() {
        let mut spec = json!({"mark": "bar", "data": {"values": [1, 2, 3, 4, 5]}});
        truncate_plot_data(&mut spec, 2);
        assert_eq!(spec["data"]["values"].as_array().unwrap().len(), 2);
    }
}

//! Context serializer
//!
//! Structured context injected into LLM requests can be encoded two ways:
//! plain JSON, or "toon", a token-oriented indented notation that folds
//! uniform object arrays into tabular rows. `compare_formats` reports the
//! size of both encodings so scripts can pick the cheaper one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Selected context encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextFormat {
    #[default]
    Json,
    Toon,
}

impl ContextFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Toon => "toon",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "json" => Some(Self::Json),
            "toon" => Some(Self::Toon),
            _ => None,
        }
    }
}

/// Size comparison of the two encodings for one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatComparison {
    pub json_bytes: usize,
    pub toon_bytes: usize,
    pub savings_pct: f64,
    pub recommended: ContextFormat,
}

/// Encode a context value in the selected format.
pub fn encode_context(value: &Value, format: ContextFormat) -> String {
    match format {
        ContextFormat::Json => value.to_string(),
        ContextFormat::Toon => to_toon(value),
    }
}

/// Encode both ways and report which is smaller.
pub fn compare_formats(value: &Value) -> FormatComparison {
    let json_bytes = value.to_string().len();
    let toon_bytes = to_toon(value).len();
    let recommended = if toon_bytes < json_bytes {
        ContextFormat::Toon
    } else {
        ContextFormat::Json
    };
    let savings_pct = if json_bytes == 0 {
        0.0
    } else {
        (json_bytes as f64 - toon_bytes as f64) / json_bytes as f64 * 100.0
    };
    FormatComparison {
        json_bytes,
        toon_bytes,
        savings_pct,
        recommended,
    }
}

/// Render a value as toon text.
pub fn to_toon(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                write_entry(&mut out, key, v, 0);
            }
        }
        other => {
            write_scalar_line(&mut out, other, 0);
        }
    }
    out
}

fn write_entry(out: &mut String, key: &str, value: &Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => {
            out.push_str(&format!("{}{}:\n", pad, key));
            for (k, v) in map {
                write_entry(out, k, v, indent + 1);
            }
        }
        Value::Array(items) => write_array(out, key, items, indent),
        scalar => {
            out.push_str(&format!("{}{}: {}\n", pad, key, scalar_text(scalar)));
        }
    }
}

fn write_array(out: &mut String, key: &str, items: &[Value], indent: usize) {
    let pad = "  ".repeat(indent);
    if items.iter().all(is_scalar) {
        let joined: Vec<String> = items.iter().map(scalar_text).collect();
        out.push_str(&format!("{}{}[{}]: {}\n", pad, key, items.len(), joined.join(",")));
        return;
    }
    if let Some(fields) = uniform_object_fields(items) {
        out.push_str(&format!(
            "{}{}[{}]{{{}}}:\n",
            pad,
            key,
            items.len(),
            fields.join(",")
        ));
        let row_pad = "  ".repeat(indent + 1);
        for item in items {
            if let Value::Object(map) = item {
                let row: Vec<String> = fields
                    .iter()
                    .map(|f| map.get(f).map(scalar_text).unwrap_or_default())
                    .collect();
                out.push_str(&format!("{}{}\n", row_pad, row.join(",")));
            }
        }
        return;
    }
    out.push_str(&format!("{}{}[{}]:\n", pad, key, items.len()));
    let item_pad = "  ".repeat(indent + 1);
    for item in items {
        match item {
            Value::Object(map) => {
                out.push_str(&format!("{}-\n", item_pad));
                for (k, v) in map {
                    write_entry(out, k, v, indent + 2);
                }
            }
            Value::Array(nested) => write_array(out, "-", nested, indent + 1),
            scalar => out.push_str(&format!("{}- {}\n", item_pad, scalar_text(scalar))),
        }
    }
}

fn write_scalar_line(out: &mut String, value: &Value, indent: usize) {
    let pad = "  ".repeat(indent);
    out.push_str(&format!("{}{}\n", pad, scalar_text(value)));
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Field list when every item is an object with identical keys and scalar
/// values; such arrays fold into table rows.
fn uniform_object_fields(items: &[Value]) -> Option<Vec<String>> {
    let first = items.first()?.as_object()?;
    let fields: Vec<String> = first.keys().cloned().collect();
    for item in items {
        let map = item.as_object()?;
        if map.len() != fields.len() {
            return None;
        }
        for field in &fields {
            let value = map.get(field)?;
            if !is_scalar(value) {
                return None;
            }
        }
    }
    Some(fields)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.contains([',', ':', '\n']) || s.is_empty() {
                // Fall back to a JSON-quoted form when the raw text would
                // be ambiguous in a row.
                Value::String(s.clone()).to_string()
            } else {
                s.clone()
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uniform_object_array_folds_into_rows() {
        let value = json!({
            "files": [
                {"path": "a.rs", "lines": 10},
                {"path": "b.rs", "lines": 20}
            ]
        });
        let toon = to_toon(&value);
        assert!(toon.contains("files[2]{path,lines}:"));
        assert!(toon.contains("a.rs,10"));
        assert!(toon.contains("b.rs,20"));
    }

    #[test]
    fn test_scalar_array_is_a_single_line() {
        let toon = to_toon(&json!({"tags": ["a", "b", "c"]}));
        assert_eq!(toon, "tags[3]: a,b,c\n");
    }

    #[test]
    fn test_nested_objects_indent() {
        let toon = to_toon(&json!({"outer": {"inner": 1}}));
        assert_eq!(toon, "outer:\n  inner: 1\n");
    }

    #[test]
    fn test_ambiguous_strings_are_quoted() {
        let toon = to_toon(&json!({"msg": "a,b: c"}));
        assert!(toon.contains("\"a,b: c\""));
    }

    #[test]
    fn test_compare_formats_prefers_smaller_encoding() {
        // Repetitive tabular data is where toon wins.
        let rows: Vec<Value> = (0..20)
            .map(|i| json!({"name": format!("item{}", i), "count": i}))
            .collect();
        let value = json!({"rows": rows});
        let comparison = compare_formats(&value);
        assert!(comparison.toon_bytes < comparison.json_bytes);
        assert_eq!(comparison.recommended, ContextFormat::Toon);
        assert!(comparison.savings_pct > 0.0);
    }

    #[test]
    fn test_format_parse_round_trip() {
        assert_eq!(ContextFormat::parse("json"), Some(ContextFormat::Json));
        assert_eq!(ContextFormat::parse("toon"), Some(ContextFormat::Toon));
        assert_eq!(ContextFormat::parse("yaml"), None);
    }
}

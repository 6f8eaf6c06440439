//! YAML decoding into `serde_json::Value`
//!
//! Manifest bundles are decoded document by document so a failure can point
//! at the exact text that broke the batch. Documents are converted to
//! `serde_json::Value` and deserialized into typed structs from there.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Parse a single YAML document into a `serde_json::Value`.
///
/// Returns `Value::Null` for empty input; extra documents are ignored.
pub fn parse_yaml(input: &str) -> Result<Value, Error> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::parse(e.to_string(), input))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc).map_err(|msg| Error::parse(msg, input)),
        None => Ok(Value::Null),
    }
}

/// Split a stream on `---` separator lines.
///
/// A separator may carry trailing content (`--- # comment`); the directive
/// end marker `...` is not supported.
pub fn split_documents(input: &str) -> Vec<&str> {
    let mut docs = Vec::new();
    let mut start = 0;
    let mut offset = 0;

    for line in input.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed.starts_with("--- ") {
            docs.push(&input[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    docs.push(&input[start..]);
    docs
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, String> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| format!("invalid float {s}: {e}"))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err("unsupported YAML key type".to_string()),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err("YAML aliases not supported".to_string()),
        Yaml::BadValue => Err("bad YAML value".to_string()),
    }
}

//! YAML loading for recipe documents and engine configuration.
//!
//! Documents are parsed with yaml-rust2, lowered to `serde_json::Value`, and
//! then deserialised into typed structs with serde. Going through JSON keeps
//! a single serde data model for every on-disk format the engine reads.

use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// YAML parse or shape error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct YamlError(pub String);

/// Parse the first YAML document in `input`.
///
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse every `---`-separated document in `input`.
pub fn parse_yaml_documents(input: &str) -> Result<Vec<Value>, YamlError> {
    YamlLoader::load_from_str(input)
        .map_err(|e| YamlError(e.to_string()))?
        .into_iter()
        .map(to_json)
        .collect()
}

/// Parse a single YAML document straight into `T`.
pub fn from_yaml<T: DeserializeOwned>(input: &str) -> Result<T, YamlError> {
    let value = parse_yaml(input)?;
    serde_json::from_value(value).map_err(|e| YamlError(e.to_string()))
}

fn to_json(yaml: Yaml) -> Result<Value, YamlError> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|_| YamlError(format!("invalid float literal: {s}")))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Yaml::Hash(hash) => {
            let mut map = Map::with_capacity(hash.len());
            for (k, v) in hash {
                map.insert(key_string(k)?, to_json(v)?);
            }
            Value::Object(map)
        }
        Yaml::Alias(_) => return Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => return Err(YamlError("bad YAML value".to_string())),
    })
}

/// Mapping keys become strings; `1: {...}` and `"1": {...}` are equivalent.
fn key_string(key: Yaml) -> Result<String, YamlError> {
    match key {
        Yaml::String(s) | Yaml::Real(s) => Ok(s),
        Yaml::Integer(i) => Ok(i.to_string()),
        Yaml::Boolean(b) => Ok(b.to_string()),
        Yaml::Null => Ok("null".to_string()),
        _ => Err(YamlError("unsupported YAML key type".to_string())),
    }
}

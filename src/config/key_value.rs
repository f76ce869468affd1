use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyValueInput {
    Pairs(String),
    Map(Map<String, Value>),
}

fn parse_pairs(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(|pair| {
            if let Some((key, value)) = pair.split_once('=') {
                Some((key.trim().to_string(), value.trim().to_string()))
            } else {
                tracing::error!(
                    "Failed to parse '{}', expected format 'key=value', ignoring",
                    pair.trim()
                );
                None
            }
        })
        .collect()
}

/// Accepts either a mapping or a `key=value,key2=value2` string.
pub fn deserialize_key_value_pairs<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = match KeyValueInput::deserialize(deserializer)? {
        KeyValueInput::Pairs(s) => parse_pairs(&s).into_iter().collect(),
        KeyValueInput::Map(map) => map
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect(),
    };
    Ok(map)
}

/// Labels keep scalar values from a mapping, values parsed from a string stay
/// strings.
pub fn deserialize_labels<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let labels = match KeyValueInput::deserialize(deserializer)? {
        KeyValueInput::Pairs(s) => parse_pairs(&s)
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect(),
        KeyValueInput::Map(map) => map,
    };
    Ok(labels)
}

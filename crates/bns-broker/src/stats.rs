//! Statistics bodies
//!
//! `stats` and `stats-tube` answer with a flat YAML mapping, `list-tubes`
//! with a YAML sequence.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::BrokerError;

/// Flat statistics mapping, values rendered as text
pub type Stats = BTreeMap<String, String>;

/// Parse a `stats` / `stats-tube` body
pub(crate) fn parse_stats(body: &[u8]) -> Result<Stats, BrokerError> {
    let raw: BTreeMap<String, Value> =
        serde_yaml::from_slice(body).map_err(|e| BrokerError::Stats(e.to_string()))?;

    raw.into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::Null => String::new(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::String(s) => s,
                other => {
                    return Err(BrokerError::Stats(format!(
                        "field {key:?} is not a scalar: {other:?}"
                    )))
                }
            };
            Ok((key, text))
        })
        .collect()
}

/// Parse a `list-tubes` body
pub(crate) fn parse_tube_list(body: &[u8]) -> Result<Vec<String>, BrokerError> {
    serde_yaml::from_slice(body).map_err(|e| BrokerError::Stats(e.to_string()))
}

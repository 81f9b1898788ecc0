//! Lenient number decoding for Census payloads.
//!
//! The Census API serializes every scalar as a JSON string (`"facility_id": "1234"`),
//! while fixtures and some collections use real numbers. This helper accepts both.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Display;
use std::str::FromStr;

/// Deserialize a number that may arrive as a JSON string or a JSON number.
pub fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let value = Value::deserialize(deserializer)?;
    parse_number(&value).map_err(de::Error::custom)
}

fn parse_number<T>(value: &Value) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => return Err(format!("expected a number or numeric string, got {other}")),
    };
    text.parse::<T>()
        .map_err(|e| format!("invalid number '{text}': {e}"))
}

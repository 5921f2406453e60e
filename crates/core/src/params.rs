//! Batch parameter maps.
//!
//! Parameters reach a batch from operation defaults, configuration files and
//! command-line overrides, so the same option may arrive as a JSON number, a
//! boolean or a string such as `"1000"`. The accessors below accept all of
//! these spellings and report malformed values as `InvalidParam`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::Value as JsonValue;

use crate::error::{BatchError, BatchResult};

/// Ordered map of parameter name to value.
pub type ParamMap = BTreeMap<String, JsonValue>;

/// Date format used for dates carried in parameter maps.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Truthiness of a loosely-typed value (`null`, `false`, `0`, `""`, `"0"`,
/// `"false"`, `"no"`, empty arrays/objects are false).
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no" | "n" | "off"
        ),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

pub fn parse_int(name: &str, value: &JsonValue) -> BatchResult<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| BatchError::invalid_param(name, format!("not an integer: {n}"))),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| BatchError::invalid_param(name, format!("{s:?}: {e}"))),
        other => Err(BatchError::invalid_param(
            name,
            format!("expected an integer, got {other}"),
        )),
    }
}

pub fn parse_bool(name: &str, value: &JsonValue) -> BatchResult<bool> {
    match value {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Null => Ok(false),
        JsonValue::Number(_) => Ok(parse_int(name, value)? != 0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" | "" => Ok(false),
            _ => Err(BatchError::invalid_param(name, format!("not a boolean: {s:?}"))),
        },
        other => Err(BatchError::invalid_param(
            name,
            format!("expected a boolean, got {other}"),
        )),
    }
}

pub fn parse_date(name: &str, value: &JsonValue) -> BatchResult<NaiveDate> {
    match value {
        JsonValue::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .map_err(|e| BatchError::invalid_param(name, format!("{s:?}: {e}"))),
        other => Err(BatchError::invalid_param(
            name,
            format!("expected a YYYY-MM-DD date, got {other}"),
        )),
    }
}

/// Removal accessors on a parameter map.
///
/// `take_*` removes the entry and parses it; `None` means the key was absent
/// (or `null`).
pub trait ParamMapExt {
    fn take_value(&mut self, name: &str) -> Option<JsonValue>;

    fn take_int(&mut self, name: &str) -> BatchResult<Option<i64>> {
        self.take_value(name)
            .filter(|v| !v.is_null())
            .map(|v| parse_int(name, &v))
            .transpose()
    }

    fn take_bool(&mut self, name: &str) -> BatchResult<Option<bool>> {
        self.take_value(name)
            .filter(|v| !v.is_null())
            .map(|v| parse_bool(name, &v))
            .transpose()
    }

    fn take_date(&mut self, name: &str) -> BatchResult<Option<NaiveDate>> {
        self.take_value(name)
            .filter(|v| !v.is_null())
            .map(|v| parse_date(name, &v))
            .transpose()
    }

    fn take_string(&mut self, name: &str) -> Option<String> {
        match self.take_value(name)? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }
}

impl ParamMapExt for ParamMap {
    fn take_value(&mut self, name: &str) -> Option<JsonValue> {
        self.remove(name)
    }
}

/// Build a `ParamMap` from `(name, value)` pairs.
pub fn params<I, K, V>(pairs: I) -> ParamMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<JsonValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

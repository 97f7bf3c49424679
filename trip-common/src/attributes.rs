use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Object key used to carry a non-finite number literal through JSON parsing.
/// See `quote_non_finite_literals`.
pub const NON_FINITE_MARKER: &str = "$non_finite";

const NON_FINITE_LITERALS: [&str; 3] = ["-Infinity", "Infinity", "NaN"];

/// A typed scalar stored as an item attribute.
///
/// Serialized with the same single-letter tags the table used historically,
/// numbers are kept as decimal strings so they round-trip exactly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    #[serde(rename = "S")]
    String(String),
    #[serde(rename = "N", with = "rust_decimal::serde::str")]
    Number(Decimal),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null,
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "{}", s),
            AttributeValue::Number(n) => write!(f, "{}", n),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<Decimal> for AttributeValue {
    fn from(value: Decimal) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Attributes of one item, ordered by name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Reasons a single attribute is dropped instead of stored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoercionWarning {
    #[error("non-finite number {0} cannot be stored")]
    NonFinite(String),
    #[error("number {0} does not fit an exact decimal")]
    OutOfRange(String),
}

/// Coerce one JSON value into a storable attribute.
///
/// Numbers become exact decimals, booleans and null keep their type, strings stay strings.
/// Arrays and objects are stored as their JSON text.
pub fn coerce_value(value: &Value) -> Result<AttributeValue, CoercionWarning> {
    match value {
        Value::Null => Ok(AttributeValue::Null),
        Value::Bool(b) => Ok(AttributeValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(AttributeValue::Number(Decimal::from(i)))
            } else if let Some(u) = n.as_u64() {
                Ok(AttributeValue::Number(Decimal::from(u)))
            } else {
                n.as_f64()
                    .ok_or_else(|| CoercionWarning::OutOfRange(n.to_string()))
                    .and_then(coerce_float)
                    .map(AttributeValue::Number)
            }
        }
        Value::String(s) => Ok(AttributeValue::String(s.clone())),
        Value::Object(map) => match (map.len(), map.get(NON_FINITE_MARKER)) {
            (1, Some(literal)) => Err(CoercionWarning::NonFinite(
                literal.as_str().unwrap_or("NaN").to_owned(),
            )),
            _ => Ok(AttributeValue::String(value.to_string())),
        },
        Value::Array(_) => Ok(AttributeValue::String(value.to_string())),
    }
}

/// Convert a float through its shortest decimal rendering, so 12.5 stays 12.5 and not
/// the binary expansion of the closest double.
pub fn coerce_float(value: f64) -> Result<Decimal, CoercionWarning> {
    if !value.is_finite() {
        return Err(CoercionWarning::NonFinite(value.to_string()));
    }

    let rendered = value.to_string();
    Decimal::from_str(&rendered).map_err(|_| CoercionWarning::OutOfRange(rendered))
}

/// Rewrite bare `NaN`, `Infinity` and `-Infinity` tokens into marker objects so the
/// payload parses as strict JSON. Tokens inside string literals are left untouched.
pub fn quote_non_finite_literals(payload: &str) -> std::borrow::Cow<'_, str> {
    if !NON_FINITE_LITERALS
        .iter()
        .any(|literal| payload.contains(literal))
    {
        return std::borrow::Cow::Borrowed(payload);
    }

    let bytes = payload.as_bytes();
    let mut out = String::with_capacity(payload.len() + 32);
    let mut in_string = false;
    let mut escaped = false;
    let mut copied_up_to = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if b == b'"' {
            in_string = true;
            i += 1;
            continue;
        }

        if let Some(literal) = NON_FINITE_LITERALS
            .iter()
            .find(|literal| bytes[i..].starts_with(literal.as_bytes()))
        {
            out.push_str(&payload[copied_up_to..i]);
            out.push_str(&format!(r#"{{"{}":"{}"}}"#, NON_FINITE_MARKER, literal));
            i += literal.len();
            copied_up_to = i;
            continue;
        }

        i += 1;
    }

    out.push_str(&payload[copied_up_to..]);
    std::borrow::Cow::Owned(out)
}

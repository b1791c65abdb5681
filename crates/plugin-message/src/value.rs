//! Typed parameter values.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An address that is only meaningful inside the process that produced it.
///
/// Shared-memory base addresses travel as `ForeignAddress` tokens. The token
/// can be compared, logged and passed to the backend that lives in the same
/// process as the mapping, but this type offers no way to turn it back into a
/// pointer. Receivers resolve a region through its `name`, never through the
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignAddress(u64);

impl ForeignAddress {
    /// Capture a local pointer as a token.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    /// Wrap a raw token value.
    pub fn from_token(token: u64) -> Self {
        Self(token)
    }

    /// The raw token value.
    pub fn token(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ForeignAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// A parameter value.
///
/// Serialized externally tagged with a short tag per variant:
///
/// | variant | tag | wire form |
/// |---|---|---|
/// | `String` | `s` | JSON string |
/// | `Boolean` | `b` | JSON bool |
/// | `S32` | `i` | JSON number |
/// | `U32` | `u` | 8 hex digits, e.g. `"0000ff00"` |
/// | `Real` | `r` | JSON number, or `"nan"`, `"inf"`, `"-inf"` |
/// | `Pointer` | `p` | `"0x"` + 16 hex digits |
/// | `Binary` | `bin` | base64 string |
/// | `Map` | `map` | object of tagged values |
/// | `Array` | `arr` | array of tagged values |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[serde(rename = "s")]
    String(String),
    #[serde(rename = "b")]
    Boolean(bool),
    #[serde(rename = "i")]
    S32(i32),
    #[serde(rename = "u", with = "hex_u32")]
    U32(u32),
    #[serde(rename = "r", with = "real")]
    Real(f64),
    #[serde(rename = "p", with = "foreign_address")]
    Pointer(ForeignAddress),
    #[serde(rename = "bin", with = "binary")]
    Binary(Vec<u8>),
    #[serde(rename = "map")]
    Map(BTreeMap<String, Value>),
    #[serde(rename = "arr")]
    Array(Vec<Value>),
}

impl Value {
    /// String view of the value. Missing text coerces to an empty string.
    pub fn to_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Boolean(b) => b.to_string(),
            Value::S32(v) => v.to_string(),
            Value::U32(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Pointer(addr) => addr.to_string(),
            Value::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Value::Map(_) | Value::Array(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    pub fn to_s32(&self) -> i32 {
        match self {
            Value::S32(v) => *v,
            Value::U32(v) => *v as i32,
            Value::Real(v) => *v as i32,
            Value::Boolean(b) => i32::from(*b),
            Value::String(s) => s.trim().parse().unwrap_or(0),
            Value::Pointer(_) | Value::Binary(_) | Value::Map(_) | Value::Array(_) => 0,
        }
    }

    pub fn to_u32(&self) -> u32 {
        match self {
            Value::U32(v) => *v,
            Value::S32(v) => *v as u32,
            Value::Real(v) => *v as u32,
            Value::Boolean(b) => u32::from(*b),
            Value::String(s) => parse_u32_text(s).unwrap_or(0),
            Value::Pointer(_) | Value::Binary(_) | Value::Map(_) | Value::Array(_) => 0,
        }
    }

    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::S32(v) => *v != 0,
            Value::U32(v) => *v != 0,
            Value::Real(v) => *v != 0.0,
            Value::String(s) => matches!(s.trim(), "true" | "1"),
            Value::Pointer(addr) => !addr.is_null(),
            Value::Binary(_) | Value::Map(_) | Value::Array(_) => false,
        }
    }

    pub fn to_real(&self) -> f64 {
        match self {
            Value::Real(v) => *v,
            Value::S32(v) => f64::from(*v),
            Value::U32(v) => f64::from(*v),
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            Value::Pointer(_) | Value::Binary(_) | Value::Map(_) | Value::Array(_) => 0.0,
        }
    }
}

fn parse_u32_text(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::S32(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::U32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<ForeignAddress> for Value {
    fn from(value: ForeignAddress) -> Self {
        Value::Pointer(value)
    }
}

mod hex_u32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:08x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text.strip_prefix("0x").unwrap_or(&text);
        u32::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
    }
}

mod real {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => other.parse().map_err(serde::de::Error::custom),
            },
        }
    }
}

mod foreign_address {
    use super::ForeignAddress;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &ForeignAddress,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<ForeignAddress, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text.strip_prefix("0x").unwrap_or(&text);
        u64::from_str_radix(digits, 16)
            .map(ForeignAddress::from_token)
            .map_err(serde::de::Error::custom)
    }
}

mod binary {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

//! Lenient field decoders for request payloads.
//!
//! Browsers send missing values as JSON `null`, as the strings `"null"` or
//! `"undefined"`, or as numbers wrapped in strings. These helpers fold all of
//! that into `Option`s so request structs can derive `Deserialize`.

use serde::de::{DeserializeOwned, Deserializer, Error};
use serde::Deserialize;
use serde_json::Value;

fn is_absent(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s == "null" || s == "undefined",
        _ => false,
    }
}

/// `Option<String>`; absent markers and the empty string become `None`.
pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = Value::deserialize(d)?;
    if is_absent(&v) {
        return Ok(None);
    }
    match v {
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(D::Error::custom(format!("expected a string, got {}", other))),
    }
}

/// `Option<f64>`; unparseable values become `None` rather than an error.
pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

/// Truthiness of a flag; absent markers are `false`.
pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let v = Value::deserialize(d)?;
    if is_absent(&v) {
        return Ok(false);
    }
    Ok(match v {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    })
}

/// Any enum with a default; absent markers pick the default.
pub fn or_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let v = Value::deserialize(d)?;
    if is_absent(&v) || v.as_str() == Some("") {
        return Ok(T::default());
    }
    serde_json::from_value(v).map_err(D::Error::custom)
}

/// Subset id sent either as a number or a numeric string.
pub fn opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct Loose {
        #[serde(deserialize_with = "opt_string")]
        name: Option<String>,
        #[serde(deserialize_with = "opt_f64")]
        value: Option<f64>,
        #[serde(deserialize_with = "flag")]
        on: bool,
        #[serde(deserialize_with = "opt_id")]
        id: Option<u32>,
    }

    #[test]
    fn browser_placeholders_are_absent() {
        let p: Loose = serde_json::from_str(
            r#"{"name": "undefined", "value": "null", "on": "null", "id": "7"}"#,
        )
        .unwrap();
        assert_eq!(p.name, None);
        assert_eq!(p.value, None);
        assert!(!p.on);
        assert_eq!(p.id, Some(7));

        let p: Loose = serde_json::from_str(r#"{"name": "x", "value": "2.5", "on": 1}"#).unwrap();
        assert_eq!(p.name.as_deref(), Some("x"));
        assert_eq!(p.value, Some(2.5));
        assert!(p.on);
        assert_eq!(p.id, None);
    }
}

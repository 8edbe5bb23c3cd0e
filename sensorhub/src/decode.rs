//! Payload decoding and normalization.
//!
//! Producers publish either a JSON object keyed by field names (with values given as bare
//! numbers, `{"value", "unit"}` objects, or formatted strings like `"29.42 °C"`) or, for older
//! firmware, free text whose first two numbers are temperature and humidity. Everything is
//! reduced here to `Field -> Measurement` so nothing downstream sees the source shape.

use crate::errors::{Error, Result};
use crate::model::{Field, Measurement, Quality};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

lazy_static! {
    static ref VALUE_WITH_UNIT: Regex =
        Regex::new(r"^\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*(.*?)\s*$").unwrap();
    static ref BARE_NUMBER: Regex = Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)").unwrap();
}

/// Checked in order; the first key present wins.
const TEMPERATURE_KEYS: [&str; 3] = ["temp", "t", "temperature"];
const HUMIDITY_KEYS: [&str; 3] = ["hum", "h", "humidity"];
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "date time", "datetime"];
const VIBRATION_KEY: &str = "vibration";

#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Accept free-text payloads using the temperature-then-humidity positional rule.
    pub legacy_positional: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            legacy_positional: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub fields: BTreeMap<Field, Measurement>,
    pub timestamp: Option<DateTime<Utc>>,
    pub quality: Quality,
}

/// Decodes a raw payload into canonical measurements.
///
/// Returns `Error::Parse` when the payload matches no known shape and `Error::Validation`
/// when it is a JSON object without any recognized field.
pub fn decode_payload(payload: &[u8], options: &DecodeOptions) -> Result<Decoded> {
    if let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(payload) {
        return decode_structured(&object);
    }

    if !options.legacy_positional {
        return Err(Error::Parse(
            "payload is not a JSON object and positional decoding is disabled".to_string(),
        ));
    }

    decode_positional(payload)
}

fn decode_structured(object: &Map<String, Value>) -> Result<Decoded> {
    let normalized: BTreeMap<String, &Value> = object
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v))
        .collect();

    let mut fields = BTreeMap::new();

    if let Some(m) = first_alias(&normalized, &TEMPERATURE_KEYS, Field::Temperature) {
        fields.insert(Field::Temperature, m);
    }
    if let Some(m) = first_alias(&normalized, &HUMIDITY_KEYS, Field::Humidity) {
        fields.insert(Field::Humidity, m);
    }
    for field in [Field::Bpm, Field::Spo2] {
        if let Some(m) = normalized
            .get(field.as_str())
            .and_then(|v| normalize_value(field, v))
        {
            fields.insert(field, m);
        }
    }

    let vibration = normalized.get(VIBRATION_KEY).and_then(|v| v.as_object());
    for field in [Field::X, Field::Y, Field::Z] {
        let flat = normalized.get(field.as_str()).copied();
        let nested = vibration.and_then(|vib| lookup_ci(vib, field.as_str()));
        if let Some(m) = flat.or(nested).and_then(|v| normalize_value(field, v)) {
            fields.insert(field, m);
        }
    }

    if fields.is_empty() {
        return Err(Error::Validation(
            "payload contains no recognized measurement field".to_string(),
        ));
    }

    let timestamp = TIMESTAMP_KEYS
        .iter()
        .find_map(|key| normalized.get(*key))
        .and_then(|v| parse_timestamp_value(v));

    Ok(Decoded {
        fields,
        timestamp,
        quality: Quality::Good,
    })
}

fn first_alias(
    normalized: &BTreeMap<String, &Value>,
    aliases: &[&str],
    field: Field,
) -> Option<Measurement> {
    aliases
        .iter()
        .find_map(|key| normalized.get(*key))
        .and_then(|v| normalize_value(field, v))
}

fn lookup_ci<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object
        .iter()
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Legacy rule: first number is temperature, second is humidity.
fn decode_positional(payload: &[u8]) -> Result<Decoded> {
    let text = String::from_utf8_lossy(payload);
    let mut numbers = BARE_NUMBER
        .find_iter(&text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite());

    let mut fields = BTreeMap::new();
    for field in [Field::Temperature, Field::Humidity] {
        match numbers.next() {
            Some(value) => {
                fields.insert(field, Measurement::new(value, field.default_unit()));
            }
            None => break,
        }
    }

    if fields.is_empty() {
        return Err(Error::Parse("no numeric value in plain-text payload".to_string()));
    }

    Ok(Decoded {
        fields,
        timestamp: None,
        quality: Quality::Legacy,
    })
}

/// Reduces any accepted value shape to a measurement. Returns `None` for shapes that carry
/// no finite number.
pub fn normalize_value(field: Field, value: &Value) -> Option<Measurement> {
    let (magnitude, unit) = match value {
        Value::Number(n) => (n.as_f64()?, None),
        Value::String(s) => parse_formatted(s)?,
        Value::Object(obj) => {
            let (magnitude, inline_unit) = match lookup_ci(obj, "value")? {
                Value::Number(n) => (n.as_f64()?, None),
                Value::String(s) => parse_formatted(s)?,
                _ => return None,
            };
            let unit = lookup_ci(obj, "unit")
                .and_then(|u| u.as_str())
                .map(str::to_string)
                .or(inline_unit);
            (magnitude, unit)
        }
        _ => return None,
    };

    if !magnitude.is_finite() {
        return None;
    }

    Some(Measurement::new(
        magnitude,
        canonical_unit(field, unit.as_deref().unwrap_or("")),
    ))
}

fn parse_formatted(s: &str) -> Option<(f64, Option<String>)> {
    let caps = VALUE_WITH_UNIT.captures(s)?;
    let magnitude = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().trim())
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    Some((magnitude, unit))
}

/// Maps producer unit spellings onto one spelling per field.
pub fn canonical_unit(field: Field, unit: &str) -> String {
    let trimmed = unit.trim();
    if trimmed.is_empty() {
        return field.default_unit().to_string();
    }

    let lower = trimmed.to_lowercase();
    match (field, lower.as_str()) {
        (Field::Temperature, "c" | "°c" | "degc" | "celsius" | "℃") => "°C".to_string(),
        (Field::Temperature, "f" | "°f" | "degf" | "fahrenheit" | "℉") => "°F".to_string(),
        (Field::Humidity | Field::Spo2, "%" | "pct" | "percent" | "%rh" | "rh") => "%".to_string(),
        (Field::Bpm, "bpm") => "bpm".to_string(),
        (Field::X | Field::Y | Field::Z, "g") => "g".to_string(),
        _ => trimmed.to_string(),
    }
}

fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            // Values this large are epoch milliseconds.
            let millis = if secs.abs() >= 1e12 { secs } else { secs * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]` (read as UTC) and a
/// bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(payload: &str) -> Result<Decoded> {
        decode_payload(payload.as_bytes(), &DecodeOptions::default())
    }

    #[test]
    fn test_structured_bare_numbers() {
        let decoded = decode(r#"{"temperature": 29.42, "humidity": 72.94}"#).unwrap();
        assert_eq!(
            decoded.fields[&Field::Temperature],
            Measurement::new(29.42, "°C")
        );
        assert_eq!(decoded.fields[&Field::Humidity], Measurement::new(72.94, "%"));
        assert_eq!(decoded.quality, Quality::Good);
        assert!(decoded.timestamp.is_none());
    }

    #[test]
    fn test_structured_formatted_strings_and_aliases() {
        let decoded = decode(r#"{"T": "24.50 C", "H": "55.10 %", "date time": "2024-05-01 10:20:30"}"#)
            .unwrap();
        assert_eq!(decoded.fields[&Field::Temperature], Measurement::new(24.5, "°C"));
        assert_eq!(decoded.fields[&Field::Humidity], Measurement::new(55.1, "%"));
        assert_eq!(
            decoded.timestamp.unwrap().to_rfc3339(),
            "2024-05-01T10:20:30+00:00"
        );
    }

    #[test]
    fn test_structured_value_unit_objects() {
        let decoded = decode(
            r#"{"temp": {"value": 30.1, "unit": "celsius"}, "spo2": {"value": "97"}, "bpm": 72}"#,
        )
        .unwrap();
        assert_eq!(decoded.fields[&Field::Temperature], Measurement::new(30.1, "°C"));
        assert_eq!(decoded.fields[&Field::Spo2], Measurement::new(97.0, "%"));
        assert_eq!(decoded.fields[&Field::Bpm], Measurement::new(72.0, "bpm"));
    }

    #[test]
    fn test_first_alias_wins() {
        let decoded = decode(r#"{"temp": 10, "t": 20}"#).unwrap();
        assert_eq!(decoded.fields[&Field::Temperature].value, 10.0);

        let decoded =
            decode(r#"{"temperature": 20, "temp": 10, "humidity": 70, "h": 35}"#).unwrap();
        assert_eq!(decoded.fields[&Field::Temperature].value, 10.0);
        assert_eq!(decoded.fields[&Field::Humidity].value, 35.0);
    }

    #[test]
    fn test_vibration_nested_and_flat() {
        let decoded = decode(r#"{"x": 0.1, "vibration": {"x": 9.0, "Y": 0.2, "z": "0.98 g"}}"#).unwrap();
        assert_eq!(decoded.fields[&Field::X].value, 0.1);
        assert_eq!(decoded.fields[&Field::Y].value, 0.2);
        assert_eq!(decoded.fields[&Field::Z], Measurement::new(0.98, "g"));
    }

    #[test]
    fn test_object_without_known_fields_is_rejected() {
        let err = decode(r#"{"pressure": 1013, "status": "ok"}"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_unparseable_values_are_skipped() {
        let decoded = decode(r#"{"temperature": "n/a", "humidity": 40}"#).unwrap();
        assert!(!decoded.fields.contains_key(&Field::Temperature));
        assert_eq!(decoded.fields[&Field::Humidity].value, 40.0);
    }

    #[test]
    fn test_positional_fallback() {
        let decoded = decode("Temp: 23.5 C, Hum: 61%").unwrap();
        assert_eq!(decoded.fields[&Field::Temperature], Measurement::new(23.5, "°C"));
        assert_eq!(decoded.fields[&Field::Humidity], Measurement::new(61.0, "%"));
        assert_eq!(decoded.quality, Quality::Legacy);
    }

    #[test]
    fn test_positional_single_number() {
        let decoded = decode("-4.25").unwrap();
        assert_eq!(decoded.fields.len(), 1);
        assert_eq!(decoded.fields[&Field::Temperature].value, -4.25);
    }

    #[test]
    fn test_positional_disabled() {
        let options = DecodeOptions {
            legacy_positional: false,
        };
        let err = decode_payload(b"23.5 61", &options).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_no_numbers_is_parse_error() {
        assert!(matches!(decode("hello sensor").unwrap_err(), Error::Parse(_)));
        assert!(matches!(decode("").unwrap_err(), Error::Parse(_)));
    }

    #[test]
    fn test_normalize_rejects_non_numeric_shapes() {
        assert!(normalize_value(Field::Bpm, &json!(true)).is_none());
        assert!(normalize_value(Field::Bpm, &json!([1, 2])).is_none());
        assert!(normalize_value(Field::Bpm, &json!({"unit": "bpm"})).is_none());
    }

    #[test]
    fn test_canonical_units() {
        assert_eq!(canonical_unit(Field::Temperature, "degC"), "°C");
        assert_eq!(canonical_unit(Field::Humidity, "%RH"), "%");
        assert_eq!(canonical_unit(Field::Humidity, ""), "%");
        assert_eq!(canonical_unit(Field::X, "m/s2"), "m/s2");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-05-01T10:20:30Z").is_some());
        assert!(parse_timestamp("2024-05-01T10:20:30+02:00").is_some());
        assert!(parse_timestamp("2024-05-01 10:20:30").is_some());
        assert!(parse_timestamp("2024-05-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_epoch_timestamps() {
        let secs = parse_timestamp_value(&json!(1_714_558_830)).unwrap();
        let millis = parse_timestamp_value(&json!(1_714_558_830_000_i64)).unwrap();
        assert_eq!(secs, millis);
    }
}

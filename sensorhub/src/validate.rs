use crate::errors::{Error, Result};
use crate::model::Reading;
use lazy_static::lazy_static;
use regex::Regex;

/// Topics look like `<namespace>/SUB/<sensor_id>`.
const MIN_TOPIC_SEGMENTS: usize = 3;
const MAX_SENSOR_ID_LEN: usize = 128;

/// Ids that only show up when a producer publishes on a truncated topic.
pub const PLACEHOLDER_SENSOR_IDS: [&str; 5] = ["", "temp", "sub", "unknown", "null"];

lazy_static! {
    static ref SENSOR_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap();
}

/// Extracts the sensor id from the last topic segment.
pub fn sensor_id_from_topic(topic: &str) -> Result<String> {
    let topic = topic.trim();
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < MIN_TOPIC_SEGMENTS {
        return Err(Error::Validation(format!(
            "Topic '{}' has fewer than {} segments",
            topic, MIN_TOPIC_SEGMENTS
        )));
    }

    let sensor_id = segments.last().map(|s| s.trim()).unwrap_or_default();
    validate_sensor_id(sensor_id)?;
    Ok(sensor_id.to_string())
}

pub fn validate_sensor_id(sensor_id: &str) -> Result<()> {
    if sensor_id.is_empty() {
        return Err(Error::Validation("Sensor ID cannot be empty".to_string()));
    }

    if is_placeholder_id(sensor_id) {
        return Err(Error::Validation(format!(
            "Sensor ID '{}' is a placeholder",
            sensor_id
        )));
    }

    if sensor_id.len() > MAX_SENSOR_ID_LEN {
        return Err(Error::Validation(format!(
            "Sensor ID longer than {} characters",
            MAX_SENSOR_ID_LEN
        )));
    }

    if !SENSOR_ID_PATTERN.is_match(sensor_id) {
        return Err(Error::Validation(format!(
            "Sensor ID '{}' contains invalid characters",
            sensor_id
        )));
    }

    Ok(())
}

pub fn is_placeholder_id(sensor_id: &str) -> bool {
    let lower = sensor_id.trim().to_lowercase();
    PLACEHOLDER_SENSOR_IDS.contains(&lower.as_str())
}

/// Validates an assembled reading before it is handed to storage.
pub fn validate(reading: &Reading) -> Result<()> {
    validate_sensor_id(&reading.sensor_id)?;

    if reading.fields.is_empty() {
        return Err(Error::Validation(
            "Reading must carry at least one field".to_string(),
        ));
    }

    if let Some((field, _)) = reading
        .fields
        .iter()
        .find(|(_, m)| !m.value.is_finite())
    {
        return Err(Error::Validation(format!("{} is not a finite number", field)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, Measurement, Quality};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn reading(sensor_id: &str, fields: BTreeMap<Field, Measurement>) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            sensor_id: sensor_id.to_string(),
            timestamp: Utc::now(),
            fields,
            topic: format!("TEMP/SUB/{}", sensor_id),
            raw: Vec::new(),
            quality: Quality::Good,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_sensor_id_from_topic() {
        assert_eq!(sensor_id_from_topic("TEMP/SUB/sensor_01").unwrap(), "sensor_01");
        assert_eq!(sensor_id_from_topic("farm/a/SUB/dev-7.b").unwrap(), "dev-7.b");
    }

    #[test]
    fn test_empty_sensor_id() {
        assert!(sensor_id_from_topic("TEMP/SUB/").is_err());
        assert!(sensor_id_from_topic("TEMP/SUB/  ").is_err());
    }

    #[test]
    fn test_short_topic() {
        assert!(sensor_id_from_topic("sensor_01").is_err());
        assert!(sensor_id_from_topic("TEMP/sensor_01").is_err());
    }

    #[test]
    fn test_placeholder_ids() {
        assert!(sensor_id_from_topic("TEMP/SUB/unknown").is_err());
        assert!(sensor_id_from_topic("TEMP/SUB/SUB").is_err());
        assert!(is_placeholder_id("Temp"));
        assert!(!is_placeholder_id("temp_1"));
    }

    #[test]
    fn test_invalid_characters() {
        assert!(sensor_id_from_topic("TEMP/SUB/sensor 01").is_err());
        assert!(sensor_id_from_topic("TEMP/SUB/sensor#1").is_err());
    }

    #[test]
    fn test_valid_reading() {
        let fields = BTreeMap::from([(Field::Temperature, Measurement::new(21.0, "°C"))]);
        assert!(validate(&reading("sensor_01", fields)).is_ok());
    }

    #[test]
    fn test_reading_without_fields() {
        assert!(validate(&reading("sensor_01", BTreeMap::new())).is_err());
    }

    #[test]
    fn test_non_finite_value() {
        let fields = BTreeMap::from([(Field::Bpm, Measurement::new(f64::NAN, "bpm"))]);
        assert!(validate(&reading("sensor_01", fields)).is_err());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Measurement names a sensor may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Temperature,
    Humidity,
    Bpm,
    Spo2,
    X,
    Y,
    Z,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Temperature,
        Field::Humidity,
        Field::Bpm,
        Field::Spo2,
        Field::X,
        Field::Y,
        Field::Z,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Temperature => "temperature",
            Field::Humidity => "humidity",
            Field::Bpm => "bpm",
            Field::Spo2 => "spo2",
            Field::X => "x",
            Field::Y => "y",
            Field::Z => "z",
        }
    }

    pub fn parse(name: &str) -> Option<Field> {
        let name = name.trim();
        Field::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(name))
    }

    /// Unit assumed when the producer does not state one.
    pub fn default_unit(&self) -> &'static str {
        match self {
            Field::Temperature => "°C",
            Field::Humidity => "%",
            Field::Bpm => "bpm",
            Field::Spo2 => "%",
            Field::X | Field::Y | Field::Z => "g",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical value of one field: magnitude plus unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: String,
}

impl Measurement {
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Good,
    Legacy,
    Migrated,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Legacy => "legacy",
            Quality::Migrated => "migrated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "legacy" => Quality::Legacy,
            "migrated" => Quality::Migrated,
            _ => Quality::Good,
        }
    }
}

/// One stored measurement document. Never updated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: Uuid,
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<Field, Measurement>,
    pub topic: String,
    #[serde(serialize_with = "raw_as_text", deserialize_with = "raw_from_text")]
    pub raw: Vec<u8>,
    pub quality: Quality,
    pub received_at: DateTime<Utc>,
}

impl Reading {
    pub fn field(&self, field: Field) -> Option<&Measurement> {
        self.fields.get(&field)
    }
}

/// Valid UTF-8 is served as text, anything else as the byte array.
fn raw_as_text<S: Serializer>(raw: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    match std::str::from_utf8(raw) {
        Ok(text) => serializer.serialize_str(text),
        Err(_) => raw.serialize(serializer),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRepr {
    Text(String),
    Bytes(Vec<u8>),
}

fn raw_from_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    Ok(match RawRepr::deserialize(deserializer)? {
        RawRepr::Text(text) => text.into_bytes(),
        RawRepr::Bytes(bytes) => bytes,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub optimal: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    #[default]
    Active,
    Inactive,
}

/// Master record for a provisioned sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: String,
    #[serde(default)]
    pub capabilities: Vec<Field>,
    #[serde(default)]
    pub location: serde_json::Value,
    #[serde(default)]
    pub thresholds: BTreeMap<Field, Threshold>,
    #[serde(default)]
    pub status: SensorStatus,
}

/// Storage health summary served by `/api/health`
#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub status: &'static str,
    pub backend: &'static str,
    pub total_documents: u64,
    pub latest_document: Option<Reading>,
}

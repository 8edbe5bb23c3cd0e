//! Sensor telemetry service: MQTT ingestion into a reading store, retention and archival
//! of stored readings, and a read-only HTTP API over them.

pub mod config;
pub mod decode;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod query;
pub mod rest;
pub mod store;
pub mod validate;
pub mod worker;

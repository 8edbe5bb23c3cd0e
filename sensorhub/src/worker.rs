use crate::decode::{decode_payload, DecodeOptions};
use crate::errors::{Error, Result};
use crate::metrics::{
    self, reason, INGEST_FAILURES_TOTAL, READINGS_STORED_TOTAL, WRITE_LATENCY_SECONDS,
    WRITE_RETRIES_TOTAL,
};
use crate::model::Reading;
use crate::store::{ReadingStore, StoreError};
use crate::validate::{sensor_id_from_topic, validate};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): 100ms, 200ms, 400ms, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidTopic,
    Parse,
    Validation,
    Storage,
}

impl DropReason {
    fn label(&self) -> &'static str {
        match self {
            DropReason::InvalidTopic => reason::INVALID_TOPIC,
            DropReason::Parse => reason::PARSE,
            DropReason::Validation => reason::VALIDATION,
            DropReason::Storage => reason::STORAGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored(Uuid),
    Dropped(DropReason),
}

/// Turns one `(topic, payload)` pair into at most one stored reading.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn ReadingStore>,
    decode: DecodeOptions,
    retry: RetryPolicy,
}

impl Ingestor {
    pub fn new(store: Arc<dyn ReadingStore>, decode: DecodeOptions, retry: RetryPolicy) -> Self {
        Self {
            store,
            decode,
            retry,
        }
    }

    /// Decodes, normalizes and validates a message. Never touches storage.
    pub fn build_reading(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Reading> {
        let sensor_id = sensor_id_from_topic(topic)?;
        let decoded = decode_payload(payload, &self.decode)?;

        let reading = Reading {
            id: Uuid::new_v4(),
            sensor_id,
            timestamp: decoded.timestamp.unwrap_or(received_at),
            fields: decoded.fields,
            topic: topic.to_string(),
            raw: payload.to_vec(),
            quality: decoded.quality,
            received_at,
        };
        validate(&reading)?;
        Ok(reading)
    }

    /// Processes one message. Failures are contained here and reported as a drop.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        let reading = match self.build_reading(topic, payload, Utc::now()) {
            Ok(reading) => reading,
            Err(e) => {
                let drop = match &e {
                    Error::Parse(_) => DropReason::Parse,
                    Error::Validation(_) if sensor_id_from_topic(topic).is_err() => {
                        DropReason::InvalidTopic
                    }
                    _ => DropReason::Validation,
                };
                warn!(topic = %topic, reason = drop.label(), "Dropping message: {}", e);
                metrics::record_drop(drop.label());
                return IngestOutcome::Dropped(drop);
            }
        };

        match self.store_with_retry(&reading).await {
            Ok(()) => {
                READINGS_STORED_TOTAL.inc();
                IngestOutcome::Stored(reading.id)
            }
            Err(e) => {
                error!(
                    topic = %topic,
                    sensor = %reading.sensor_id,
                    "Dropping reading after storage failure: {}", e
                );
                INGEST_FAILURES_TOTAL.inc();
                metrics::record_drop(DropReason::Storage.label());
                IngestOutcome::Dropped(DropReason::Storage)
            }
        }
    }

    /// Writes with bounded retry. The reading id is fixed before the first attempt, so an
    /// attempt that committed but reported failure is not stored twice.
    async fn store_with_retry(&self, reading: &Reading) -> std::result::Result<(), StoreError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.store.insert_reading(reading).await {
                Ok(()) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    WRITE_LATENCY_SECONDS.observe(elapsed);
                    if attempt > 1 {
                        info!(
                            sensor = %reading.sensor_id,
                            "Reading stored after {} attempts in {:.3}s", attempt, elapsed
                        );
                    } else {
                        debug!(sensor = %reading.sensor_id, "Reading stored in {:.3}s", elapsed);
                    }
                    return Ok(());
                }
                Err(e) => {
                    if !e.is_transient() || attempt >= self.retry.max_attempts {
                        return Err(e);
                    }

                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        sensor = %reading.sensor_id,
                        "Storage write failed (attempt {}/{}): {}. Retrying in {}ms...",
                        attempt,
                        self.retry.max_attempts,
                        e,
                        backoff.as_millis()
                    );
                    WRITE_RETRIES_TOTAL.inc();
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, Quality};
    use crate::store::{MemoryStore, ReadingFilter, Window};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn ingestor(store: Arc<MemoryStore>) -> Ingestor {
        Ingestor::new(store, DecodeOptions::default(), fast_retry())
    }

    async fn stored(store: &MemoryStore, sensor_id: &str) -> Vec<Reading> {
        store
            .find_readings(
                &ReadingFilter::for_sensor(sensor_id),
                Window { offset: 0, limit: 100 },
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[tokio::test]
    async fn test_structured_message_stored_with_raw() {
        let store = Arc::new(MemoryStore::new());
        let payload = br#"{"temperature": 29.42, "humidity": 72.94}"#;

        let outcome = ingestor(store.clone())
            .handle("TEMP/SUB/sensor_01", payload)
            .await;
        assert!(matches!(outcome, IngestOutcome::Stored(_)));

        let readings = stored(&store, "sensor_01").await;
        assert_eq!(readings.len(), 1);
        let reading = &readings[0];
        assert_eq!(reading.raw, payload.to_vec());
        assert_eq!(reading.topic, "TEMP/SUB/sensor_01");
        assert_eq!(reading.field(Field::Temperature).unwrap().unit, "°C");
        assert_eq!(reading.field(Field::Humidity).unwrap().value, 72.94);
        assert_eq!(reading.quality, Quality::Good);
    }

    #[tokio::test]
    async fn test_payload_timestamp_is_used() {
        let store = Arc::new(MemoryStore::new());
        let payload = br#"{"T": "21.00 C", "date time": "2024-03-01 08:00:00"}"#;
        ingestor(store.clone()).handle("TEMP/SUB/dev1", payload).await;

        let readings = stored(&store, "dev1").await;
        assert_eq!(readings[0].timestamp.to_rfc3339(), "2024-03-01T08:00:00+00:00");
        assert!(readings[0].received_at > readings[0].timestamp);
    }

    #[tokio::test]
    async fn test_undecodable_payloads_dropped() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(store.clone());

        assert_eq!(
            ingestor.handle("TEMP/SUB/sensor_01", b"no numbers here").await,
            IngestOutcome::Dropped(DropReason::Parse)
        );
        assert_eq!(
            ingestor.handle("TEMP/SUB/sensor_01", br#"{"status": "ok"}"#).await,
            IngestOutcome::Dropped(DropReason::Validation)
        );
        assert_eq!(
            ingestor.handle("TEMP/SUB/", br#"{"temperature": 20}"#).await,
            IngestOutcome::Dropped(DropReason::InvalidTopic)
        );
        assert_eq!(store.insert_attempts(), 0);
        assert_eq!(store.hot_len(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_inserts(1);

        let outcome = ingestor(store.clone())
            .handle("TEMP/SUB/sensor_01", br#"{"temperature": 20.5}"#)
            .await;

        assert!(matches!(outcome, IngestOutcome::Stored(_)));
        assert_eq!(store.insert_attempts(), 2);
        assert_eq!(stored(&store, "sensor_01").await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_and_continue() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor(store.clone());
        store.fail_next_inserts(3);

        let failures_before = INGEST_FAILURES_TOTAL.get();
        assert_eq!(
            ingestor
                .handle("TEMP/SUB/sensor_01", br#"{"temperature": 20.5}"#)
                .await,
            IngestOutcome::Dropped(DropReason::Storage)
        );
        assert_eq!(store.insert_attempts(), 3);
        assert!(INGEST_FAILURES_TOTAL.get() > failures_before);

        // The next message goes through normally.
        assert!(matches!(
            ingestor
                .handle("TEMP/SUB/sensor_01", br#"{"temperature": 21.5}"#)
                .await,
            IngestOutcome::Stored(_)
        ));
        assert_eq!(store.hot_len(), 1);
    }

    #[tokio::test]
    async fn test_legacy_plaintext_payload() {
        let store = Arc::new(MemoryStore::new());
        ingestor(store.clone())
            .handle("TEMP/SUB/legacy1", b"25.3,48.1")
            .await;

        let readings = stored(&store, "legacy1").await;
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].quality, Quality::Legacy);
        assert_eq!(readings[0].field(Field::Humidity).unwrap().value, 48.1);
    }

    #[tokio::test]
    async fn test_legacy_plaintext_rejected_when_disabled() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = Ingestor::new(
            store.clone(),
            DecodeOptions {
                legacy_positional: false,
            },
            fast_retry(),
        );
        assert_eq!(
            ingestor.handle("TEMP/SUB/legacy1", b"25.3,48.1").await,
            IngestOutcome::Dropped(DropReason::Parse)
        );
    }
}

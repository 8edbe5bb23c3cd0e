//! Read-side operations shared by every HTTP route.

use crate::metrics::QUERY_LATENCY_SECONDS;
use crate::model::{Reading, StoreHealth};
use crate::store::{ReadingFilter, ReadingStore, StoreError, Window};
use crate::validate::is_placeholder_id;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PAGE_SIZE: u64 = 50;
pub const MAX_PAGE_SIZE: u64 = 10_000;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    InvalidParameter(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// 1-based page request after defaults and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u64,
    pub page_size: u64,
}

impl Page {
    /// Missing or zero values fall back to defaults; `page_size` is clamped to `max_page_size`.
    pub fn normalize(page: Option<u64>, page_size: Option<u64>, max_page_size: u64) -> Self {
        let page = page.filter(|p| *p > 0).unwrap_or(DEFAULT_PAGE);
        let page_size = page_size
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(max_page_size.max(1));
        Self { page, page_size }
    }

    pub fn window(&self) -> Window {
        Window {
            offset: (self.page - 1).saturating_mul(self.page_size),
            limit: self.page_size,
        }
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn ReadingStore>,
    max_page_size: u64,
    timeout: Duration,
}

impl QueryService {
    pub fn new(store: Arc<dyn ReadingStore>, max_page_size: u64, timeout: Duration) -> Self {
        Self {
            store,
            max_page_size: max_page_size.max(1),
            timeout,
        }
    }

    pub fn page(&self, page: Option<u64>, page_size: Option<u64>) -> Page {
        Page::normalize(page, page_size, self.max_page_size)
    }

    /// Readings for one sensor with `start <= timestamp <= end`, newest first.
    pub async fn list(
        &self,
        sensor_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        page: Page,
    ) -> Result<Vec<Reading>, QueryError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(QueryError::InvalidParameter(
                    "start must not be after end".to_string(),
                ));
            }
        }

        let filter = ReadingFilter {
            sensor_id: Some(sensor_id.to_string()),
            start,
            end,
        };
        self.timed("list", self.store.find_readings(&filter, page.window()))
            .await
    }

    /// Readings across all sensors, newest first.
    pub async fn list_all(&self, page: Page) -> Result<Vec<Reading>, QueryError> {
        self.timed(
            "list_all",
            self.store.find_readings(&ReadingFilter::default(), page.window()),
        )
        .await
    }

    pub async fn latest(&self, sensor_id: &str) -> Result<Option<Reading>, QueryError> {
        self.timed("latest", self.store.latest_reading(sensor_id))
            .await
    }

    /// Known sensor ids, from master records when any exist, otherwise from readings.
    pub async fn sensors(&self) -> Result<Vec<String>, QueryError> {
        let store = self.store.clone();
        let ids = self
            .timed("sensors", async move {
                let master = store.sensors().await?;
                if master.is_empty() {
                    store.distinct_sensor_ids().await
                } else {
                    Ok(master.into_iter().map(|s| s.sensor_id).collect())
                }
            })
            .await?;

        let cleaned: BTreeSet<String> = ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !is_placeholder_id(id) && !id.chars().any(char::is_control))
            .collect();
        Ok(cleaned.into_iter().collect())
    }

    pub async fn health(&self) -> Result<StoreHealth, QueryError> {
        let store = self.store.clone();
        self.timed("health", async move {
            store.ping().await?;
            let total_documents = store.count_readings().await?;
            let latest_document = store
                .find_readings(&ReadingFilter::default(), Window { offset: 0, limit: 1 })
                .await?
                .into_iter()
                .next();
            Ok::<_, StoreError>(StoreHealth {
                status: "connected",
                backend: store.backend_name(),
                total_documents,
                latest_document,
            })
        })
        .await
    }

    /// Runs a storage call under the per-request timeout. On timeout the storage future is
    /// dropped, which cancels the underlying query.
    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T, QueryError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, fut).await;
        QUERY_LATENCY_SECONDS
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(inner) => inner.map_err(QueryError::from),
            Err(_) => Err(QueryError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, Measurement, Quality, Sensor, SensorStatus};
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn reading_at(sensor_id: &str, timestamp: DateTime<Utc>) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            sensor_id: sensor_id.to_string(),
            timestamp,
            fields: BTreeMap::from([
                (Field::Temperature, Measurement::new(29.42, "°C")),
                (Field::Humidity, Measurement::new(72.94, "%")),
            ]),
            topic: format!("TEMP/SUB/{}", sensor_id),
            raw: br#"{"temperature": 29.42, "humidity": 72.94}"#.to_vec(),
            quality: Quality::Good,
            received_at: timestamp,
        }
    }

    fn service(store: Arc<MemoryStore>) -> QueryService {
        QueryService::new(store, MAX_PAGE_SIZE, Duration::from_secs(5))
    }

    async fn seed(store: &MemoryStore, sensor_id: &str, count: i64, t0: DateTime<Utc>) {
        for i in 0..count {
            store
                .insert_reading(&reading_at(sensor_id, t0 - ChronoDuration::minutes(i)))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_page_normalize() {
        assert_eq!(
            Page::normalize(None, None, MAX_PAGE_SIZE),
            Page { page: 1, page_size: 50 }
        );
        assert_eq!(
            Page::normalize(Some(0), Some(0), MAX_PAGE_SIZE),
            Page { page: 1, page_size: 50 }
        );
        assert_eq!(
            Page::normalize(Some(3), Some(1_000_000), MAX_PAGE_SIZE),
            Page { page: 3, page_size: MAX_PAGE_SIZE }
        );
        assert_eq!(
            Page { page: 2, page_size: 10 }.window(),
            Window { offset: 10, limit: 10 }
        );
    }

    #[tokio::test]
    async fn test_round_trip_by_time_range() {
        let store = Arc::new(MemoryStore::new());
        let t = Utc::now();
        store.insert_reading(&reading_at("sensor_01", t)).await.unwrap();
        let service = service(store);
        let page = service.page(None, None);

        let inside = service
            .list(
                "sensor_01",
                Some(t - ChronoDuration::hours(1)),
                Some(t + ChronoDuration::hours(1)),
                page,
            )
            .await
            .unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].field(Field::Temperature).unwrap().value, 29.42);

        let before = service
            .list(
                "sensor_01",
                Some(t - ChronoDuration::hours(3)),
                Some(t - ChronoDuration::hours(2)),
                page,
            )
            .await
            .unwrap();
        let after = service
            .list(
                "sensor_01",
                Some(t + ChronoDuration::hours(2)),
                Some(t + ChronoDuration::hours(3)),
                page,
            )
            .await
            .unwrap();
        assert!(before.is_empty());
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_bounds_are_inclusive() {
        let store = Arc::new(MemoryStore::new());
        let t = Utc::now();
        store.insert_reading(&reading_at("s1", t)).await.unwrap();
        let service = service(store);

        let found = service
            .list("s1", Some(t), Some(t), service.page(None, None))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        seed(&store, "sensor_01", 25, t0).await;
        let service = service(store);

        let page2 = service
            .list("sensor_01", None, None, service.page(Some(2), Some(10)))
            .await
            .unwrap();
        assert_eq!(page2.len(), 10);
        // Ranks 11..=20 newest first are t0-10min ..= t0-19min.
        assert_eq!(page2[0].timestamp, t0 - ChronoDuration::minutes(10));
        assert_eq!(page2[9].timestamp, t0 - ChronoDuration::minutes(19));

        let page3 = service
            .list("sensor_01", None, None, service.page(Some(3), Some(10)))
            .await
            .unwrap();
        assert_eq!(page3.len(), 5);

        let page10 = service
            .list("sensor_01", None, None, service.page(Some(10), Some(10)))
            .await
            .unwrap();
        assert!(page10.is_empty());
    }

    #[tokio::test]
    async fn test_latest_matches_first_of_list() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        seed(&store, "sensor_01", 5, t0).await;
        // Out-of-order arrival of a newer reading.
        store
            .insert_reading(&reading_at("sensor_01", t0 + ChronoDuration::seconds(30)))
            .await
            .unwrap();
        let service = service(store);

        let latest = service.latest("sensor_01").await.unwrap().unwrap();
        let first = service
            .list("sensor_01", None, None, service.page(Some(1), Some(1)))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(latest, first[0]);
        assert_eq!(latest.timestamp, t0 + ChronoDuration::seconds(30));

        assert!(service.latest("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_after_end_rejected() {
        let service = service(Arc::new(MemoryStore::new()));
        let t = Utc::now();
        let err = service
            .list(
                "s1",
                Some(t),
                Some(t - ChronoDuration::hours(1)),
                service.page(None, None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_sensors_derived_from_readings() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        seed(&store, "b_sensor", 2, t0).await;
        seed(&store, "a_sensor", 1, t0).await;
        seed(&store, "unknown", 1, t0).await;
        let service = service(store);

        assert_eq!(
            service.sensors().await.unwrap(),
            vec!["a_sensor".to_string(), "b_sensor".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sensors_prefer_master_records() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "from_readings", 1, Utc::now()).await;
        store
            .upsert_sensor(Sensor {
                sensor_id: "provisioned".to_string(),
                capabilities: vec![Field::Bpm, Field::Spo2],
                location: serde_json::json!({"site": "ward-3"}),
                thresholds: BTreeMap::new(),
                status: SensorStatus::Active,
            })
            .unwrap();
        let service = service(store);

        assert_eq!(service.sensors().await.unwrap(), vec!["provisioned".to_string()]);
    }

    #[tokio::test]
    async fn test_health_reports_latest() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        seed(&store, "s1", 3, t0).await;
        let health = service(store).health().await.unwrap();
        assert_eq!(health.total_documents, 3);
        assert_eq!(health.backend, "memory");
        assert_eq!(health.latest_document.unwrap().timestamp, t0);
    }

    #[tokio::test]
    async fn test_timeout_cancels_slow_call() {
        let service = service(Arc::new(MemoryStore::new()));
        let short = QueryService {
            timeout: Duration::from_millis(10),
            ..service
        };
        let result: Result<(), QueryError> = short
            .timed("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(QueryError::Timeout(_))));
    }
}

use super::{ArchiveReport, ReadingFilter, ReadingStore, StoreError, Window};
use crate::errors;
use crate::model::{Field, Measurement, Quality, Reading, Sensor, SensorStatus, Threshold};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Rows deleted per statement by the expiry sweep.
const EXPIRE_BATCH: i64 = 5000;

const READING_COLUMNS: &str = "id, sensor_id, ts, fields, topic, raw, quality, received_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: Uuid,
    sensor_id: String,
    ts: DateTime<Utc>,
    fields: Json<BTreeMap<Field, Measurement>>,
    topic: String,
    raw: Vec<u8>,
    quality: String,
    received_at: DateTime<Utc>,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Reading {
            id: row.id,
            sensor_id: row.sensor_id,
            timestamp: row.ts,
            fields: row.fields.0,
            topic: row.topic,
            raw: row.raw,
            quality: Quality::parse(&row.quality),
            received_at: row.received_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    sensor_id: String,
    capabilities: Vec<String>,
    location: serde_json::Value,
    thresholds: serde_json::Value,
    status: String,
}

impl From<SensorRow> for Sensor {
    fn from(row: SensorRow) -> Self {
        let thresholds: BTreeMap<Field, Threshold> =
            serde_json::from_value(row.thresholds).unwrap_or_else(|e| {
                warn!(sensor = %row.sensor_id, error = %e, "ignoring malformed sensor thresholds");
                BTreeMap::new()
            });
        Sensor {
            capabilities: row
                .capabilities
                .iter()
                .filter_map(|c| Field::parse(c))
                .collect(),
            location: row.location,
            thresholds,
            status: if row.status == "inactive" {
                SensorStatus::Inactive
            } else {
                SensorStatus::Active
            },
            sensor_id: row.sensor_id,
        }
    }
}

impl PgStore {
    /// Opens a pool and, when asked, brings the schema up to date.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        run_migrations: bool,
    ) -> errors::Result<Self> {
        info!(max_connections, "Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::from)?;

        info!("Database connection established");
        if run_migrations {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Migrations completed");
        }

        Ok(Self { pool })
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl ReadingStore for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO readings (id, sensor_id, ts, fields, topic, raw, quality, received_at, location)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8,
                    (SELECT location FROM sensors WHERE sensor_id = $2))
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(reading.id)
        .bind(&reading.sensor_id)
        .bind(reading.timestamp)
        .bind(Json(&reading.fields))
        .bind(&reading.topic)
        .bind(&reading.raw)
        .bind(reading.quality.as_str())
        .bind(reading.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_readings(
        &self,
        filter: &ReadingFilter,
        window: Window,
    ) -> Result<Vec<Reading>, StoreError> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM readings WHERE TRUE", READING_COLUMNS));

        if let Some(sensor_id) = &filter.sensor_id {
            query.push(" AND sensor_id = ").push_bind(sensor_id);
        }
        if let Some(start) = filter.start {
            query.push(" AND ts >= ").push_bind(start);
        }
        if let Some(end) = filter.end {
            query.push(" AND ts <= ").push_bind(end);
        }

        query
            .push(" ORDER BY ts DESC, id DESC LIMIT ")
            .push_bind(to_i64(window.limit))
            .push(" OFFSET ")
            .push_bind(to_i64(window.offset));

        let rows = query
            .build_query_as::<ReadingRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Reading::from).collect())
    }

    async fn latest_reading(&self, sensor_id: &str) -> Result<Option<Reading>, StoreError> {
        let row = sqlx::query_as::<_, ReadingRow>(&format!(
            "SELECT {} FROM readings WHERE sensor_id = $1 ORDER BY ts DESC, id DESC LIMIT 1",
            READING_COLUMNS
        ))
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Reading::from))
    }

    async fn count_readings(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        let rows = sqlx::query_as::<_, SensorRow>(
            r#"
            SELECT sensor_id, capabilities, location, thresholds, status
            FROM sensors
            ORDER BY sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    async fn distinct_sensor_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT sensor_id FROM readings ORDER BY sensor_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut total = 0;
        // Bounded statements so no single delete holds locks for long.
        loop {
            let deleted = sqlx::query(
                r#"
                DELETE FROM readings
                WHERE id IN (SELECT id FROM readings WHERE ts < $1 LIMIT $2)
                "#,
            )
            .bind(cutoff)
            .bind(EXPIRE_BATCH)
            .execute(&self.pool)
            .await?
            .rows_affected();

            total += deleted;
            if deleted < EXPIRE_BATCH as u64 {
                return Ok(total);
            }
        }
    }

    async fn archive_batch(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<ArchiveReport, StoreError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM readings WHERE ts < $1 ORDER BY ts, id LIMIT $2")
                .bind(cutoff)
                .bind(to_i64(batch_size as u64))
                .fetch_all(&self.pool)
                .await?;

        if ids.is_empty() {
            return Ok(ArchiveReport::default());
        }

        let copied = sqlx::query(
            r#"
            INSERT INTO readings_archive
                (id, sensor_id, ts, fields, topic, raw, quality, received_at, location)
            SELECT id, sensor_id, ts, fields, topic, raw, quality, received_at, location
            FROM readings
            WHERE id = ANY($1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let deleted = sqlx::query(
            r#"
            DELETE FROM readings
            WHERE id = ANY($1)
              AND id IN (SELECT id FROM readings_archive WHERE id = ANY($1))
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(ArchiveReport { copied, deleted })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

//! Storage layer.
//!
//! Hot readings, the cold archive and the sensor master records sit behind [`ReadingStore`].
//! Ingestion only inserts, queries only read, and the lifecycle sweeps only delete or move.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::model::{Reading, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Network, timeout or pool exhaustion. Worth retrying.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_error(&err) {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-class SQLSTATEs
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" || // too_many_connections
                code == "40001" // serialization_failure
            })
        }
        _ => false,
    }
}

/// Filter for reading lookups. Both bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub sensor_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ReadingFilter {
    pub fn for_sensor(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: Some(sensor_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, reading: &Reading) -> bool {
        self.sensor_id
            .as_deref()
            .map_or(true, |id| reading.sensor_id == id)
            && self.start.map_or(true, |start| reading.timestamp >= start)
            && self.end.map_or(true, |end| reading.timestamp <= end)
    }
}

/// Offset/limit window over a newest-first result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Rows newly written to the archive.
    pub copied: u64,
    /// Rows removed from the hot collection.
    pub deleted: u64,
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Inserts a reading. Inserting the same `id` twice stores it once.
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError>;

    /// Readings matching `filter`, newest first, sliced by `window`.
    async fn find_readings(
        &self,
        filter: &ReadingFilter,
        window: Window,
    ) -> Result<Vec<Reading>, StoreError>;

    async fn latest_reading(&self, sensor_id: &str) -> Result<Option<Reading>, StoreError>;

    async fn count_readings(&self) -> Result<u64, StoreError>;

    /// Master sensor records, ordered by id.
    async fn sensors(&self) -> Result<Vec<Sensor>, StoreError>;

    /// Distinct sensor ids over hot readings, ordered.
    async fn distinct_sensor_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Deletes hot readings with `timestamp < cutoff`. Returns the number removed.
    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Moves up to `batch_size` hot readings with `timestamp < cutoff` into the archive.
    ///
    /// Copy and delete are separate steps. Rows already present in the archive (by id) are not
    /// copied again but are still deleted from the hot collection, so a call after an
    /// interrupted run finishes the move.
    async fn archive_batch(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<ArchiveReport, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Releases the underlying connections.
    async fn close(&self);
}

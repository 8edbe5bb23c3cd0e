use super::{ArchiveReport, ReadingFilter, ReadingStore, StoreError, Window};
use crate::model::{Reading, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Collections {
    hot: HashMap<Uuid, Reading>,
    archive: HashMap<Uuid, Reading>,
    sensors: BTreeMap<String, Sensor>,
}

/// In-process store with the same semantics as [`super::PgStore`].
///
/// Supports injected transient failures so retry and re-run paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
    failing_inserts: AtomicUsize,
    insert_attempts: AtomicUsize,
    interrupt_archive: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` inserts fail with a transient error before touching data.
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Total insert calls seen, including failed ones.
    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// The next archive batch stops after its copy step, as a crash would.
    pub fn interrupt_next_archive(&self) {
        self.interrupt_archive.store(true, Ordering::SeqCst);
    }

    pub fn upsert_sensor(&self, sensor: Sensor) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.sensors.insert(sensor.sensor_id.clone(), sensor);
        Ok(())
    }

    pub fn hot_len(&self) -> usize {
        self.read().map(|c| c.hot.len()).unwrap_or_default()
    }

    pub fn archived(&self) -> Vec<Reading> {
        self.read()
            .map(|c| c.archive.values().cloned().collect())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Collections>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Collections>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

/// Newest first; ties broken by id so paging is stable.
fn sort_newest_first(readings: &mut [Reading]) {
    readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
}

#[async_trait]
impl ReadingStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected insert failure".to_string()));
        }

        let mut inner = self.write()?;
        inner
            .hot
            .entry(reading.id)
            .or_insert_with(|| reading.clone());
        Ok(())
    }

    async fn find_readings(
        &self,
        filter: &ReadingFilter,
        window: Window,
    ) -> Result<Vec<Reading>, StoreError> {
        let mut matching: Vec<Reading> = {
            let inner = self.read()?;
            inner
                .hot
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect()
        };
        sort_newest_first(&mut matching);

        Ok(matching
            .into_iter()
            .skip(usize::try_from(window.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(window.limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn latest_reading(&self, sensor_id: &str) -> Result<Option<Reading>, StoreError> {
        let filter = ReadingFilter::for_sensor(sensor_id);
        let window = Window {
            offset: 0,
            limit: 1,
        };
        Ok(self.find_readings(&filter, window).await?.into_iter().next())
    }

    async fn count_readings(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.hot.len() as u64)
    }

    async fn sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        Ok(self.read()?.sensors.values().cloned().collect())
    }

    async fn distinct_sensor_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids: BTreeSet<String> = self
            .read()?
            .hot
            .values()
            .map(|r| r.sensor_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let before = inner.hot.len();
        inner.hot.retain(|_, r| r.timestamp >= cutoff);
        Ok((before - inner.hot.len()) as u64)
    }

    async fn archive_batch(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<ArchiveReport, StoreError> {
        let mut report = ArchiveReport::default();

        // Copy step
        let batch: Vec<Uuid> = {
            let mut inner = self.write()?;
            let mut due: Vec<Reading> = inner
                .hot
                .values()
                .filter(|r| r.timestamp < cutoff)
                .cloned()
                .collect();
            due.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            due.truncate(batch_size);

            let mut ids = Vec::with_capacity(due.len());
            for reading in due {
                ids.push(reading.id);
                if !inner.archive.contains_key(&reading.id) {
                    inner.archive.insert(reading.id, reading);
                    report.copied += 1;
                }
            }
            ids
        };

        if self.interrupt_archive.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Transient(
                "archive interrupted between copy and delete".to_string(),
            ));
        }

        // Delete step: only rows confirmed present in the archive.
        let mut inner = self.write()?;
        for id in batch {
            if inner.archive.contains_key(&id) && inner.hot.remove(&id).is_some() {
                report.deleted += 1;
            }
        }

        Ok(report)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.read().map(|_| ())
    }

    async fn close(&self) {}
}

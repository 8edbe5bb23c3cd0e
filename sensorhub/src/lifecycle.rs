//! Background lifecycle: TTL expiry and archival of hot readings.
//!
//! Both jobs run on their own ticker against their own store handle (normally a separate
//! small pool) and issue short autocommit statements, so interrupting them at any point
//! leaves at worst a reading present in both the hot and archive collections. The next
//! archival run finishes such moves.

use crate::metrics::{READINGS_ARCHIVED_TOTAL, READINGS_EXPIRED_TOTAL};
use crate::store::{ArchiveReport, ReadingStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// `None` disables the expiry sweep.
    pub retention: Option<ChronoDuration>,
    pub ttl_interval: Duration,
    /// `None` disables archival.
    pub archive_after: Option<ChronoDuration>,
    pub archive_interval: Duration,
    pub archive_batch_size: usize,
}

/// Removes hot readings with a timestamp before `cutoff`.
pub async fn sweep_expired(
    store: &dyn ReadingStore,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let expired = store.expire_before(cutoff).await?;
    if expired > 0 {
        READINGS_EXPIRED_TOTAL.inc_by(expired);
        info!(expired, cutoff = %cutoff, "Expired readings past retention");
    } else {
        debug!(cutoff = %cutoff, "Nothing to expire");
    }
    Ok(expired)
}

/// Moves every hot reading older than `cutoff` to the archive, batch by batch.
///
/// Safe to re-run after an interruption: archived rows are matched by id and skipped, and
/// only their hot copies are deleted.
pub async fn archive_older_than(
    store: &dyn ReadingStore,
    cutoff: DateTime<Utc>,
    batch_size: usize,
    shutdown: &CancellationToken,
) -> Result<ArchiveReport, StoreError> {
    let mut total = ArchiveReport::default();

    while !shutdown.is_cancelled() {
        let batch = store.archive_batch(cutoff, batch_size).await?;
        total.copied += batch.copied;
        total.deleted += batch.deleted;
        READINGS_ARCHIVED_TOTAL.inc_by(batch.deleted);

        if batch.copied != batch.deleted {
            // Either earlier interrupted moves being finished, or rows that could not be
            // removed from the hot collection yet.
            warn!(
                copied = batch.copied,
                deleted = batch.deleted,
                "Archive batch copy/delete counts differ"
            );
        }
        if batch.deleted == 0 {
            break;
        }
    }

    if total.deleted > 0 {
        info!(
            copied = total.copied,
            deleted = total.deleted,
            cutoff = %cutoff,
            "Archived readings"
        );
    }
    Ok(total)
}

/// Spawns the expiry and archival jobs. Returns their handles; both exit on `shutdown`.
pub fn spawn_lifecycle(
    store: Arc<dyn ReadingStore>,
    settings: LifecycleSettings,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let LifecycleSettings {
        retention,
        ttl_interval,
        archive_after,
        archive_interval,
        archive_batch_size,
    } = settings;

    if let Some(retention) = retention {
        let store = store.clone();
        let shutdown = shutdown.clone();
        info!(
            retention_days = retention.num_days(),
            "Starting expiry sweep every {:?}", ttl_interval
        );
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = sweep_expired(store.as_ref(), Utc::now() - retention).await {
                    warn!("Expiry sweep failed, retrying next tick: {}", e);
                }
            }
            debug!("Expiry sweep stopped");
        }));
    }

    if let Some(archive_after) = archive_after {
        info!(
            archive_after_days = archive_after.num_days(),
            "Starting archival every {:?}", archive_interval
        );
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(archive_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let cutoff = Utc::now() - archive_after;
                if let Err(e) = archive_older_than(
                    store.as_ref(),
                    cutoff,
                    archive_batch_size,
                    &shutdown,
                )
                .await
                {
                    warn!("Archival failed, will resume next run: {}", e);
                }
            }
            debug!("Archival stopped");
        }));
    }

    handles
}

//! Periodic downsampling by age band (spec §4.11, C11).
//!
//! Runs on its own slow timer, independent of the Flusher (spec §5: "a
//! second background task (optional) runs the Compactor"). Delegates
//! the actual merge-then-delete SQL to the storage adapter via
//! `compact_bucket_band`, since only the adapter knows how to express
//! the coarser-boundary alignment check for its dialect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::storage::StorageAdapter;

/// One age band: rows with age in `[min_age_secs, max_age_secs)` (the
/// last band's `max_age_secs` is `None`, i.e. unbounded) get rolled up
/// to `resolution_secs`.
struct AgeBand {
    min_age_secs: i64,
    max_age_secs: Option<i64>,
    resolution_secs: i64,
}

fn age_bands(retention: &crate::config::RetentionConfig) -> Vec<AgeBand> {
    vec![
        AgeBand {
            min_age_secs: 0,
            max_age_secs: Some(retention.minute_band_secs as i64),
            resolution_secs: 60,
        },
        AgeBand {
            min_age_secs: retention.minute_band_secs as i64,
            max_age_secs: Some(retention.five_minute_band_secs as i64),
            resolution_secs: 300,
        },
        AgeBand {
            min_age_secs: retention.five_minute_band_secs as i64,
            max_age_secs: Some(retention.hour_band_secs as i64),
            resolution_secs: 3600,
        },
        AgeBand {
            min_age_secs: retention.hour_band_secs as i64,
            max_age_secs: Some(retention.day_band_secs as i64),
            resolution_secs: 86_400,
        },
        AgeBand {
            min_age_secs: retention.day_band_secs as i64,
            max_age_secs: None,
            resolution_secs: 7 * 86_400,
        },
    ]
}

pub struct Compactor {
    storage: Arc<dyn StorageAdapter>,
    config: Config,
    stop_notify: Arc<Notify>,
    started: AtomicBool,
}

impl Compactor {
    pub fn new(storage: Arc<dyn StorageAdapter>, config: Config) -> Self {
        Self {
            storage,
            config,
            stop_notify: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            panic!("Compactor::start called twice on the same instance");
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop().await })
    }

    async fn run_loop(self: Arc<Self>) {
        let interval = self.config.compaction_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.stop_notify.notified() => return,
            }
            if self.config.compaction_enabled {
                self.compact_once().await;
            }
        }
    }

    pub fn stop(&self) {
        self.stop_notify.notify_one();
    }

    /// Runs every age band once. Idempotent: a row already aligned to
    /// its band's boundary is left untouched by `compact_bucket_band`.
    ///
    /// A band's age range `[min_age_secs, max_age_secs)` maps to the
    /// timestamp range `range_start..range_end` where `range_end = now -
    /// min_age_secs` and `range_start = now - max_age_secs` (`None` when
    /// the band is unbounded on the old end).
    pub async fn compact_once(&self) {
        let now = Utc::now();
        for band in age_bands(&self.config.retention) {
            let range_end = now - chrono::Duration::seconds(band.min_age_secs);
            let range_start = band
                .max_age_secs
                .map(|secs| now - chrono::Duration::seconds(secs));

            match self
                .storage
                .compact_bucket_band(range_start, range_end, band.resolution_secs)
                .await
            {
                Ok(merged) if merged > 0 => {
                    tracing::info!(merged, resolution_secs = band.resolution_secs, "compacted buckets");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "compaction band failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_bands_cover_from_zero_to_unbounded() {
        let retention = crate::config::RetentionConfig::default();
        let bands = age_bands(&retention);
        assert_eq!(bands.len(), 5);
        assert_eq!(bands[0].min_age_secs, 0);
        assert!(bands.last().unwrap().max_age_secs.is_none());
    }
}

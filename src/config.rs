//! Resolved configuration for the core.
//!
//! The host application is responsible for sourcing these values (TOML
//! file, environment, framework initializer DSL — whatever it already
//! uses); this crate only consumes the resolved [`Config`]. Every field
//! has the default from spec §6 so a host can override a handful of
//! options and leave the rest alone, the same way the teacher's
//! `RuntimeConfig`/`ReasonerConfig` layer defaults under `#[serde(default
//! = "...")]`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub flush_interval_secs: u64,
    pub flush_jitter_fraction: f64,
    pub flush_timeout_secs: u64,

    pub max_buffer_memory_bytes: usize,
    pub hard_cap_multiplier: usize,

    pub slow_threshold_per_kind: SlowThresholds,
    pub samples_per_bucket: SampleCaps,
    pub error_contexts_per_record: usize,
    pub events_max_samples_per_name: usize,
    pub persistence_batch_size: usize,

    /// Ingestion-boundary string cap (spec §6): any collaborator-supplied
    /// string over this many bytes is truncated before it enters an
    /// `Event`.
    pub max_string_bytes: usize,
    /// Ingestion-boundary metadata cap (spec §6): a `metadata` map with
    /// more keys than this keeps only the first `max_metadata_keys`.
    pub max_metadata_keys: usize,

    pub circuit_failure_threshold: u32,
    pub circuit_cool_off_secs: u64,

    pub ignored_targets: Vec<String>,
    pub instrument_segments: bool,
    pub events_enabled: bool,
    pub segment_source_threshold_ms: f64,

    pub compaction_enabled: bool,
    pub compaction_interval_secs: u64,
    pub retention: RetentionConfig,

    pub sqlite_busy_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: 30,
            flush_jitter_fraction: 0.25,
            flush_timeout_secs: 10,
            max_buffer_memory_bytes: 32 * 1024 * 1024,
            hard_cap_multiplier: 3,
            slow_threshold_per_kind: SlowThresholds::default(),
            samples_per_bucket: SampleCaps::default(),
            error_contexts_per_record: 10,
            events_max_samples_per_name: 100,
            persistence_batch_size: 500,
            max_string_bytes: 8192,
            max_metadata_keys: 64,
            circuit_failure_threshold: 5,
            circuit_cool_off_secs: 60,
            ignored_targets: Vec::new(),
            instrument_segments: true,
            events_enabled: false,
            segment_source_threshold_ms: 0.0,
            compaction_enabled: true,
            compaction_interval_secs: 3600,
            retention: RetentionConfig::default(),
            sqlite_busy_timeout_secs: 5,
        }
    }
}

impl Config {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn circuit_cool_off(&self) -> Duration {
        Duration::from_secs(self.circuit_cool_off_secs)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }

    pub fn max_buffer_bytes_hard(&self) -> usize {
        self.max_buffer_memory_bytes
            .saturating_mul(self.hard_cap_multiplier)
    }

    /// Rejects configuration combinations that can never do useful work.
    /// Returns a [`CoreError::ConfigurationError`] rather than panicking —
    /// per spec §7, the host is told once and the core disables itself.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.flush_interval_secs == 0 {
            return Err(CoreError::ConfigurationError(
                "flush_interval must be > 0".into(),
            ));
        }
        if self.max_buffer_memory_bytes == 0 {
            return Err(CoreError::ConfigurationError(
                "max_buffer_memory must be > 0".into(),
            ));
        }
        if self.hard_cap_multiplier == 0 {
            return Err(CoreError::ConfigurationError(
                "hard_cap_multiplier must be > 0".into(),
            ));
        }
        let caps = &self.samples_per_bucket;
        if caps.slow + caps.random + caps.error == 0 {
            return Err(CoreError::ConfigurationError(
                "samples_per_bucket must allow at least one sample".into(),
            ));
        }
        if self.max_string_bytes == 0 {
            return Err(CoreError::ConfigurationError(
                "max_string_bytes must be > 0".into(),
            ));
        }
        if self.max_metadata_keys == 0 {
            return Err(CoreError::ConfigurationError(
                "max_metadata_keys must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Slow threshold in milliseconds for a given ingestion kind.
    pub fn slow_threshold_ms(&self, kind: crate::event::Kind) -> f64 {
        match kind {
            crate::event::Kind::Http => self.slow_threshold_per_kind.http,
            crate::event::Kind::Job => self.slow_threshold_per_kind.job,
            crate::event::Kind::Custom => self.slow_threshold_per_kind.custom,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlowThresholds {
    pub http: f64,
    pub job: f64,
    pub custom: f64,
}

impl Default for SlowThresholds {
    fn default() -> Self {
        Self {
            http: 500.0,
            job: 5000.0,
            custom: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SampleCaps {
    pub slow: usize,
    pub random: usize,
    pub error: usize,
}

impl Default for SampleCaps {
    fn default() -> Self {
        Self {
            slow: 3,
            random: 1,
            error: 3,
        }
    }
}

impl SampleCaps {
    pub fn total(&self) -> usize {
        self.slow + self.random + self.error
    }
}

/// Age-band → resolution table, plus per-resolution occurrence-histogram
/// retention windows (spec §4.11).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub minute_band_secs: u64,
    pub five_minute_band_secs: u64,
    pub hour_band_secs: u64,
    pub day_band_secs: u64,

    pub minute_histogram_retention_secs: u64,
    pub hour_histogram_retention_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            minute_band_secs: 3600,
            five_minute_band_secs: 86_400,
            hour_band_secs: 7 * 86_400,
            day_band_secs: 90 * 86_400,
            minute_histogram_retention_secs: 86_400,
            hour_histogram_retention_secs: 30 * 86_400,
        }
    }
}

/// Numeric metadata map carried on events; non-numeric entries are
/// dropped at ingestion (spec §9) before this type is ever populated.
pub type MetadataMap = HashMap<String, f64>;

/// Truncates `s` to at most `max_bytes`, never splitting a UTF-8
/// character (spec §6 ingestion boundary).
pub fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Keeps at most `max_keys` entries of `map` (spec §6 "over-limit
/// metadata maps keep the first K keys").
pub fn truncate_metadata(mut map: MetadataMap, max_keys: usize) -> MetadataMap {
    if map.len() <= max_keys {
        return map;
    }
    let keep: Vec<String> = map.keys().take(max_keys).cloned().collect();
    map.retain(|k, _| keep.contains(k));
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_respects_utf8_boundaries() {
        let s = "héllo"; // 'é' is 2 bytes, so byte offset 2 lands mid-character
        let truncated = truncate_str(s, 2);
        assert!(truncated.is_char_boundary(truncated.len()));
        assert!(truncated.len() <= 2);
    }

    #[test]
    fn truncate_metadata_caps_key_count() {
        let map: MetadataMap = (0..10).map(|i| (i.to_string(), i as f64)).collect();
        let truncated = truncate_metadata(map, 3);
        assert_eq!(truncated.len(), 3);
    }
}

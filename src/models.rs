//! Persisted aggregate shapes (spec §3).
//!
//! These mirror the `buckets`/`samples`/`errors`/`event_buckets`/
//! `event_samples` tables in §6 one-to-one; the storage adapter is the
//! only thing that knows how to turn them into SQL.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Kind;
use crate::tdigest::TDigest;

/// Identity = (kind, target, operation, bucket_start).
#[derive(Debug, Clone)]
pub struct BucketKey {
    pub kind: Kind,
    pub target: String,
    pub operation: String,
    pub bucket_start: DateTime<Utc>,
}

/// In-memory accumulator built by the aggregator for one drain; merged
/// into the persisted `Bucket` row by the storage adapter.
#[derive(Debug, Clone)]
pub struct BucketAccumulator {
    pub key: BucketKey,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub duration_sum: f64,
    pub duration_max: f64,
    pub duration_min: f64,
    pub metadata_sum: HashMap<String, f64>,
    pub digest: TDigest,
}

impl BucketAccumulator {
    pub fn new(key: BucketKey, compression: f64) -> Self {
        Self {
            key,
            count: 0,
            success_count: 0,
            failure_count: 0,
            duration_sum: 0.0,
            duration_max: f64::NEG_INFINITY,
            duration_min: f64::INFINITY,
            metadata_sum: HashMap::new(),
            digest: TDigest::new(compression),
        }
    }
}

/// One persisted aggregate row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub kind: Kind,
    pub target: String,
    pub operation: String,
    pub bucket_start: DateTime<Utc>,
    pub count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub duration_sum: f64,
    pub duration_max: f64,
    pub duration_min: f64,
    pub metadata_sum: HashMap<String, f64>,
    #[serde(with = "digest_bytes")]
    pub p95_digest: TDigest,
}

/// `TDigest` serializes to JSON internally, but the column is a BLOB;
/// this adapter lets `Bucket` derive `Serialize`/`Deserialize` while
/// still going through `TDigest::serialize`/`deserialize` at the edges.
mod digest_bytes {
    use super::TDigest;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &TDigest, s: S) -> Result<S::Ok, S::Error> {
        d.serialize().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TDigest, D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        Ok(TDigest::deserialize(&bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    Random,
    Slow,
    Error,
}

/// Persisted exemplar (spec §3 Sample).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub kind: Kind,
    pub target: String,
    pub operation: String,
    pub bucket_start: DateTime<Utc>,
    pub sample_type: SampleType,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub context: serde_json::Value,
    pub error_fingerprint: Option<String>,
}

/// Three-resolution occurrence histogram: unix-second bucket start at
/// minute/hour/day granularity, mapped to a count (spec §3, §4.11).
pub type OccurrenceHistogram = HashMap<i64, u64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccurrenceBuckets {
    #[serde(rename = "m")]
    pub minute: OccurrenceHistogram,
    #[serde(rename = "h")]
    pub hour: OccurrenceHistogram,
    #[serde(rename = "d")]
    pub day: OccurrenceHistogram,
}

impl OccurrenceBuckets {
    pub fn new() -> Self {
        Self {
            minute: HashMap::new(),
            hour: HashMap::new(),
            day: HashMap::new(),
        }
    }

    /// Merges by summing counts at matching timestamps per resolution
    /// (spec §4.8).
    pub fn merge(&mut self, other: &OccurrenceBuckets) {
        for (ts, count) in &other.minute {
            *self.minute.entry(*ts).or_insert(0) += count;
        }
        for (ts, count) in &other.hour {
            *self.hour.entry(*ts).or_insert(0) += count;
        }
        for (ts, count) in &other.day {
            *self.day.entry(*ts).or_insert(0) += count;
        }
    }

    /// Drops keys older than `now - retention` per resolution
    /// (spec §4.11: minute 24h, hour 30d, day indefinite).
    pub fn trim(&mut self, now: DateTime<Utc>, minute_retention_secs: i64, hour_retention_secs: i64) {
        let minute_floor = now.timestamp() - minute_retention_secs;
        let hour_floor = now.timestamp() - hour_retention_secs;
        self.minute.retain(|ts, _| *ts >= minute_floor);
        self.hour.retain(|ts, _| *ts >= hour_floor);
    }
}

impl Default for OccurrenceBuckets {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity = fingerprint (spec §3 ErrorRecord).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub fingerprint: String,
    pub kind: Kind,
    pub error_class: String,
    pub message: String,
    pub occurrences_count: i64,
    pub first_occurred_at: DateTime<Utc>,
    pub last_occurred_at: DateTime<Utc>,
    pub contexts: Vec<serde_json::Value>,
    pub occurrence_buckets: OccurrenceBuckets,
    pub resolved_at: Option<DateTime<Utc>>,
    pub pinned: bool,
}

/// In-memory per-fingerprint accumulator built by the error aggregator
/// for one drain (spec §4.7).
#[derive(Debug, Clone)]
pub struct ErrorAccumulator {
    pub fingerprint: String,
    pub kind: Kind,
    pub error_class: String,
    pub message: String,
    pub occurrences_count: i64,
    pub first_occurred_at: DateTime<Utc>,
    pub last_occurred_at: DateTime<Utc>,
    pub new_contexts: Vec<serde_json::Value>,
    pub occurrence_times: Vec<DateTime<Utc>>,
}

/// Identity = (name, bucket_start).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBucket {
    pub name: String,
    pub bucket_start: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSample {
    pub name: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Presentation-only; does not affect ingestion (spec §3 Preference).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPref {
    pub kind: Kind,
    pub target: String,
    pub operation: String,
    pub pinned: bool,
    pub ignored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPref {
    pub name: String,
    pub pinned: bool,
    pub ignored: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occurrence_buckets_merge_sums_matching_timestamps() {
        let mut a = OccurrenceBuckets::new();
        a.minute.insert(1000, 2);
        let mut b = OccurrenceBuckets::new();
        b.minute.insert(1000, 3);
        b.minute.insert(2000, 1);

        a.merge(&b);
        assert_eq!(a.minute[&1000], 5);
        assert_eq!(a.minute[&2000], 1);
    }

    #[test]
    fn trim_drops_entries_older_than_retention() {
        let now = Utc::now();
        let mut buckets = OccurrenceBuckets::new();
        buckets.minute.insert(now.timestamp() - 100_000, 1);
        buckets.minute.insert(now.timestamp(), 1);

        buckets.trim(now, 3600, 30 * 86_400);
        assert_eq!(buckets.minute.len(), 1);
    }
}

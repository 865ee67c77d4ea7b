//! Folds drained trace events into per-bucket accumulators (spec §4.5,
//! C5).
//!
//! Deterministic given the input multiset: every field except
//! `duration_max`/`duration_min` is a plain sum, and those two are
//! commutative monoidal reductions, so `aggregate` is order-independent
//! on a drain (spec §8, property 2).

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::event::{Status, TraceEvent};
use crate::models::{BucketAccumulator, BucketKey};

/// Floors `recorded_at` to the current aggregation resolution (default
/// 60s, spec §3).
pub fn bucket_start(recorded_at: DateTime<Utc>, resolution_secs: i64) -> DateTime<Utc> {
    let resolution_secs = resolution_secs.max(1);
    let floored = (recorded_at.timestamp() / resolution_secs) * resolution_secs;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(recorded_at)
}

/// Folds a drain's trace events into keyed accumulators, filtering out
/// `ignored_targets` first.
pub fn aggregate(
    events: &[TraceEvent],
    resolution_secs: i64,
    ignored_targets: &[String],
    digest_compression: f64,
) -> Vec<BucketAccumulator> {
    let mut buckets: HashMap<(String, String, String, i64), BucketAccumulator> = HashMap::new();

    for event in events {
        if is_ignored(&event.target, ignored_targets) {
            continue;
        }

        let start = bucket_start(event.recorded_at, resolution_secs);
        let map_key = (
            event.kind.to_string(),
            event.target.clone(),
            event.operation.clone(),
            start.timestamp(),
        );

        let acc = buckets.entry(map_key).or_insert_with(|| {
            BucketAccumulator::new(
                BucketKey {
                    kind: event.kind,
                    target: event.target.clone(),
                    operation: event.operation.clone(),
                    bucket_start: start,
                },
                digest_compression,
            )
        });

        acc.count += 1;
        match event.status {
            Status::Success => acc.success_count += 1,
            Status::Failure => acc.failure_count += 1,
        }
        acc.duration_sum += event.duration_ms;
        acc.duration_max = acc.duration_max.max(event.duration_ms);
        acc.duration_min = acc.duration_min.min(event.duration_ms);
        acc.digest.add(event.duration_ms);

        for (k, v) in &event.metadata {
            *acc.metadata_sum.entry(k.clone()).or_insert(0.0) += v;
        }
        for (segment_type, summary) in &event.segment_summary {
            *acc
                .metadata_sum
                .entry(format!("{segment_type}_count"))
                .or_insert(0.0) += summary.count as f64;
            *acc
                .metadata_sum
                .entry(format!("{segment_type}_ms"))
                .or_insert(0.0) += summary.duration_ms;
        }
    }

    buckets.into_values().collect()
}

fn is_ignored(target: &str, ignored_globs: &[String]) -> bool {
    ignored_globs.iter().any(|pattern| glob_match(pattern, target))
}

/// Minimal glob matcher: supports `*` as a wildcard, nothing fancier.
/// `ignored_targets` are simple prefix/suffix globs, not full regex
/// (spec §6).
fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == parts.len() - 1 {
            return text[pos..].ends_with(part);
        } else if let Some(found) = text[pos..].find(part) {
            pos += found + part.len();
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Kind;
    use chrono::Duration;

    fn trace(target: &str, duration_ms: f64, status: Status, at: DateTime<Utc>) -> TraceEvent {
        TraceEvent {
            kind: Kind::Http,
            target: target.into(),
            operation: "GET".into(),
            duration_ms,
            status,
            recorded_at: at,
            segments: Vec::new(),
            segment_summary: Default::default(),
            metadata: Default::default(),
            error_ref: None,
        }
    }

    #[test]
    fn aggregates_into_one_bucket_per_minute_per_key() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let events: Vec<_> = (0..100)
            .map(|_| trace("Users#index", 10.0, Status::Success, base))
            .collect();

        let buckets = aggregate(&events, 60, &[], 100.0);
        assert_eq!(buckets.len(), 1);
        let b = &buckets[0];
        assert_eq!(b.count, 100);
        assert_eq!(b.success_count, 100);
        assert_eq!(b.failure_count, 0);
        assert_eq!(b.duration_sum, 1000.0);
        assert_eq!(b.duration_max, 10.0);
        assert_eq!(b.duration_min, 10.0);
    }

    #[test]
    fn aggregation_is_order_independent() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let durations = [10.0, 20.0, 30.0, 5.0, 99.0];
        let events: Vec<_> = durations
            .iter()
            .map(|d| trace("Jobs#run", *d, Status::Success, base))
            .collect();

        let mut reversed = events.clone();
        reversed.reverse();

        let forward = aggregate(&events, 60, &[], 100.0);
        let backward = aggregate(&reversed, 60, &[], 100.0);

        assert_eq!(forward[0].duration_sum, backward[0].duration_sum);
        assert_eq!(forward[0].duration_max, backward[0].duration_max);
        assert_eq!(forward[0].duration_min, backward[0].duration_min);
        assert_eq!(forward[0].count, backward[0].count);
    }

    #[test]
    fn ignored_targets_are_filtered_before_aggregation() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let events = vec![
            trace("Health#check", 1.0, Status::Success, base),
            trace("Users#index", 5.0, Status::Success, base),
        ];
        let buckets = aggregate(&events, 60, &["Health*".to_string()], 100.0);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].key.target, "Users#index");
    }

    #[test]
    fn distinct_minutes_fall_in_distinct_buckets() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let events = vec![
            trace("Users#index", 1.0, Status::Success, base),
            trace("Users#index", 1.0, Status::Success, base + Duration::seconds(61)),
        ];
        let buckets = aggregate(&events, 60, &[], 100.0);
        assert_eq!(buckets.len(), 2);
    }
}

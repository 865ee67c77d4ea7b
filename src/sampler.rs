//! Exemplar selection policy (spec §4.6, C6).
//!
//! Three independent candidate pools per bucket key — error, slow,
//! random — each capped and reduced by its own rule. An event can only
//! land in one pool: error first, then slow, then whatever is left is
//! eligible for the random reservoir.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::SampleCaps;
use crate::event::{Kind, Status, TraceEvent};
use crate::models::{Sample, SampleType};

fn segment_context(event: &TraceEvent) -> serde_json::Value {
    serde_json::json!({
        "segments": event.segments.iter().map(|s| serde_json::json!({
            "type": s.segment_type,
            "duration_ms": s.duration_ms,
            "detail": s.detail,
            "source": s.source,
        })).collect::<Vec<_>>(),
        "metadata": event.metadata,
    })
}

fn bucket_key(event: &TraceEvent) -> (Kind, String, String) {
    (event.kind, event.target.clone(), event.operation.clone())
}

/// Selects samples across an entire drain, grouped by bucket key.
/// `slow_threshold_ms` maps a `Kind` to its configured slow cutoff.
pub fn select_samples(
    events: &[TraceEvent],
    caps: &SampleCaps,
    slow_threshold_ms: impl Fn(Kind) -> f64,
) -> Vec<Sample> {
    let mut by_bucket: HashMap<(Kind, String, String), Vec<(usize, &TraceEvent)>> = HashMap::new();
    for (idx, event) in events.iter().enumerate() {
        by_bucket.entry(bucket_key(event)).or_default().push((idx, event));
    }

    let mut samples = Vec::new();
    for ((kind, target, operation), group) in by_bucket {
        let bucket_start = group
            .first()
            .map(|(_, e)| super::aggregator::bucket_start(e.recorded_at, 60))
            .unwrap_or_else(Utc::now);

        let mut error_indices = Vec::new();
        let mut slow_indices = Vec::new();
        let mut remaining = Vec::new();

        let threshold = slow_threshold_ms(kind);
        for &(idx, event) in &group {
            if event.status == Status::Failure {
                error_indices.push((idx, event));
            } else if event.duration_ms >= threshold {
                slow_indices.push((idx, event));
            } else {
                remaining.push((idx, event));
            }
        }

        // Error samples: most recent K_err by recorded_at.
        error_indices.sort_by(|a, b| b.1.recorded_at.cmp(&a.1.recorded_at));
        error_indices.truncate(caps.error);
        for (_, event) in &error_indices {
            samples.push(Sample {
                kind,
                target: target.clone(),
                operation: operation.clone(),
                bucket_start,
                sample_type: SampleType::Error,
                recorded_at: event.recorded_at,
                duration_ms: event.duration_ms,
                context: segment_context(event),
                error_fingerprint: event.error_ref.clone(),
            });
        }

        // Slow samples: top-K by duration, ties broken by earliest
        // recorded_at then insertion index (spec §4.6).
        slow_indices.sort_by(|a, b| {
            b.1.duration_ms
                .total_cmp(&a.1.duration_ms)
                .then_with(|| a.1.recorded_at.cmp(&b.1.recorded_at))
                .then_with(|| a.0.cmp(&b.0))
        });
        slow_indices.truncate(caps.slow);
        for (_, event) in &slow_indices {
            samples.push(Sample {
                kind,
                target: target.clone(),
                operation: operation.clone(),
                bucket_start,
                sample_type: SampleType::Slow,
                recorded_at: event.recorded_at,
                duration_ms: event.duration_ms,
                context: segment_context(event),
                error_fingerprint: None,
            });
        }

        // Random samples: reservoir sampling over whatever is neither
        // slow nor error, equal survival probability regardless of
        // total volume.
        let chosen = reservoir_sample(&remaining, caps.random);
        for (_, event) in chosen {
            samples.push(Sample {
                kind,
                target: target.clone(),
                operation: operation.clone(),
                bucket_start,
                sample_type: SampleType::Random,
                recorded_at: event.recorded_at,
                duration_ms: event.duration_ms,
                context: segment_context(event),
                error_fingerprint: None,
            });
        }
    }

    samples
}

fn reservoir_sample<'a>(
    candidates: &[(usize, &'a TraceEvent)],
    k: usize,
) -> Vec<(usize, &'a TraceEvent)> {
    if k == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let mut reservoir: Vec<(usize, &TraceEvent)> = candidates.iter().take(k).copied().collect();
    let mut rng = rand::thread_rng();
    for (seen, candidate) in candidates.iter().enumerate().skip(k) {
        let j = rng.gen_range(0..=seen);
        if j < k {
            reservoir[j] = *candidate;
        }
    }
    reservoir
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trace(duration_ms: f64, status: Status, at: DateTime<Utc>) -> TraceEvent {
        TraceEvent {
            kind: Kind::Http,
            target: "Users#index".into(),
            operation: "GET".into(),
            duration_ms,
            status,
            recorded_at: at,
            segments: Vec::new(),
            segment_summary: Default::default(),
            metadata: Default::default(),
            error_ref: Some("fp".into()),
        }
    }

    #[test]
    fn slow_and_error_samples_respect_caps() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let durations = [10.0, 20.0, 30.0, 40.0, 600.0, 700.0, 800.0, 10.0, 10.0, 10.0];
        let mut events: Vec<_> = durations
            .iter()
            .map(|d| trace(*d, Status::Success, base))
            .collect();
        events[6].status = Status::Failure;

        let caps = SampleCaps {
            slow: 3,
            random: 1,
            error: 3,
        };
        let samples = select_samples(&events, &caps, |_| 500.0);

        let slow: Vec<_> = samples
            .iter()
            .filter(|s| s.sample_type == SampleType::Slow)
            .collect();
        assert_eq!(slow.len(), 3);

        let error: Vec<_> = samples
            .iter()
            .filter(|s| s.sample_type == SampleType::Error)
            .collect();
        assert_eq!(error.len(), 1);

        let random: Vec<_> = samples
            .iter()
            .filter(|s| s.sample_type == SampleType::Random)
            .collect();
        assert_eq!(random.len(), 1);
    }
}

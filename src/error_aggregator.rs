//! Dedupe, context ring, and occurrence histograms (spec §4.7, C7).

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};

use crate::event::ErrorEvent;
use crate::models::ErrorAccumulator;

/// Groups failure events by fingerprint into per-drain accumulators.
/// `context_ring_size` bounds `new_contexts`, matching the persisted
/// ring's cap N (spec §3 ErrorRecord, default 10).
pub fn aggregate_errors(events: &[ErrorEvent], context_ring_size: usize) -> Vec<ErrorAccumulator> {
    let mut groups: HashMap<String, Vec<&ErrorEvent>> = HashMap::new();
    for event in events {
        groups.entry(event.fingerprint.clone()).or_default().push(event);
    }

    groups
        .into_iter()
        .map(|(fingerprint, mut group)| {
            group.sort_by_key(|e| e.occurred_at);

            let first = group.first().unwrap();
            let last = group.last().unwrap();

            let mut by_recency = group.clone();
            by_recency.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
            let new_contexts = by_recency
                .iter()
                .take(context_ring_size)
                .map(|e| {
                    serde_json::json!({
                        "backtrace": e.context.backtrace,
                        "request_info": e.context.request_info,
                    })
                })
                .collect();

            ErrorAccumulator {
                fingerprint,
                kind: first.kind,
                error_class: first.error_class.clone(),
                message: first.message.clone(),
                occurrences_count: group.len() as i64,
                first_occurred_at: first.occurred_at,
                last_occurred_at: last.occurred_at,
                new_contexts,
                occurrence_times: group.iter().map(|e| e.occurred_at).collect(),
            }
        })
        .collect()
}

/// Bucket-start helpers for the three occurrence-histogram resolutions.
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.with_second(0).unwrap_or(at).with_nanosecond(0).unwrap_or(at).timestamp()
}

pub fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
        .timestamp()
}

pub fn day_bucket(at: DateTime<Utc>) -> i64 {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).timestamp())
        .unwrap_or_else(|| at.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorContext, Kind};
    use chrono::TimeZone;

    fn error(at: DateTime<Utc>) -> ErrorEvent {
        ErrorEvent {
            fingerprint: "fp1".into(),
            kind: Kind::Http,
            error_class: "RuntimeError".into(),
            message: "boom".into(),
            occurred_at: at,
            context: ErrorContext {
                backtrace: vec!["a.rb:1".into()],
                request_info: serde_json::json!({}),
            },
        }
    }

    #[test]
    fn groups_by_fingerprint_and_tracks_first_last() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        let events = vec![error(t0), error(t1)];

        let groups = aggregate_errors(&events, 10);
        assert_eq!(groups.len(), 1);
        let acc = &groups[0];
        assert_eq!(acc.occurrences_count, 2);
        assert_eq!(acc.first_occurred_at, t0);
        assert_eq!(acc.last_occurred_at, t1);
    }

    #[test]
    fn context_ring_is_bounded_by_n() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let events: Vec<_> = (0..20)
            .map(|i| error(t0 + chrono::Duration::seconds(i)))
            .collect();

        let groups = aggregate_errors(&events, 10);
        assert_eq!(groups[0].new_contexts.len(), 10);
    }
}

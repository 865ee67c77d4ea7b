//! Tagged record produced on the hot path (spec §4.3, C3).
//!
//! A sum type with an explicit tag, not dynamic dispatch, so the
//! aggregator can visit over it with a plain `match` (spec §9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MetadataMap;

/// Ingestion category (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Http,
    Job,
    Custom,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::Http => write!(f, "http"),
            Kind::Job => write!(f, "job"),
            Kind::Custom => write!(f, "custom"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failure,
}

/// A sub-timing within a trace, attached to the current task's segment
/// context (GLOSSARY: Segment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_type: String,
    pub duration_ms: f64,
    pub detail: Option<String>,
    pub source: Option<String>,
}

/// Running per-type rollup of segments attached to one trace, keyed by
/// `segment_type` at the call site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentSummaryEntry {
    pub count: u64,
    pub duration_ms: f64,
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: Kind,
    pub target: String,
    pub operation: String,
    pub duration_ms: f64,
    pub status: Status,
    pub recorded_at: DateTime<Utc>,
    pub segments: Vec<Segment>,
    pub segment_summary: std::collections::HashMap<String, SegmentSummaryEntry>,
    pub metadata: MetadataMap,
    pub error_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub backtrace: Vec<String>,
    pub request_info: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub fingerprint: String,
    pub kind: Kind,
    pub error_class: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub context: ErrorContext,
}

#[derive(Debug, Clone)]
pub struct BusinessEvent {
    pub name: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// The hot-path record: immutable once pushed to [`crate::buffer::Buffer`].
#[derive(Debug, Clone)]
pub enum Event {
    Trace(TraceEvent),
    Error(ErrorEvent),
    BusinessEvent(BusinessEvent),
}

impl Event {
    /// Conservative upper bound on in-memory cost, used by the buffer for
    /// admission control. Does not need to be exact, only monotonic in
    /// payload size (spec §4.3).
    pub fn estimated_bytes(&self) -> usize {
        const BASE: usize = 128;
        match self {
            Event::Trace(t) => {
                BASE
                    + t.target.len()
                    + t.operation.len()
                    + t.segments
                        .iter()
                        .map(|s| {
                            48 + s.segment_type.len()
                                + s.detail.as_deref().map_or(0, str::len)
                                + s.source.as_deref().map_or(0, str::len)
                        })
                        .sum::<usize>()
                    + t.segment_summary.len() * 40
                    + t.metadata.len() * 24
            }
            Event::Error(e) => {
                BASE
                    + e.error_class.len()
                    + e.message.len()
                    + e.context.backtrace.iter().map(String::len).sum::<usize>()
                    + e.context.request_info.to_string().len()
            }
            Event::BusinessEvent(b) => BASE + b.name.len() + b.payload.to_string().len(),
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            Event::Trace(t) => t.recorded_at,
            Event::Error(e) => e.occurred_at,
            Event::BusinessEvent(b) => b.recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trace(target_len: usize) -> TraceEvent {
        TraceEvent {
            kind: Kind::Http,
            target: "x".repeat(target_len),
            operation: "GET".into(),
            duration_ms: 10.0,
            status: Status::Success,
            recorded_at: Utc::now(),
            segments: Vec::new(),
            segment_summary: Default::default(),
            metadata: Default::default(),
            error_ref: None,
        }
    }

    #[test]
    fn estimated_bytes_is_monotonic_in_payload_size() {
        let small = Event::Trace(sample_trace(10)).estimated_bytes();
        let large = Event::Trace(sample_trace(1000)).estimated_bytes();
        assert!(large > small);
    }
}

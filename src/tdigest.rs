//! Streaming percentile sketch (spec §4.1, C1).
//!
//! A simplified Ted Dunning t-digest: values are kept as weighted
//! centroids, compressed by repeated nearest-neighbor merging once the
//! centroid count exceeds a budget driven by the compression parameter
//! `delta`. This keeps memory bounded while preserving tail accuracy at
//! the extremes, which is what `percentile(0.95)` on slow-request data
//! actually needs.
//!
//! Grounded on the linear-interpolation percentile estimator in the
//! pack's `canis` observability ingestion (`percentile_from_histogram`):
//! same idea of walking a sorted weighted distribution and
//! interpolating between the two straddling points, generalized here to
//! support merge and serialize.

use serde::{Deserialize, Serialize};

/// A single (mean, weight) centroid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Mergeable streaming quantile sketch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TDigest {
    centroids: Vec<Centroid>,
    total_weight: f64,
    min: f64,
    max: f64,
    compression: f64,
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        Self {
            centroids: Vec::new(),
            total_weight: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            compression: compression.max(1.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    pub fn count(&self) -> f64 {
        self.total_weight
    }

    /// Inserts a value with weight 1.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.total_weight += 1.0;
        self.centroids.push(Centroid { mean: value, weight: 1.0 });
        self.maybe_compress();
    }

    /// Merges another digest's centroids in, associatively and
    /// commutatively — the result is the same regardless of merge order
    /// (spec §4.1, property 3 in §8).
    pub fn merge(&mut self, other: &TDigest) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.total_weight += other.total_weight;
        self.centroids.extend_from_slice(&other.centroids);
        self.maybe_compress();
    }

    /// Approximate quantile at `p` in `[0, 1]`. `None` when empty.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.centroids.is_empty() {
            return None;
        }
        let p = p.clamp(0.0, 1.0);
        if self.centroids.len() == 1 {
            return Some(self.centroids[0].mean);
        }

        let mut sorted = self.centroids.clone();
        sorted.sort_by(|a, b| a.mean.total_cmp(&b.mean));
        let target = p * self.total_weight;

        let mut cumulative = 0.0;
        let last_idx = sorted.len() - 1;
        for (i, window) in sorted.windows(2).enumerate() {
            let (a, b) = (window[0], window[1]);
            let next_cumulative = cumulative + a.weight;
            if target <= next_cumulative || i == last_idx - 1 {
                if target <= cumulative + a.weight / 2.0 {
                    return Some(a.mean);
                }
                let lo_weight = cumulative + a.weight / 2.0;
                let hi_weight = next_cumulative + b.weight / 2.0;
                let span = (hi_weight - lo_weight).max(f64::EPSILON);
                let frac = ((target - lo_weight) / span).clamp(0.0, 1.0);
                return Some(a.mean + frac * (b.mean - a.mean));
            }
            cumulative = next_cumulative;
        }
        Some(sorted.last().unwrap().mean)
    }

    /// Compresses to at most `~2 * compression` centroids by repeatedly
    /// merging the closest adjacent pair. Never throws; a pathological
    /// input simply yields a coarser digest.
    fn maybe_compress(&mut self) {
        let budget = (2.0 * self.compression).ceil() as usize;
        if self.centroids.len() <= budget.max(8) {
            return;
        }
        self.centroids.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        while self.centroids.len() > budget.max(8) {
            let mut best_gap = f64::INFINITY;
            let mut best_idx = 0;
            for i in 0..self.centroids.len() - 1 {
                let gap = self.centroids[i + 1].mean - self.centroids[i].mean;
                if gap < best_gap {
                    best_gap = gap;
                    best_idx = i;
                }
            }
            let b = self.centroids.remove(best_idx + 1);
            let a = &mut self.centroids[best_idx];
            let total = a.weight + b.weight;
            a.mean = (a.mean * a.weight + b.mean * b.weight) / total;
            a.weight = total;
        }
    }

    /// Binary serialization via `bincode`-free hand-rolled encoding would
    /// be one more dependency to track; `serde_json` is already required
    /// for metadata maps, so the digest rides the same encoder.
    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Malformed bytes deserialize to an empty digest rather than
    /// erroring — the read path must never fail on corrupt storage
    /// (spec §4.1, §7 MalformedStoredData).
    pub fn deserialize(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_else(|_| TDigest::new(100.0))
    }
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_has_no_percentile() {
        let d = TDigest::new(100.0);
        assert_eq!(d.percentile(0.5), None);
    }

    #[test]
    fn uniform_values_percentile_is_approximately_correct() {
        let mut d = TDigest::new(100.0);
        for v in 0..=1000 {
            d.add(v as f64);
        }
        let p50 = d.percentile(0.5).unwrap();
        assert!((p50 - 500.0).abs() < 20.0, "p50 = {p50}");

        let p95 = d.percentile(0.95).unwrap();
        assert!((p95 - 950.0).abs() < 30.0, "p95 = {p95}");
    }

    #[test]
    fn merge_is_equivalent_to_adding_all_values() {
        let mut a = TDigest::new(100.0);
        let mut b = TDigest::new(100.0);
        for v in 0..500 {
            a.add(v as f64);
        }
        for v in 500..1000 {
            b.add(v as f64);
        }
        a.merge(&b);

        let mut direct = TDigest::new(100.0);
        for v in 0..1000 {
            direct.add(v as f64);
        }

        let merged_p90 = a.percentile(0.9).unwrap();
        let direct_p90 = direct.percentile(0.9).unwrap();
        assert!((merged_p90 - direct_p90).abs() < 40.0);
    }

    #[test]
    fn round_trip_serialize_preserves_percentiles() {
        let mut d = TDigest::new(100.0);
        for v in 0..200 {
            d.add(v as f64);
        }
        let bytes = d.serialize();
        let back = TDigest::deserialize(&bytes);
        assert!((d.percentile(0.5).unwrap() - back.percentile(0.5).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn malformed_bytes_deserialize_to_empty_digest() {
        let d = TDigest::deserialize(b"not json at all");
        assert!(d.is_empty());
        assert_eq!(d.percentile(0.5), None);
    }
}

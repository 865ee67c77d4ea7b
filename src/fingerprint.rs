//! Stable error fingerprinting (spec §4.2, C2).
//!
//! Hashes `error_class` and a normalized, app-frames-only backtrace with
//! SHA-256 so the same logical error always lands on the same
//! `ErrorRecord` row, independent of absolute path prefixes or which
//! process produced it.

use sha2::{Digest, Sha256};

/// A single stack frame as the collaborator reports it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub path: String,
    pub line: u32,
    pub function: String,
}

/// Keeps only frames under one of `app_roots`, strips the matching root
/// prefix from the path, and leaves line numbers untouched. Frames
/// outside the app (vendored dependencies, stdlib) are dropped — they
/// vary across installs and would defeat stability across restarts.
pub fn normalize_frames(frames: &[Frame], app_roots: &[String]) -> Vec<String> {
    if app_roots.is_empty() {
        return frames
            .iter()
            .map(|f| format!("{}:{}:{}", f.path, f.line, f.function))
            .collect();
    }

    frames
        .iter()
        .filter_map(|f| {
            app_roots.iter().find_map(|root| {
                f.path.strip_prefix(root.as_str()).map(|rel| {
                    let rel = rel.trim_start_matches('/');
                    format!("{}:{}:{}", rel, f.line, f.function)
                })
            })
        })
        .collect()
}

/// `fingerprint(error_class, backtrace) -> 64-char hex` (spec §4.2).
/// Two occurrences with the same class and the same normalized frames
/// always produce the same fingerprint, byte-identical inputs always
/// produce byte-identical output.
pub fn fingerprint(error_class: &str, normalized_frames: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error_class.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized_frames.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(path: &str, line: u32) -> Frame {
        Frame {
            path: path.into(),
            line,
            function: "call".into(),
        }
    }

    #[test]
    fn identical_class_and_frames_yield_identical_fingerprint() {
        let roots = vec!["/app".to_string()];
        let frames = vec![frame("/app/models/user.rb", 42)];
        let a = fingerprint("RuntimeError", &normalize_frames(&frames, &roots));
        let b = fingerprint("RuntimeError", &normalize_frames(&frames, &roots));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn cosmetic_path_prefix_differences_do_not_change_fingerprint() {
        let frames_a = vec![frame("/app/models/user.rb", 42)];
        let frames_b = vec![frame("/deploy/release-123/app/models/user.rb", 42)];

        let fp_a = fingerprint(
            "RuntimeError",
            &normalize_frames(&frames_a, &["/app".to_string()]),
        );
        let fp_b = fingerprint(
            "RuntimeError",
            &normalize_frames(&frames_b, &["/deploy/release-123/app".to_string()]),
        );
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn different_error_class_changes_fingerprint() {
        let roots = vec!["/app".to_string()];
        let frames = vec![frame("/app/models/user.rb", 42)];
        let normalized = normalize_frames(&frames, &roots);
        let a = fingerprint("RuntimeError", &normalized);
        let b = fingerprint("ArgumentError", &normalized);
        assert_ne!(a, b);
    }

    #[test]
    fn frames_outside_app_root_are_dropped() {
        let frames = vec![
            frame("/usr/lib/ruby/vendor.rb", 1),
            frame("/app/controllers/home.rb", 10),
        ];
        let normalized = normalize_frames(&frames, &["/app".to_string()]);
        assert_eq!(normalized.len(), 1);
        assert!(normalized[0].starts_with("controllers/home.rb"));
    }
}

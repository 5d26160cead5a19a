//! Cosine-distance matching of a query embedding against an enrolled roster.

use crate::types::{Embedding, EnrolledIdentity};
use serde::Serialize;
use thiserror::Error;

/// Default acceptance threshold (cosine distance, lower = more similar).
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.40;

/// Distance reported when either vector has zero magnitude.
pub const DEGENERATE_DISTANCE: f32 = 1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Cosine distance `1 - (a·b)/(‖a‖·‖b‖)`, in `[0, 2]`.
///
/// A zero-magnitude operand yields [`DEGENERATE_DISTANCE`].
pub fn cosine_distance(a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
    if a.dim() != b.dim() {
        return Err(MatchError::DimensionMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }

    // Accumulate in f64: squares of large finite f32 values overflow f32 and
    // squares of tiny ones underflow to zero.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.values.iter().zip(b.values.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(DEGENERATE_DISTANCE);
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !denom.is_finite() {
        return Ok(DEGENERATE_DISTANCE);
    }

    // Rounding can push the similarity a hair outside [-1, 1].
    Ok((1.0 - dot / denom).clamp(0.0, 2.0) as f32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Matched,
    /// Nearest candidate was further than the acceptance threshold.
    Rejected,
    NoCandidates,
}

/// Result of matching a query embedding against a roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub decision: Decision,
    /// Set only when `decision == Matched`.
    pub best_identity_id: Option<String>,
    /// Distance to the nearest candidate (`None` with no candidates).
    pub best_score: Option<f32>,
}

impl MatchResult {
    fn no_candidates() -> Self {
        Self {
            decision: Decision::NoCandidates,
            best_identity_id: None,
            best_score: None,
        }
    }
}

/// Strategy for comparing a query embedding against a roster of enrolled faces.
pub trait Matcher {
    fn nearest(
        &self,
        query: &Embedding,
        candidates: &[EnrolledIdentity],
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-neighbour search by cosine distance, then threshold acceptance.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for CosineMatcher {
    fn nearest(
        &self,
        query: &Embedding,
        candidates: &[EnrolledIdentity],
    ) -> Result<MatchResult, MatchError> {
        let mut best: Option<(usize, f32)> = None;

        // Full scan; strict less-than so ties keep the first candidate seen.
        for (i, candidate) in candidates.iter().enumerate() {
            let d = cosine_distance(query, &candidate.embedding)?;
            match best {
                Some((_, best_d)) if d >= best_d => {}
                _ => best = Some((i, d)),
            }
        }

        let Some((idx, distance)) = best else {
            return Ok(MatchResult::no_candidates());
        };

        if distance <= self.threshold {
            Ok(MatchResult {
                decision: Decision::Matched,
                best_identity_id: Some(candidates[idx].identity_id.clone()),
                best_score: Some(distance),
            })
        } else {
            Ok(MatchResult {
                decision: Decision::Rejected,
                best_identity_id: None,
                best_score: Some(distance),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn identity(id: &str, values: &[f32]) -> EnrolledIdentity {
        EnrolledIdentity {
            identity_id: id.into(),
            class_id: "c".into(),
            roll_number: id.into(),
            display_name: id.into(),
            embedding: emb(values),
            enrolled_at: Utc::now(),
        }
    }

    /// Unit vector at `distance` from (1, 0) in cosine distance.
    fn at_distance(distance: f32) -> Vec<f32> {
        let cos = 1.0 - distance;
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = emb(&[0.3, -1.2, 4.5, 0.01]);
        assert!(cosine_distance(&a, &a).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_distance_orthogonal_and_opposite() {
        let x = emb(&[1.0, 0.0]);
        assert!((cosine_distance(&x, &emb(&[0.0, 1.0])).unwrap() - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&x, &emb(&[-1.0, 0.0])).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let pairs = [
            (emb(&[0.2, 0.9, -0.4]), emb(&[0.7, -0.1, 0.3])),
            (emb(&[1.0, 2.0, 3.0]), emb(&[3.0, 2.0, 1.0])),
            (emb(&[0.0, 0.0, 0.0]), emb(&[1.0, 1.0, 1.0])),
        ];
        for (a, b) in &pairs {
            assert_eq!(cosine_distance(a, b).unwrap(), cosine_distance(b, a).unwrap());
        }
    }

    #[test]
    fn test_distance_zero_vector_is_one() {
        let zero = emb(&[0.0, 0.0]);
        assert_eq!(cosine_distance(&zero, &emb(&[1.0, 0.0])).unwrap(), 1.0);
        assert_eq!(cosine_distance(&zero, &zero).unwrap(), 1.0);
    }

    #[test]
    fn test_distance_large_magnitude_identical_is_zero() {
        let a = emb(&[3e19, -2e19, 1e19]);
        assert!(cosine_distance(&a, &a).unwrap() < 1e-6);
        let b = emb(&[f32::MAX, f32::MAX]);
        assert!(cosine_distance(&b, &b).unwrap() < 1e-6);
    }

    #[test]
    fn test_distance_tiny_magnitude_identical_is_zero() {
        let a = emb(&[1e-25, 2e-25, -1e-25]);
        assert!(cosine_distance(&a, &a).unwrap() < 1e-6);
        let b = emb(&[f32::MIN_POSITIVE, 0.0]);
        assert!(cosine_distance(&b, &b).unwrap() < 1e-6);
        assert!((cosine_distance(&b, &emb(&[0.0, 1e-30])).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaled_copy_matches() {
        let roster = vec![identity("A", &[1e-20, 2e-20]), identity("B", &[2e-20, -1e-20])];
        let result = CosineMatcher::default()
            .nearest(&emb(&[1e18, 2e18]), &roster)
            .unwrap();
        assert_eq!(result.decision, Decision::Matched);
        assert_eq!(result.best_identity_id.as_deref(), Some("A"));
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let err = cosine_distance(&emb(&[1.0, 0.0]), &emb(&[1.0, 0.0, 0.0])).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { left: 2, right: 3 });
    }

    #[test]
    fn test_nearest_empty_is_no_candidates() {
        let result = CosineMatcher::default().nearest(&emb(&[1.0, 0.0]), &[]).unwrap();
        assert_eq!(result.decision, Decision::NoCandidates);
        assert!(result.best_identity_id.is_none());
        assert!(result.best_score.is_none());
    }

    #[test]
    fn test_nearest_scans_whole_roster() {
        // Best match is the last entry.
        let roster = vec![
            identity("decoy1", &[0.0, 1.0, 0.0]),
            identity("decoy2", &[0.0, 0.0, 1.0]),
            identity("match", &[1.0, 0.0, 0.0]),
        ];
        let result = CosineMatcher::default()
            .nearest(&emb(&[1.0, 0.0, 0.0]), &roster)
            .unwrap();
        assert_eq!(result.decision, Decision::Matched);
        assert_eq!(result.best_identity_id.as_deref(), Some("match"));
        assert!(result.best_score.unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_nearest_within_threshold_matches() {
        let roster = vec![
            identity("b", &at_distance(0.9)),
            identity("a", &at_distance(0.15)),
        ];
        let result = CosineMatcher::new(0.4).nearest(&emb(&[1.0, 0.0]), &roster).unwrap();
        assert_eq!(result.decision, Decision::Matched);
        assert_eq!(result.best_identity_id.as_deref(), Some("a"));
        assert!((result.best_score.unwrap() - 0.15).abs() < 1e-4);
    }

    #[test]
    fn test_nearest_above_threshold_rejects() {
        let roster = vec![
            identity("a", &at_distance(0.6)),
            identity("b", &at_distance(0.9)),
        ];
        let result = CosineMatcher::new(0.4).nearest(&emb(&[1.0, 0.0]), &roster).unwrap();
        assert_eq!(result.decision, Decision::Rejected);
        assert!(result.best_identity_id.is_none());
        assert!((result.best_score.unwrap() - 0.6).abs() < 1e-4);
    }

    #[test]
    fn test_nearest_tie_keeps_first_seen() {
        let roster = vec![
            identity("first", &[1.0, 0.0]),
            identity("second", &[1.0, 0.0]),
        ];
        let result = CosineMatcher::default().nearest(&emb(&[1.0, 0.0]), &roster).unwrap();
        assert_eq!(result.best_identity_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_nearest_dimension_mismatch_is_loud() {
        let roster = vec![
            identity("ok", &[1.0, 0.0]),
            identity("skewed", &[1.0, 0.0, 0.0]),
        ];
        let err = CosineMatcher::default()
            .nearest(&emb(&[1.0, 0.0]), &roster)
            .unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { left: 2, right: 3 });
    }

    #[test]
    fn test_zero_query_never_matches_default_threshold() {
        let roster = vec![identity("a", &[1.0, 0.0])];
        let result = CosineMatcher::default().nearest(&emb(&[0.0, 0.0]), &roster).unwrap();
        assert_eq!(result.decision, Decision::Rejected);
        assert_eq!(result.best_score, Some(DEGENERATE_DISTANCE));
    }
}

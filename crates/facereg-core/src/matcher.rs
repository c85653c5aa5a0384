//! Nearest-identity matching over an identity store snapshot.

use crate::store::Snapshot;
use crate::types::Embedding;

/// Default acceptance tolerance, in Euclidean distance units of the
/// embedding space (the usual setting for 128-dim dlib face encodings).
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Outcome of matching a query embedding against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Found {
        name: String,
        /// Distance to the selected stored embedding.
        distance: f32,
        /// Index of the selected embedding in the snapshot.
        index: usize,
    },
    NotFound,
}

impl MatchResult {
    pub fn name(&self) -> Option<&str> {
        match self {
            MatchResult::Found { name, .. } => Some(name.as_str()),
            MatchResult::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, MatchResult::Found { .. })
    }
}

/// Strategy for deciding whether a query embedding re-observes a known identity.
///
/// Implementations must be pure with respect to the snapshot: the same query
/// against an unchanged snapshot always yields the same result.
pub trait Matcher {
    fn find(&self, query: &Embedding, snapshot: &Snapshot) -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// Matching is two-step. The gate passes if ANY stored embedding lies within
/// `tolerance` (inclusive). Once it passes, the identity is taken from the
/// global nearest embedding, first occurrence winning ties. When the gate
/// fails the result is `NotFound`, never a poor match.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    tolerance: f32,
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl Matcher for EuclideanMatcher {
    fn find(&self, query: &Embedding, snapshot: &Snapshot) -> MatchResult {
        if snapshot.is_empty() {
            return MatchResult::NotFound;
        }

        let distances: Vec<f32> = snapshot
            .embeddings()
            .iter()
            .map(|known| known.euclidean_distance(query))
            .collect();

        let within_tolerance = distances.iter().any(|&d| d <= self.tolerance);
        if !within_tolerance {
            return MatchResult::NotFound;
        }

        // Strict `<` keeps the first occurrence on ties.
        let mut best_idx = 0;
        for (i, &d) in distances.iter().enumerate().skip(1) {
            if d < distances[best_idx] {
                best_idx = i;
            }
        }

        tracing::trace!(
            candidates = distances.len(),
            best = best_idx,
            distance = distances[best_idx],
            "match gate passed"
        );

        MatchResult::Found {
            name: snapshot.names()[best_idx].clone(),
            distance: distances[best_idx],
            index: best_idx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn snapshot(entries: &[(&[f32], &str)]) -> Snapshot {
        Snapshot::from_parts(
            entries.iter().map(|(v, _)| emb(v)).collect(),
            entries.iter().map(|(_, n)| n.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_snapshot_not_found() {
        let m = EuclideanMatcher::default();
        assert_eq!(m.find(&emb(&[0.0, 0.0]), &Snapshot::new()), MatchResult::NotFound);
        assert_eq!(m.find(&emb(&[5.0, -3.0]), &Snapshot::new()), MatchResult::NotFound);
    }

    #[test]
    fn test_alice_within_tolerance() {
        let snap = snapshot(&[(&[0.0, 0.0], "alice")]);
        let r = EuclideanMatcher::new(0.6).find(&emb(&[0.3, 0.0]), &snap);
        assert_eq!(r.name(), Some("alice"));
    }

    #[test]
    fn test_far_query_not_found() {
        let snap = snapshot(&[(&[0.0, 0.0], "alice")]);
        let r = EuclideanMatcher::new(0.6).find(&emb(&[0.9, 0.0]), &snap);
        assert_eq!(r, MatchResult::NotFound);
    }

    #[test]
    fn test_tolerance_boundary_just_below() {
        let snap = snapshot(&[(&[0.0, 0.0], "alice")]);
        let r = EuclideanMatcher::new(0.6).find(&emb(&[0.59, 0.0]), &snap);
        assert!(r.is_found());
    }

    #[test]
    fn test_tolerance_boundary_just_above() {
        let snap = snapshot(&[(&[0.0, 0.0], "alice")]);
        let r = EuclideanMatcher::new(0.6).find(&emb(&[0.61, 0.0]), &snap);
        assert_eq!(r, MatchResult::NotFound);
    }

    #[test]
    fn test_tolerance_boundary_exact_is_inclusive() {
        // 0.5 is exactly representable, so the distance is exactly the tolerance.
        let snap = snapshot(&[(&[0.0, 0.0], "alice")]);
        let r = EuclideanMatcher::new(0.5).find(&emb(&[0.5, 0.0]), &snap);
        match r {
            MatchResult::Found { name, distance, .. } => {
                assert_eq!(name, "alice");
                assert_eq!(distance, 0.5);
            }
            MatchResult::NotFound => panic!("distance equal to tolerance must match"),
        }
    }

    #[test]
    fn test_nearest_of_two_within_tolerance_wins() {
        let snap = snapshot(&[(&[0.0, 0.0], "alice"), (&[0.4, 0.0], "bob")]);
        let r = EuclideanMatcher::new(0.6).find(&emb(&[0.3, 0.0]), &snap);
        assert_eq!(r.name(), Some("bob"));
    }

    #[test]
    fn test_tie_breaks_to_first_occurrence() {
        let snap = snapshot(&[
            (&[1.0, 0.0], "far"),
            (&[0.0, 0.25], "first"),
            (&[0.0, -0.25], "second"),
        ]);
        let r = EuclideanMatcher::new(0.6).find(&emb(&[0.0, 0.0]), &snap);
        match r {
            MatchResult::Found { name, index, .. } => {
                assert_eq!(name, "first");
                assert_eq!(index, 1);
            }
            MatchResult::NotFound => panic!("expected a match"),
        }
    }

    #[test]
    fn test_multiple_embeddings_same_identity() {
        let snap = snapshot(&[
            (&[5.0, 5.0], "carol"),
            (&[0.1, 0.0], "dave"),
            (&[0.0, 0.05], "carol"),
        ]);
        let r = EuclideanMatcher::new(0.6).find(&emb(&[0.0, 0.0]), &snap);
        assert_eq!(r.name(), Some("carol"));
    }

    #[test]
    fn test_idempotent() {
        let snap = snapshot(&[(&[0.0, 0.0], "alice"), (&[0.2, 0.2], "bob")]);
        let m = EuclideanMatcher::default();
        let q = emb(&[0.15, 0.1]);
        let first = m.find(&q, &snap);
        for _ in 0..5 {
            assert_eq!(m.find(&q, &snap), first);
        }
    }
}

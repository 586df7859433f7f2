//! Nearest-neighbor identity matcher.
//!
//! Ranks every enrolled identity by the distance of its closest sample to the
//! query, then applies two independent policies: an absolute distance ceiling
//! and a minimum gap between the best and second-best identity.

use crate::repository::RepositorySnapshot;
use crate::types::{AcceptedMatch, Embedding, MatchCandidate, MatchDecision, RejectReason};
use thiserror::Error;

pub const DEFAULT_MAX_DISTANCE: f64 = 0.45;
pub const DEFAULT_MIN_GAP: f64 = 0.15;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchInputError {
    #[error("query embedding is empty")]
    EmptyQuery,
    #[error("query embedding contains a non-finite value")]
    NonFinite,
    #[error("query embedding has {actual} dimensions, enrolled embeddings have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Accept/reject thresholds, both on raw distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Largest best-distance still accepted (inclusive).
    pub max_distance: f64,
    /// Smallest accepted margin between the best and second-best identity (inclusive).
    pub min_gap: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE,
            min_gap: DEFAULT_MIN_GAP,
        }
    }
}

/// Decision plus the two top-ranked candidates it was based on.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub decision: MatchDecision,
    pub best: Option<MatchCandidate>,
    pub runner_up: Option<MatchCandidate>,
}

impl MatchOutcome {
    fn rejected(
        reason: RejectReason,
        best: Option<MatchCandidate>,
        runner_up: Option<MatchCandidate>,
    ) -> Self {
        Self {
            decision: MatchDecision::Rejected { reason },
            best,
            runner_up,
        }
    }

    /// Distance margin between the top two candidates, if there are two.
    pub fn gap(&self) -> Option<f64> {
        match (&self.best, &self.runner_up) {
            (Some(b), Some(r)) => Some(r.best_distance - b.best_distance),
            _ => None,
        }
    }

    /// One-line operator summary of the decision.
    pub fn summary(&self) -> String {
        let best = self.best.as_ref();
        let runner_up = self.runner_up.as_ref();
        match (&self.decision, best) {
            (MatchDecision::Accepted(m), _) => {
                format!("Clear match: {} at {:.1}%", m.display_name, m.confidence())
            }
            (MatchDecision::Rejected { reason: RejectReason::TooWeak }, Some(b)) => format!(
                "Match too weak: best was {} at {:.1}%",
                b.display_name,
                b.confidence()
            ),
            (MatchDecision::Rejected { reason: RejectReason::Ambiguous }, Some(b)) => {
                let r = runner_up.map_or("?", |r| r.display_name.as_str());
                let r_conf = runner_up.map_or(0.0, |r| r.confidence());
                format!(
                    "Ambiguous match: {} ({:.1}%) vs {} ({:.1}%) - gap only {:.2}",
                    b.display_name,
                    b.confidence(),
                    r,
                    r_conf,
                    self.gap().unwrap_or(0.0)
                )
            }
            (MatchDecision::Rejected { reason: RejectReason::MultipleIdentitiesTied }, Some(b)) => {
                let r = runner_up.map_or("?", |r| r.display_name.as_str());
                format!(
                    "Tied match: {} and {} both at {:.1}%",
                    b.display_name,
                    r,
                    b.confidence()
                )
            }
            (MatchDecision::Rejected { .. }, _) => "Recognition disabled: no enrolled identities".to_string(),
        }
    }
}

/// Strategy for deciding which enrolled identity, if any, a query embedding belongs to.
pub trait Matcher {
    fn decide(
        &self,
        query: &Embedding,
        snapshot: &RepositorySnapshot,
    ) -> Result<MatchOutcome, MatchInputError>;
}

/// Reject embeddings the matcher must never see.
pub fn validate_query(query: &Embedding, dimension: Option<usize>) -> Result<(), MatchInputError> {
    if query.is_empty() {
        return Err(MatchInputError::EmptyQuery);
    }
    if !query.is_finite() {
        return Err(MatchInputError::NonFinite);
    }
    match dimension {
        Some(expected) if expected != query.dim() => Err(MatchInputError::DimensionMismatch {
            expected,
            actual: query.dim(),
        }),
        _ => Ok(()),
    }
}

/// Compare a query against every identity, returning candidates sorted by distance.
///
/// Each identity is represented by its closest enrolled sample, never an average.
/// The sort is stable, so equal distances keep snapshot order.
pub fn rank(query: &Embedding, snapshot: &RepositorySnapshot) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = snapshot
        .identities()
        .iter()
        .map(|identity| {
            let mut best_distance = f64::INFINITY;
            let mut best_embedding_index = 0;
            for (i, stored) in identity.embeddings.iter().enumerate() {
                let d = query.euclidean_distance(stored);
                if d < best_distance {
                    best_distance = d;
                    best_embedding_index = i;
                }
            }
            MatchCandidate {
                identity_id: identity.id.clone(),
                display_name: identity.display_name.clone(),
                best_distance,
                best_embedding_index,
            }
        })
        .collect();

    candidates.sort_by(|a, b| a.best_distance.total_cmp(&b.best_distance));
    candidates
}

/// Euclidean nearest-neighbor matcher with distance and ambiguity-gap thresholds.
///
/// Always ranks ALL identities before deciding: a closer identity later in
/// storage order must be able to override an earlier one that also passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighborMatcher {
    policy: MatchPolicy,
}

impl NearestNeighborMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }
}

impl Matcher for NearestNeighborMatcher {
    fn decide(
        &self,
        query: &Embedding,
        snapshot: &RepositorySnapshot,
    ) -> Result<MatchOutcome, MatchInputError> {
        validate_query(query, None)?;
        if snapshot.is_empty() {
            return Ok(MatchOutcome::rejected(RejectReason::NoFace, None, None));
        }
        validate_query(query, snapshot.dimension())?;

        let mut ranked = rank(query, snapshot).into_iter();
        let best = ranked.next();
        let runner_up = ranked.next();

        let Some(first) = best.as_ref() else {
            return Ok(MatchOutcome::rejected(RejectReason::NoFace, None, None));
        };

        let reason = if first.best_distance > self.policy.max_distance {
            Some(RejectReason::TooWeak)
        } else {
            match runner_up.as_ref().map(|r| r.best_distance - first.best_distance) {
                // Checked before min_gap, so a tie is rejected even when min_gap is 0.
                Some(gap) if gap <= 0.0 => Some(RejectReason::MultipleIdentitiesTied),
                Some(gap) if gap < self.policy.min_gap => Some(RejectReason::Ambiguous),
                _ => None,
            }
        };

        let outcome = match reason {
            Some(reason) => MatchOutcome::rejected(reason, best, runner_up),
            None => MatchOutcome {
                decision: MatchDecision::Accepted(AcceptedMatch::from(first)),
                best,
                runner_up,
            },
        };

        tracing::debug!(
            accepted = outcome.decision.is_accepted(),
            best_distance = outcome.best.as_ref().map(|c| c.best_distance),
            gap = outcome.gap(),
            "match decided"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn identity(id: &str, samples: &[&[f64]]) -> Identity {
        Identity {
            id: id.into(),
            display_name: id.to_uppercase(),
            embeddings: samples.iter().map(|s| Embedding::new(s.to_vec())).collect(),
            active: true,
        }
    }

    fn origin() -> Embedding {
        Embedding::new(vec![0.0, 0.0])
    }

    fn matcher(max_distance: f64, min_gap: f64) -> NearestNeighborMatcher {
        NearestNeighborMatcher::new(MatchPolicy {
            max_distance,
            min_gap,
        })
    }

    fn accepted_id(outcome: &MatchOutcome) -> Option<&str> {
        match &outcome.decision {
            MatchDecision::Accepted(m) => Some(m.identity_id.as_str()),
            MatchDecision::Rejected { .. } => None,
        }
    }

    fn rejection(outcome: &MatchOutcome) -> Option<RejectReason> {
        match &outcome.decision {
            MatchDecision::Rejected { reason } => Some(*reason),
            MatchDecision::Accepted(_) => None,
        }
    }

    #[test]
    fn test_clear_winner_accepted() {
        let snapshot = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.3, 0.0]]),
            identity("b", &[&[0.0, 0.5]]),
        ]);
        let outcome = matcher(0.45, 0.15).decide(&origin(), &snapshot).unwrap();
        match &outcome.decision {
            MatchDecision::Accepted(m) => {
                assert_eq!(m.identity_id, "a");
                assert_eq!(m.confidence(), 70.0);
            }
            other => panic!("expected accept, got {other:?}"),
        }
        assert_eq!(outcome.runner_up.as_ref().unwrap().identity_id, "b");
        assert!(outcome.summary().starts_with("Clear match: A"));
    }

    #[test]
    fn test_close_runner_up_is_ambiguous() {
        let snapshot = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.3, 0.0]]),
            identity("b", &[&[0.0, 0.4]]),
        ]);
        let outcome = matcher(0.45, 0.15).decide(&origin(), &snapshot).unwrap();
        assert_eq!(rejection(&outcome), Some(RejectReason::Ambiguous));
        assert!(outcome.summary().starts_with("Ambiguous match: A"));
    }

    #[test]
    fn test_single_distant_identity_too_weak() {
        let snapshot = RepositorySnapshot::from_identities(vec![identity("a", &[&[0.5, 0.0]])]);
        let outcome = matcher(0.45, 0.15).decide(&origin(), &snapshot).unwrap();
        assert_eq!(rejection(&outcome), Some(RejectReason::TooWeak));
    }

    #[test]
    fn test_distance_threshold_is_inclusive() {
        let at = RepositorySnapshot::from_identities(vec![identity("a", &[&[0.5, 0.0]])]);
        let above = RepositorySnapshot::from_identities(vec![identity("a", &[&[0.501, 0.0]])]);
        let m = matcher(0.5, 0.15);
        assert_eq!(accepted_id(&m.decide(&origin(), &at).unwrap()), Some("a"));
        assert_eq!(
            rejection(&m.decide(&origin(), &above).unwrap()),
            Some(RejectReason::TooWeak)
        );
    }

    #[test]
    fn test_gap_threshold_is_inclusive() {
        let at = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.25, 0.0]]),
            identity("b", &[&[0.0, 0.5]]),
        ]);
        let below = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.25, 0.0]]),
            identity("b", &[&[0.0, 0.49]]),
        ]);
        let m = matcher(1.0, 0.25);
        assert_eq!(accepted_id(&m.decide(&origin(), &at).unwrap()), Some("a"));
        assert_eq!(
            rejection(&m.decide(&origin(), &below).unwrap()),
            Some(RejectReason::Ambiguous)
        );
    }

    #[test]
    fn test_identity_uses_closest_sample() {
        let snapshot = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.9, 0.0], &[0.1, 0.0], &[0.7, 0.0]]),
            identity("b", &[&[0.0, 0.6]]),
        ]);
        let ranked = rank(&origin(), &snapshot);
        assert_eq!(ranked[0].identity_id, "a");
        assert_eq!(ranked[0].best_embedding_index, 1);
        assert!((ranked[0].best_distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_later_closer_identity_overrides_earlier() {
        // "a" passes the threshold on its own but "c" is closer.
        let snapshot = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.4, 0.0]]),
            identity("b", &[&[0.0, 0.9]]),
            identity("c", &[&[0.05, 0.0]]),
        ]);
        let outcome = matcher(0.45, 0.15).decide(&origin(), &snapshot).unwrap();
        assert_eq!(accepted_id(&outcome), Some("c"));
    }

    #[test]
    fn test_default_policy_boundaries_accepted() {
        // 0.45 - 0.30 lands a hair above 0.15 in f64.
        let gap_at_min = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.30, 0.0]]),
            identity("b", &[&[0.0, 0.45]]),
        ]);
        let outcome = NearestNeighborMatcher::default()
            .decide(&origin(), &gap_at_min)
            .unwrap();
        assert_eq!(accepted_id(&outcome), Some("a"));

        let at_max = RepositorySnapshot::from_identities(vec![identity("a", &[&[0.45, 0.0]])]);
        let outcome = NearestNeighborMatcher::default()
            .decide(&origin(), &at_max)
            .unwrap();
        assert_eq!(accepted_id(&outcome), Some("a"));
        assert_eq!(outcome.best.unwrap().best_distance, DEFAULT_MAX_DISTANCE);
    }

    #[test]
    fn test_exact_tie_rejected_even_with_zero_min_gap() {
        let snapshot = RepositorySnapshot::from_identities(vec![
            identity("a", &[&[0.25, 0.0]]),
            identity("b", &[&[0.0, 0.25]]),
        ]);
        let outcome = matcher(0.45, 0.0).decide(&origin(), &snapshot).unwrap();
        assert_eq!(rejection(&outcome), Some(RejectReason::MultipleIdentitiesTied));
    }

    #[test]
    fn test_permuting_identities_never_changes_decision() {
        let mut identities = vec![
            identity("a", &[&[0.8, 0.1]]),
            identity("b", &[&[0.1, 0.05], &[0.6, 0.6]]),
            identity("c", &[&[0.0, 0.7]]),
            identity("d", &[&[0.5, 0.5]]),
            identity("e", &[&[-0.6, 0.2]]),
        ];
        let m = NearestNeighborMatcher::default();
        let expected = m
            .decide(&origin(), &RepositorySnapshot::from_identities(identities.clone()))
            .unwrap()
            .decision;
        assert_eq!(accepted_id_of(&expected), Some("b"));

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            identities.shuffle(&mut rng);
            let snapshot = RepositorySnapshot::from_identities(identities.clone());
            assert_eq!(m.decide(&origin(), &snapshot).unwrap().decision, expected);
        }
    }

    fn accepted_id_of(decision: &MatchDecision) -> Option<&str> {
        match decision {
            MatchDecision::Accepted(m) => Some(m.identity_id.as_str()),
            MatchDecision::Rejected { .. } => None,
        }
    }

    #[test]
    fn test_empty_snapshot_rejects_without_scanning() {
        let outcome = NearestNeighborMatcher::default()
            .decide(&origin(), &RepositorySnapshot::empty())
            .unwrap();
        assert_eq!(rejection(&outcome), Some(RejectReason::NoFace));
        assert!(outcome.best.is_none());
    }

    #[test]
    fn test_invalid_queries_rejected_at_boundary() {
        let snapshot = RepositorySnapshot::from_identities(vec![identity("a", &[&[0.1, 0.0]])]);
        let m = NearestNeighborMatcher::default();
        assert_eq!(
            m.decide(&Embedding::new(vec![]), &snapshot),
            Err(MatchInputError::EmptyQuery)
        );
        assert_eq!(
            m.decide(&Embedding::new(vec![f64::NAN, 0.0]), &snapshot),
            Err(MatchInputError::NonFinite)
        );
        assert_eq!(
            m.decide(&Embedding::new(vec![0.0, 0.0, 0.0]), &snapshot),
            Err(MatchInputError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        );
    }
}

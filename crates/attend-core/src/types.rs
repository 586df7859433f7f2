use serde::{Deserialize, Serialize};
use std::fmt;

/// Face embedding vector produced by an external encoder (typically 128-dimensional).
///
/// Immutable once constructed; the matcher only ever borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of components.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers are expected to have checked that both sides share a dimension;
    /// extra trailing components on either side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

impl From<Vec<f64>> for Embedding {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// Convert a distance into a reporting confidence percentage, rounded to one decimal.
///
/// Only used for display; every accept/reject decision is made on the raw distance.
pub fn confidence_from_distance(distance: f64) -> f64 {
    ((1.0 - distance) * 1000.0).round() / 10.0
}

/// An enrolled person with one or more reference embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque identifier assigned by the enrollment store.
    pub id: String,
    pub display_name: String,
    pub embeddings: Vec<Embedding>,
    pub active: bool,
}

impl Identity {
    /// Whether this identity may take part in matching.
    pub fn is_matchable(&self) -> bool {
        self.active && !self.embeddings.is_empty()
    }
}

/// Embeddings detected in a single frame. May be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Observation {
    embeddings: Vec<Embedding>,
}

impl Observation {
    pub fn new(embeddings: Vec<Embedding>) -> Self {
        Self { embeddings }
    }

    /// A frame in which no face was found.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Number of faces in the frame.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// The embedding used for matching. Only the first face is ever matched.
    pub fn first(&self) -> Option<&Embedding> {
        self.embeddings.first()
    }
}

/// One identity's closest enrolled sample to a query embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub identity_id: String,
    pub display_name: String,
    pub best_distance: f64,
    pub best_embedding_index: usize,
}

impl MatchCandidate {
    pub fn confidence(&self) -> f64 {
        confidence_from_distance(self.best_distance)
    }
}

/// A match that cleared both the distance and the ambiguity thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedMatch {
    pub identity_id: String,
    pub display_name: String,
    pub distance: f64,
}

impl AcceptedMatch {
    pub fn confidence(&self) -> f64 {
        confidence_from_distance(self.distance)
    }
}

impl From<&MatchCandidate> for AcceptedMatch {
    fn from(c: &MatchCandidate) -> Self {
        Self {
            identity_id: c.identity_id.clone(),
            display_name: c.display_name.clone(),
            distance: c.best_distance,
        }
    }
}

/// Why a query embedding did not produce an accepted match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Best distance above `max_distance`.
    TooWeak,
    /// Top two identities closer together than `min_gap`.
    Ambiguous,
    /// Nothing to match against (no face, or recognition disabled).
    NoFace,
    /// Top two identities at exactly the same distance.
    MultipleIdentitiesTied,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::TooWeak => "too_weak",
            RejectReason::Ambiguous => "ambiguous",
            RejectReason::NoFace => "no_face",
            RejectReason::MultipleIdentitiesTied => "multiple_identities_tied",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one matcher invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Accepted(AcceptedMatch),
    Rejected { reason: RejectReason },
}

impl MatchDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MatchDecision::Accepted(_))
    }
}

//! Enrolled identity repository.
//!
//! A [`Repository`] owns the current [`RepositorySnapshot`] behind an `Arc`.
//! Matching always runs against one snapshot handed out by
//! [`Repository::snapshot`]; [`Repository::reload`] builds a fresh snapshot and
//! swaps the reference, so a comparison in progress never sees embeddings change.

use crate::store::RecordDecodeError;
use crate::types::Identity;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("identity source not found: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("failed to read identity source {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The matchable identity set at one point in time.
///
/// Construction drops inactive identities, identities without embeddings,
/// non-finite embeddings and embeddings whose dimension differs from the first one seen.
#[derive(Debug, Default)]
pub struct RepositorySnapshot {
    identities: Vec<Identity>,
    dimension: Option<usize>,
}

impl RepositorySnapshot {
    /// An empty snapshot; recognition is disabled while it is current.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let mut dimension = None;
        let mut kept = Vec::new();

        for mut identity in identities {
            if !identity.active {
                tracing::debug!(id = %identity.id, "skipping inactive identity");
                continue;
            }
            identity.embeddings.retain(|e| {
                if e.is_empty() || !e.is_finite() {
                    return false;
                }
                let dim = *dimension.get_or_insert(e.dim());
                dim == e.dim()
            });
            if identity.embeddings.is_empty() {
                tracing::debug!(id = %identity.id, "skipping identity without usable embeddings");
                continue;
            }
            kept.push(identity);
        }

        Self {
            identities: kept,
            dimension,
        }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Embedding dimension shared by every stored sample, if any are stored.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

/// A record the loader could not use.
#[derive(Debug)]
pub struct SkippedRecord {
    /// Where the record came from (file name for directory sources).
    pub origin: String,
    pub error: RecordDecodeError,
}

impl fmt::Display for SkippedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.error)
    }
}

/// Outcome of one successful load.
#[derive(Debug)]
pub struct LoadReport {
    pub snapshot: RepositorySnapshot,
    pub skipped: Vec<SkippedRecord>,
}

impl LoadReport {
    /// Number of identities that made it into the snapshot.
    pub fn loaded(&self) -> usize {
        self.snapshot.len()
    }
}

/// Summary returned by [`Repository::reload`] after the swap.
#[derive(Debug)]
pub struct ReloadSummary {
    pub loaded: usize,
    pub skipped: Vec<SkippedRecord>,
}

/// Where identity records come from.
pub trait IdentitySource: Send + Sync {
    fn load(&self) -> Result<LoadReport, LoadError>;

    /// Human-readable location, for logs and status messages.
    fn describe(&self) -> String;
}

/// Fixed in-memory identity list. Useful for hosts that enroll through their own store.
pub struct MemorySource {
    identities: Vec<Identity>,
}

impl MemorySource {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }
}

impl IdentitySource for MemorySource {
    fn load(&self) -> Result<LoadReport, LoadError> {
        Ok(LoadReport {
            snapshot: RepositorySnapshot::from_identities(self.identities.iter().cloned()),
            skipped: Vec::new(),
        })
    }

    fn describe(&self) -> String {
        format!("memory ({} records)", self.identities.len())
    }
}

/// Shared handle to the current snapshot of enrolled identities.
pub struct Repository {
    source: Box<dyn IdentitySource>,
    current: RwLock<Arc<RepositorySnapshot>>,
}

impl Repository {
    /// Create a repository over `source`. Starts empty until [`reload`](Self::reload) succeeds.
    pub fn new(source: impl IdentitySource + 'static) -> Self {
        Self {
            source: Box::new(source),
            current: RwLock::new(Arc::new(RepositorySnapshot::empty())),
        }
    }

    /// The snapshot to match against. Stays valid across later reloads.
    pub fn snapshot(&self) -> Arc<RepositorySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True iff the current snapshot holds at least one identity.
    pub fn is_enabled(&self) -> bool {
        !self.snapshot().is_empty()
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    /// Load from the source and swap in the result.
    ///
    /// On `LoadError` an empty snapshot is swapped in, disabling recognition
    /// until a later reload succeeds.
    pub fn reload(&self) -> Result<ReloadSummary, LoadError> {
        match self.source.load() {
            Ok(report) => {
                let loaded = report.loaded();
                for skipped in &report.skipped {
                    tracing::warn!(origin = %skipped.origin, error = %skipped.error, "skipped identity record");
                }
                self.swap(report.snapshot);
                tracing::info!(
                    source = %self.source.describe(),
                    loaded,
                    skipped = report.skipped.len(),
                    "identity repository loaded"
                );
                Ok(ReloadSummary {
                    loaded,
                    skipped: report.skipped,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "identity repository load failed; recognition disabled");
                self.swap(RepositorySnapshot::empty());
                Err(e)
            }
        }
    }

    fn swap(&self, snapshot: RepositorySnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }
}

//! attend-core: Sign-in match decision engine.
//!
//! Matches live face embeddings against enrolled identities by Euclidean
//! nearest neighbor, debounces detections across frames, and holds an
//! accepted match until a human confirms it. Face detection and embedding
//! extraction happen upstream; this crate only consumes embeddings.

pub mod event;
pub mod matcher;
pub mod repository;
pub mod session;
pub mod store;
pub mod types;

pub use event::{Command, Envelope, Event, UnknownCommand};
pub use matcher::{MatchInputError, MatchOutcome, MatchPolicy, Matcher, NearestNeighborMatcher};
pub use repository::{
    IdentitySource, LoadError, LoadReport, MemorySource, ReloadSummary, Repository,
    RepositorySnapshot, SkippedRecord,
};
pub use session::{Feedback, Session, SessionConfig, SessionMachine, SessionState};
pub use store::{decode_embedding, encode_embedding, DirectorySource, RecordDecodeError};
pub use types::{
    AcceptedMatch, Embedding, Identity, MatchCandidate, MatchDecision, Observation, RejectReason,
};

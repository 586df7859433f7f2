//! Sign-in session state machine.
//!
//! ```text
//!            start                    N non-empty frames, accepted
//!   Idle ───────────▶ Detecting ──────────────────────────────▶ AwaitingConfirmation
//!    ▲                  │  │                                        │
//!    │    rejected      │  │ empty frame: count -= 1 (floor 0)      │ confirm / stop
//!    └──────────────────┘  └───────────────                         │
//!    ◀──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `stop` returns to Idle from any state; `start` restarts detection from any state.
//! Every method returns the events produced by the transition, in order.

use crate::event::Event;
use crate::matcher::{Matcher, NearestNeighborMatcher};
use crate::repository::RepositorySnapshot;
use crate::types::{AcceptedMatch, MatchDecision, Observation};
use serde::Serialize;

pub const DEFAULT_DETECTION_THRESHOLD: u32 = 5;

const NOT_RECOGNIZED_MESSAGE: &str = "Face not recognized - please try again";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Detecting,
    AwaitingConfirmation,
}

/// Mutable session fields. Only [`SessionMachine`] changes them.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    state: SessionState,
    consecutive_count: u32,
    pending: Option<AcceptedMatch>,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            consecutive_count: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Debounce run length; non-zero only while detecting.
    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }

    /// Match awaiting confirmation; set only while awaiting confirmation.
    pub fn pending(&self) -> Option<&AcceptedMatch> {
        self.pending.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Non-empty frames needed before the matcher runs. At least 1.
    pub detection_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
        }
    }
}

/// What a preview overlay should show for the current frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    Idle { faces: usize },
    Detecting { count: u32, threshold: u32 },
    Confirming {
        display_name: String,
        confidence: f64,
        face_visible: bool,
    },
}

/// Debounce-then-confirm controller for one terminal.
pub struct SessionMachine<M = NearestNeighborMatcher> {
    session: Session,
    config: SessionConfig,
    matcher: M,
}

impl<M: Matcher> SessionMachine<M> {
    pub fn new(config: SessionConfig, matcher: M) -> Self {
        Self {
            session: Session::idle(),
            config: SessionConfig {
                detection_threshold: config.detection_threshold.max(1),
            },
            matcher,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Begin (or restart) detection, discarding any progress or pending match.
    pub fn start(&mut self) -> Vec<Event> {
        if let Some(discarded) = self.session.pending.take() {
            tracing::info!(identity = %discarded.identity_id, "pending match discarded by restart");
        }
        self.session = Session {
            state: SessionState::Detecting,
            consecutive_count: 0,
            pending: None,
        };
        tracing::info!("detection started");
        vec![Event::status("Face detection started")]
    }

    /// Return to Idle from any state.
    pub fn stop(&mut self) -> Vec<Event> {
        let was = self.session.state;
        self.session = Session::idle();
        tracing::info!(from = ?was, "detection stopped");
        vec![Event::status("Face detection stopped")]
    }

    /// Commit the pending match, if there is one. Always ends in Idle.
    pub fn confirm(&mut self) -> Vec<Event> {
        let pending = self.session.pending.take();
        self.session = Session::idle();
        match pending {
            Some(m) => {
                tracing::info!(identity = %m.identity_id, confidence = m.confidence(), "sign-in confirmed");
                vec![
                    Event::confirmed(&m),
                    Event::status(format!("Sign-in confirmed for {}", m.display_name)),
                ]
            }
            None => {
                tracing::debug!("confirm with nothing pending");
                vec![Event::status("No recognition result to confirm")]
            }
        }
    }

    /// Feed one frame's observation.
    pub fn tick(&mut self, observation: &Observation, snapshot: &RepositorySnapshot) -> Vec<Event> {
        if self.session.state != SessionState::Detecting {
            return Vec::new();
        }

        let Some(query) = observation.first() else {
            self.session.consecutive_count = self.session.consecutive_count.saturating_sub(1);
            tracing::trace!(count = self.session.consecutive_count, "empty frame");
            return Vec::new();
        };

        self.session.consecutive_count += 1;
        tracing::trace!(
            count = self.session.consecutive_count,
            threshold = self.config.detection_threshold,
            faces = observation.len(),
            "face frame"
        );
        if self.session.consecutive_count < self.config.detection_threshold {
            return Vec::new();
        }

        let outcome = match self.matcher.decide(query, snapshot) {
            Ok(outcome) => outcome,
            Err(e) => {
                // The frame is not counted; the next valid frame retries the match.
                self.session.consecutive_count -= 1;
                tracing::warn!(error = %e, "unusable query embedding");
                return vec![Event::error(format!("Recognition input rejected: {e}"))];
            }
        };

        let summary = Event::status(outcome.summary());
        match outcome.decision {
            MatchDecision::Accepted(m) => {
                tracing::info!(identity = %m.identity_id, confidence = m.confidence(), "match awaiting confirmation");
                let events = vec![
                    summary,
                    Event::recognition(&m),
                    Event::status(format!("Waiting for confirmation: {}", m.display_name)),
                ];
                self.session = Session {
                    state: SessionState::AwaitingConfirmation,
                    consecutive_count: 0,
                    pending: Some(m),
                };
                events
            }
            MatchDecision::Rejected { reason } => {
                tracing::info!(%reason, "match rejected");
                self.session = Session::idle();
                vec![
                    summary,
                    Event::SigninUnknown {
                        reason,
                        message: NOT_RECOGNIZED_MESSAGE.to_string(),
                    },
                ]
            }
        }
    }

    /// Overlay hint for a frame. Never changes state.
    pub fn feedback(&self, observation: &Observation) -> Feedback {
        match (&self.session.state, &self.session.pending) {
            (SessionState::AwaitingConfirmation, Some(m)) => Feedback::Confirming {
                display_name: m.display_name.clone(),
                confidence: m.confidence(),
                face_visible: !observation.is_empty(),
            },
            (SessionState::Detecting, _) => Feedback::Detecting {
                count: self.session.consecutive_count,
                threshold: self.config.detection_threshold,
            },
            _ => Feedback::Idle {
                faces: observation.len(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{MatchInputError, MatchOutcome, MatchPolicy};
    use crate::types::{Embedding, Identity, RejectReason};
    use std::cell::Cell;

    /// Counts how often the wrapped matcher runs.
    struct CountingMatcher {
        inner: NearestNeighborMatcher,
        calls: Cell<usize>,
    }

    impl CountingMatcher {
        fn new() -> Self {
            Self {
                inner: NearestNeighborMatcher::new(MatchPolicy::default()),
                calls: Cell::new(0),
            }
        }
    }

    impl Matcher for CountingMatcher {
        fn decide(
            &self,
            query: &Embedding,
            snapshot: &RepositorySnapshot,
        ) -> Result<MatchOutcome, MatchInputError> {
            self.calls.set(self.calls.get() + 1);
            self.inner.decide(query, snapshot)
        }
    }

    fn snapshot() -> RepositorySnapshot {
        RepositorySnapshot::from_identities(vec![
            Identity {
                id: "1".into(),
                display_name: "Alice".into(),
                embeddings: vec![Embedding::new(vec![0.0, 0.0])],
                active: true,
            },
            Identity {
                id: "2".into(),
                display_name: "Bob".into(),
                embeddings: vec![Embedding::new(vec![1.0, 1.0])],
                active: true,
            },
        ])
    }

    fn alice_frame() -> Observation {
        Observation::new(vec![Embedding::new(vec![0.1, 0.0])])
    }

    fn stranger_frame() -> Observation {
        Observation::new(vec![Embedding::new(vec![-2.0, -2.0])])
    }

    fn machine() -> SessionMachine<CountingMatcher> {
        SessionMachine::new(SessionConfig::default(), CountingMatcher::new())
    }

    fn kinds(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(Event::kind).collect()
    }

    fn assert_invariants(session: &Session) {
        if session.state() != SessionState::Detecting {
            assert_eq!(session.consecutive_count(), 0);
        }
        assert_eq!(
            session.pending().is_some(),
            session.state() == SessionState::AwaitingConfirmation
        );
    }

    #[test]
    fn test_starts_idle_and_ignores_frames() {
        let mut m = machine();
        let snap = snapshot();
        assert_eq!(m.session().state(), SessionState::Idle);
        for _ in 0..10 {
            assert!(m.tick(&alice_frame(), &snap).is_empty());
        }
        assert_eq!(m.session().consecutive_count(), 0);
        assert_eq!(m.matcher.calls.get(), 0);
    }

    #[test]
    fn test_threshold_frames_trigger_one_recognition() {
        let mut m = machine();
        let snap = snapshot();
        m.start();

        let mut all = Vec::new();
        for _ in 0..5 {
            all.extend(m.tick(&alice_frame(), &snap));
            assert_invariants(m.session());
        }
        assert_eq!(m.matcher.calls.get(), 1);
        assert_eq!(
            all.iter().filter(|e| e.kind() == "signin_recognition").count(),
            1
        );
        assert_eq!(m.session().state(), SessionState::AwaitingConfirmation);
        assert_eq!(m.session().pending().unwrap().identity_id, "1");

        // Frames while awaiting confirmation never re-run the matcher.
        for _ in 0..10 {
            assert!(m.tick(&alice_frame(), &snap).is_empty());
        }
        assert_eq!(m.matcher.calls.get(), 1);
    }

    #[test]
    fn test_fewer_than_threshold_frames_never_match() {
        let mut m = machine();
        let snap = snapshot();
        m.start();
        for _ in 0..4 {
            assert!(m.tick(&alice_frame(), &snap).is_empty());
        }
        assert_eq!(m.session().consecutive_count(), 4);
        assert_eq!(m.matcher.calls.get(), 0);
    }

    #[test]
    fn test_empty_frames_decay_by_one() {
        let mut m = machine();
        let snap = snapshot();
        m.start();
        for _ in 0..3 {
            m.tick(&alice_frame(), &snap);
        }
        m.tick(&Observation::empty(), &snap);
        assert_eq!(m.session().consecutive_count(), 2);

        // Dropout does not discard progress: three more faces reach five.
        m.tick(&alice_frame(), &snap);
        m.tick(&alice_frame(), &snap);
        assert_eq!(m.matcher.calls.get(), 0);
        let events = m.tick(&alice_frame(), &snap);
        assert!(kinds(&events).contains(&"signin_recognition"));
    }

    #[test]
    fn test_decay_floor_is_zero() {
        let mut m = machine();
        let snap = snapshot();
        m.start();
        m.tick(&alice_frame(), &snap);
        for _ in 0..5 {
            m.tick(&Observation::empty(), &snap);
            assert_eq!(m.session().consecutive_count(), 0);
        }
        assert_eq!(m.session().state(), SessionState::Detecting);
    }

    #[test]
    fn test_rejection_returns_to_idle() {
        let mut m = machine();
        let snap = snapshot();
        m.start();
        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(m.tick(&stranger_frame(), &snap));
        }
        assert_eq!(kinds(&events), vec!["status", "signin_unknown"]);
        match &events[1] {
            Event::SigninUnknown { reason, .. } => assert_eq!(*reason, RejectReason::TooWeak),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.session().state(), SessionState::Idle);
        assert_invariants(m.session());
    }

    #[test]
    fn test_confirm_emits_confirmed_and_resets() {
        let mut m = machine();
        let snap = snapshot();
        m.start();
        for _ in 0..5 {
            m.tick(&alice_frame(), &snap);
        }
        let events = m.confirm();
        assert_eq!(kinds(&events), vec!["signin_confirmed", "status"]);
        match &events[0] {
            Event::SigninConfirmed {
                identity_id,
                display_name,
                confidence,
            } => {
                assert_eq!(identity_id, "1");
                assert_eq!(display_name, "Alice");
                assert_eq!(*confidence, 90.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.session().state(), SessionState::Idle);
        assert_invariants(m.session());
    }

    #[test]
    fn test_confirm_without_pending_is_noop_status() {
        let mut m = machine();
        let events = m.confirm();
        assert_eq!(events, vec![Event::status("No recognition result to confirm")]);
        assert_eq!(m.matcher.calls.get(), 0);

        // Confirming mid-detection also performs no match.
        let snap = snapshot();
        m.start();
        m.tick(&alice_frame(), &snap);
        let events = m.confirm();
        assert_eq!(kinds(&events), vec!["status"]);
        assert_eq!(m.session().state(), SessionState::Idle);
        assert_eq!(m.matcher.calls.get(), 0);
    }

    #[test]
    fn test_stop_and_restart_discard_pending() {
        let mut m = machine();
        let snap = snapshot();
        m.start();
        for _ in 0..5 {
            m.tick(&alice_frame(), &snap);
        }
        m.stop();
        assert_eq!(m.session().state(), SessionState::Idle);
        assert!(m.session().pending().is_none());
        assert_eq!(kinds(&m.confirm()), vec!["status"]);

        m.start();
        for _ in 0..5 {
            m.tick(&alice_frame(), &snap);
        }
        m.start();
        assert_eq!(m.session().state(), SessionState::Detecting);
        assert_eq!(m.session().consecutive_count(), 0);
        assert!(m.session().pending().is_none());
    }

    #[test]
    fn test_empty_repository_rejects_as_no_face() {
        let mut m = machine();
        let snap = RepositorySnapshot::empty();
        m.start();
        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(m.tick(&alice_frame(), &snap));
        }
        assert!(events.iter().any(|e| matches!(
            e,
            Event::SigninUnknown {
                reason: RejectReason::NoFace,
                ..
            }
        )));
        assert_eq!(m.session().state(), SessionState::Idle);
    }

    #[test]
    fn test_bad_query_reports_error_and_keeps_detecting() {
        let mut m = machine();
        let snap = snapshot();
        m.start();
        for _ in 0..4 {
            m.tick(&alice_frame(), &snap);
        }
        let bad = Observation::new(vec![Embedding::new(vec![0.1, 0.0, 0.0])]);
        let events = m.tick(&bad, &snap);
        assert_eq!(kinds(&events), vec!["error"]);
        assert_eq!(m.session().state(), SessionState::Detecting);
        assert_eq!(m.session().consecutive_count(), 4);

        let events = m.tick(&alice_frame(), &snap);
        assert!(kinds(&events).contains(&"signin_recognition"));
    }

    #[test]
    fn test_threshold_of_zero_is_clamped() {
        let mut m = SessionMachine::new(
            SessionConfig {
                detection_threshold: 0,
            },
            NearestNeighborMatcher::default(),
        );
        assert_eq!(m.config().detection_threshold, 1);
        m.start();
        let events = m.tick(&alice_frame(), &snapshot());
        assert!(kinds(&events).contains(&"signin_recognition"));
    }

    #[test]
    fn test_feedback_follows_state() {
        let mut m = machine();
        let snap = snapshot();
        assert_eq!(m.feedback(&alice_frame()), Feedback::Idle { faces: 1 });
        m.start();
        m.tick(&alice_frame(), &snap);
        assert_eq!(
            m.feedback(&alice_frame()),
            Feedback::Detecting {
                count: 1,
                threshold: 5
            }
        );
        for _ in 0..4 {
            m.tick(&alice_frame(), &snap);
        }
        match m.feedback(&Observation::empty()) {
            Feedback::Confirming {
                display_name,
                face_visible,
                ..
            } => {
                assert_eq!(display_name, "Alice");
                assert!(!face_visible);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! Commands accepted from the host and events reported back to it.

use crate::types::{AcceptedMatch, RejectReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Commands the host can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Begin a sign-in attempt.
    Start,
    /// Abandon the attempt (also accepted as `cancel`).
    Stop,
    /// Commit the pending match.
    Confirm,
    /// Re-read the identity repository.
    Reload,
    /// Stop the service.
    Shutdown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized command: {0}")]
pub struct UnknownCommand(pub String);

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Confirm => "confirm",
            Command::Reload => "reload",
            Command::Shutdown => "shutdown",
        }
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    /// Accepts the short words and the longer names older hosts send.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" | "start_detection" => Ok(Command::Start),
            "stop" | "cancel" | "stop_detection" => Ok(Command::Stop),
            "confirm" | "confirm_signin" => Ok(Command::Confirm),
            "reload" | "reload_workers" => Ok(Command::Reload),
            "shutdown" | "quit" => Ok(Command::Shutdown),
            _ => Err(UnknownCommand(s.trim().to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the host should hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Status {
        message: String,
    },
    SigninRecognition {
        identity_id: String,
        display_name: String,
        confidence: f64,
    },
    SigninUnknown {
        reason: RejectReason,
        message: String,
    },
    SigninConfirmed {
        identity_id: String,
        display_name: String,
        confidence: f64,
    },
    Error {
        message: String,
    },
}

impl Event {
    pub fn status(message: impl Into<String>) -> Self {
        Event::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
        }
    }

    pub fn recognition(m: &AcceptedMatch) -> Self {
        Event::SigninRecognition {
            identity_id: m.identity_id.clone(),
            display_name: m.display_name.clone(),
            confidence: m.confidence(),
        }
    }

    pub fn confirmed(m: &AcceptedMatch) -> Self {
        Event::SigninConfirmed {
            identity_id: m.identity_id.clone(),
            display_name: m.display_name.clone(),
            confidence: m.confidence(),
        }
    }

    /// Wire name of this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::SigninRecognition { .. } => "signin_recognition",
            Event::SigninUnknown { .. } => "signin_unknown",
            Event::SigninConfirmed { .. } => "signin_confirmed",
            Event::Error { .. } => "error",
        }
    }
}

/// An event stamped with the time it was emitted.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn now(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

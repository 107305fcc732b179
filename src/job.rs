//! Job identifiers and lifecycle states.
//!
//! Two state machines live here. [`JobStatus`] is what a backend reports
//! when polled:
//!
//! ```text
//!   submit() ──→ Queued ──→ Running ──→ Completed
//!                  │           │
//!                  │           ├──→ Failed(reason)
//!                  └───────────┴──→ Cancelled
//! ```
//!
//! [`RequestState`] is the dispatcher's local view of one request:
//!
//! ```text
//!   Pending ──→ Submitted ──→ Polling ──→ Completed
//!      │            │            │
//!      │            │            ├──→ TimedOut
//!      └────────────┴────────────┴──→ Failed | Cancelled
//! ```
//!
//! Local simulators may go straight from `Submitted` to `Completed`.
//! Transitions are monotonic and terminal states are permanent.

use serde::{Deserialize, Serialize};

/// Backend-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job status as reported by a backend's `poll`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in the provider queue.
    Queued {
        /// Position in queue, when the provider reports it.
        position: Option<u32>,
    },
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl JobStatus {
    pub fn queued() -> Self {
        JobStatus::Queued { position: None }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued { .. } | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued { position: Some(p) } => write!(f, "Queued (#{p})"),
            JobStatus::Queued { position: None } => write!(f, "Queued"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed(msg) => write!(f, "Failed: {msg}"),
            JobStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Dispatcher-side state of a single execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Constructed, not yet sent.
    Pending,
    /// Accepted by the backend client.
    Submitted,
    /// Waiting on an asynchronous queue.
    Polling,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Failed
                | RequestState::TimedOut
                | RequestState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Pending, Submitted | Failed | TimedOut | Cancelled) => true,
            (Submitted, Polling | Completed | Failed | TimedOut | Cancelled) => true,
            (Polling, Completed | Failed | TimedOut | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Pending => "pending",
            RequestState::Submitted => "submitted",
            RequestState::Polling => "polling",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::TimedOut => "timed-out",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

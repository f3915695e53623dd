//! Session model and lifecycle helpers.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::supervisor::AgentSupervisor;

/// Lifecycle state for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Supervisor spawned, handshake in flight.
    Initializing,
    /// Handshake complete; accepting user traffic.
    Ready,
    /// A turn is in flight; exempt from the idle sweep.
    Busy,
    /// Supervisor stopped; the session is dead.
    Closed,
}

/// The per-user binding of client traffic to one agent subprocess and its
/// workspace.
///
/// The session exclusively owns its supervisor; the registry owns the
/// session.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Owning user; immutable after creation.
    pub user_id: String,
    /// The agent subprocess supervisor.
    pub supervisor: AgentSupervisor,
    /// Per-user workspace the agent runs in.
    pub working_directory: PathBuf,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    last_active_at: Mutex<DateTime<Utc>>,
}

impl Session {
    /// Construct a session in the `Initializing` state.
    #[must_use]
    pub fn new(
        id: String,
        user_id: String,
        supervisor: AgentSupervisor,
        working_directory: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            supervisor,
            working_directory,
            created_at: now,
            state: Mutex::new(SessionState::Initializing),
            last_active_at: Mutex::new(now),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map_or(SessionState::Closed, |guard| *guard)
    }

    /// Attempt a lifecycle transition; invalid transitions are ignored.
    ///
    /// Returns whether the transition was applied.
    pub fn set_state(&self, next: SessionState) -> bool {
        let Ok(mut guard) = self.state.lock() else {
            return false;
        };
        if can_transition(*guard, next) {
            *guard = next;
            true
        } else {
            false
        }
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        if let Ok(mut guard) = self.last_active_at.lock() {
            *guard = Utc::now();
        }
    }

    /// How long the session has been idle.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self
            .last_active_at
            .lock()
            .map_or_else(|_| Utc::now(), |guard| *guard);
        (Utc::now() - last).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Whether a lifecycle transition is permitted.
fn can_transition(from: SessionState, to: SessionState) -> bool {
    matches!(
        (from, to),
        (SessionState::Initializing, SessionState::Ready)
            | (SessionState::Ready, SessionState::Busy)
            | (SessionState::Busy, SessionState::Ready)
            | (
                SessionState::Initializing | SessionState::Ready | SessionState::Busy,
                SessionState::Closed
            )
    )
}

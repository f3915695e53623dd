//! Human-in-the-loop approval gating.
//!
//! The agent asks permission before executing commands or changing files;
//! the [`broker::ApprovalBroker`] interposes on those requests, answering
//! automatically where the [`policy::PolicyEngine`] allows it and otherwise
//! parking the request in a deadline-bounded pending table while the owning
//! client decides.

pub mod broker;
pub mod policy;

use serde::{Deserialize, Serialize};

pub use broker::{ApprovalBroker, ApprovalContext, ApprovalDispatch};
pub use policy::{PolicyDecision, PolicyEngine};

/// A binary approval decision, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Accept,
    Decline,
}

impl ApprovalDecision {
    /// Wire string for this decision.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

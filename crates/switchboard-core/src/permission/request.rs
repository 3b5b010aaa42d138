//! Pending requests raised by CLI hooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::session::SessionId;

/// What a hook is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Info,
    Warning,
    Error,
    Permission,
    /// The CLI reached a stop point; a reply is its next instruction.
    Stop,
    Start,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Pending,
    Approved,
    Denied,
    /// Nobody answered in time. Never conflated with `Denied`.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decider {
    Chat,
    Web,
    Auto,
}

/// What a timed-out request means for the blocked hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    Deny,
    Allow,
}

impl TimeoutPolicy {
    /// Whether the hook may proceed given a final decision.
    pub fn allows(&self, decision: Decision) -> bool {
        match decision {
            Decision::Approved => true,
            Decision::Denied | Decision::Pending => false,
            Decision::Timeout => *self == TimeoutPolicy::Allow,
        }
    }
}

/// A hook's question to a remote decider.
///
/// Immutable once `decision` leaves `Pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: String,
    pub session_id: SessionId,
    pub kind: RequestKind,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Structured tool arguments as sent by the hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub decision: Decision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider: Option<Decider>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,

    /// Allowlist patterns a decider may approve instead of `*`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl PendingRequest {
    pub fn new(
        session_id: SessionId,
        kind: RequestKind,
        message: impl Into<String>,
        tool: Option<String>,
        args: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            kind,
            message: message.into(),
            tool,
            args,
            created_at: Utc::now(),
            decision: Decision::Pending,
            decider: None,
            resolved_at: None,
            reply: None,
            suggestions: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.decision == Decision::Pending
    }

    /// Record the final decision.
    ///
    /// Returns false (and changes nothing) if the request was already
    /// resolved or `decision` is `Pending`.
    pub fn resolve(&mut self, decision: Decision, decider: Decider, reply: Option<String>) -> bool {
        if !self.is_open() || decision == Decision::Pending {
            return false;
        }
        self.decision = decision;
        self.decider = Some(decider);
        self.resolved_at = Some(Utc::now());
        self.reply = reply;
        true
    }
}

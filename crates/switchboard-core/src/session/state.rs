//! Per-session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permission::PendingRequest;

/// Unique identifier for a session.
///
/// CLI hooks supply their own ids; [`SessionId::new`] is for sessions created
/// server-side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Waiting,
    Stopped,
}

/// Which actor currently has the right to drive the session's next input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    CliActive,
    /// CLI reached a stop point and nobody remote has claimed the session.
    CliWaiting,
    RemoteActive,
    /// No CLI process attached; the session is a remote-only record.
    Released,
}

/// A remote actor: who claimed control, or where a task/message came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Chat,
    Web,
    #[default]
    Api,
}

/// Authoritative state of one CLI session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Display name (defaults to the project directory's last component).
    pub name: String,

    pub project_dir: String,

    pub status: SessionStatus,

    pub control_state: ControlState,

    /// Whether a CLI process is currently attached.
    pub cli_attached: bool,

    /// The remote actor holding control while `remote_active`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<Actor>,

    pub started_at: DateTime<Utc>,

    pub last_activity: DateTime<Utc>,

    /// The single open request, if any. Implies `status == Waiting`.
    #[serde(default)]
    pub pending_request: Option<PendingRequest>,

    /// Soft-deletion marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: SessionId, project_dir: impl Into<String>, name: Option<String>) -> Self {
        let project_dir = project_dir.into();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(&project_dir, &id));
        let now = Utc::now();
        Self {
            id,
            name,
            project_dir,
            status: SessionStatus::Running,
            control_state: ControlState::CliActive,
            cli_attached: true,
            controller: None,
            started_at: now,
            last_activity: now,
            pending_request: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_remote_controlled(&self) -> bool {
        self.control_state == ControlState::RemoteActive
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

fn default_name(project_dir: &str, id: &SessionId) -> String {
    std::path::Path::new(project_dir)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| id.to_string())
}

//! Task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::queue::QueuedMessage;
use crate::session::{Actor, SessionId};

/// Unique identifier for a task. Caller-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A prompt to run, as submitted by a remote actor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub id: Option<TaskId>,
    /// `None` runs a custom task outside any session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub source: Actor,
    /// Defaults to the session's project directory.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl TaskRequest {
    pub fn new(session_id: Option<SessionId>, prompt: impl Into<String>) -> Self {
        Self {
            session_id,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub(crate) fn from_message(message: &QueuedMessage) -> Self {
        Self {
            session_id: Some(message.session_id.clone()),
            prompt: message.text.clone(),
            source: message.source,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub phase: TaskPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub source: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn running(id: TaskId, request: &TaskRequest, working_dir: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id: request.session_id.clone(),
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            reasoning: request.reasoning.clone(),
            phase: TaskPhase::Running,
            result: None,
            success: false,
            duration_ms: None,
            num_turns: None,
            error: None,
            source: request.source,
            working_dir,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase != TaskPhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: TaskRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert!(request.id.is_none());
        assert!(request.session_id.is_none());
        assert_eq!(request.source, Actor::Api);
    }

    #[test]
    fn running_task_copies_request() {
        let mut request = TaskRequest::new(Some(SessionId::from("s1")), "fix it");
        request.model = Some("opus".into());
        request.source = Actor::Chat;

        let task = Task::running(TaskId::from("t1"), &request, Some("/repo".into()));
        assert_eq!(task.phase, TaskPhase::Running);
        assert!(!task.is_finished());
        assert_eq!(task.model.as_deref(), Some("opus"));
        assert_eq!(task.source, Actor::Chat);
        assert!(task.started_at.is_some());

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["phase"], "running");
        assert_eq!(json["session_id"], "s1");
        assert!(json.get("error").is_none());
    }
}

//! Chat history per session.
//!
//! Turns come from two places: the dispatcher (prompt and result of every
//! remote task) and the CLI itself, which reports its own prompts and
//! replies through the hook surface.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{Event, EventBus, Topic};
use crate::dispatch::TaskId;
use crate::error::{CoreError, CoreResult};
use crate::session::{Actor, SessionId};
use crate::store::{Collection, Records};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: String,
    pub session_id: SessionId,
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// `None` when the CLI reported the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Actor>,
    pub created_at: DateTime<Utc>,
}

pub struct ChatLog {
    records: Records,
    bus: Arc<EventBus>,
}

impl ChatLog {
    pub fn new(records: Records, bus: Arc<EventBus>) -> Self {
        Self { records, bus }
    }

    /// Persist a turn and publish it on `chat:{session}`.
    pub async fn append(
        &self,
        session_id: &SessionId,
        role: TurnRole,
        content: impl Into<String>,
        task_id: Option<TaskId>,
        source: Option<Actor>,
    ) -> CoreResult<ChatTurn> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(CoreError::InvalidInput("chat turn is empty".to_string()));
        }

        let turn = ChatTurn {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            role,
            content,
            task_id,
            source,
            created_at: Utc::now(),
        };
        self.records.save(Collection::Turns, &turn.id, &turn).await?;

        self.bus.publish(
            &Topic::Chat(session_id.clone()),
            Event::ChatTurn { turn: turn.clone() },
        );
        Ok(turn)
    }

    /// All turns of a session in creation order.
    pub async fn history(&self, session_id: &SessionId) -> CoreResult<Vec<ChatTurn>> {
        let mut turns: Vec<ChatTurn> = self
            .records
            .load_for_session(Collection::Turns, session_id.as_str())
            .await?;
        turns.sort_by_key(|t| t.created_at);
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> (ChatLog, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (ChatLog::new(Records::memory(), Arc::clone(&bus)), bus)
    }

    #[tokio::test]
    async fn append_publishes_on_chat_topic() {
        let (chat, bus) = chat();
        let mut sub = bus.subscribe("chat:s1");
        let sid = SessionId::from("s1");

        let turn = chat
            .append(&sid, TurnRole::User, "run the tests", None, Some(Actor::Chat))
            .await
            .unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.topic, "chat:s1");
        assert!(matches!(received.event, Event::ChatTurn { turn: t } if t.id == turn.id));
    }

    #[tokio::test]
    async fn history_is_per_session_in_order() {
        let (chat, _bus) = chat();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");

        chat.append(&s1, TurnRole::User, "first", None, None).await.unwrap();
        chat.append(&s2, TurnRole::User, "elsewhere", None, None).await.unwrap();
        chat.append(&s1, TurnRole::Assistant, "second", None, None).await.unwrap();

        let history = chat.history(&s1).await.unwrap();
        let contents: Vec<_> = history.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn empty_turn_is_rejected() {
        let (chat, _bus) = chat();
        let err = chat
            .append(&SessionId::from("s1"), TurnRole::User, "  ", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}

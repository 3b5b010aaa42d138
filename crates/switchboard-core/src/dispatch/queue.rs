//! Per-session queue of follow-up prompts.
//!
//! Remote actors can line up messages while a session is busy. A message is
//! delivered exactly once: either as the next task once the session is idle,
//! or as the reply to the CLI's next stop request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bus::{Event, EventBus, Topic};
use crate::error::{CoreError, CoreResult};
use crate::session::{Actor, SessionId, SessionRegistry};
use crate::store::{Collection, Records};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub session_id: SessionId,
    pub text: String,
    #[serde(default)]
    pub source: Actor,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Pending messages of every session, oldest first.
///
/// Only pending messages are held in memory; sent and cancelled ones stay in
/// the store as history.
pub struct MessageQueue {
    pending: Mutex<Vec<QueuedMessage>>,
    sessions: Arc<SessionRegistry>,
}

impl MessageQueue {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            sessions,
        }
    }

    fn records(&self) -> &Records {
        self.sessions.records()
    }

    pub async fn load(&self) -> CoreResult<usize> {
        let mut loaded: Vec<QueuedMessage> = self
            .records()
            .load_all::<QueuedMessage>(Collection::Messages)
            .await?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .collect();
        loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let count = loaded.len();
        *self.pending.lock().await = loaded;
        Ok(count)
    }

    /// Queue a message for a session. Delivery is up to the caller.
    pub async fn enqueue(
        &self,
        session_id: &SessionId,
        text: &str,
        source: Actor,
    ) -> CoreResult<QueuedMessage> {
        if text.trim().is_empty() {
            return Err(CoreError::InvalidInput("message text cannot be empty".to_string()));
        }
        if self.sessions.get(session_id).await.is_none() {
            return Err(CoreError::not_found("session", session_id));
        }

        let message = QueuedMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            text: text.to_string(),
            source,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
        };

        let mut pending = self.pending.lock().await;
        self.records()
            .save(Collection::Messages, &message.id, &message)
            .await?;
        pending.push(message.clone());
        self.publish(&pending, session_id);
        Ok(message)
    }

    /// Pending messages of a session, oldest first.
    pub async fn list(&self, session_id: &SessionId) -> Vec<QueuedMessage> {
        let pending = self.pending.lock().await;
        for_session(&pending, session_id)
    }

    pub async fn has_pending(&self, session_id: &SessionId) -> bool {
        self.pending
            .lock()
            .await
            .iter()
            .any(|m| &m.session_id == session_id)
    }

    /// Cancel a pending message. False if unknown or already delivered.
    pub async fn cancel(&self, message_id: &str) -> CoreResult<bool> {
        let mut pending = self.pending.lock().await;
        let Some(index) = pending.iter().position(|m| m.id == message_id) else {
            return Ok(false);
        };

        let mut message = pending[index].clone();
        message.status = MessageStatus::Cancelled;
        self.records()
            .save(Collection::Messages, &message.id, &message)
            .await?;
        pending.remove(index);
        self.publish(&pending, &message.session_id);
        Ok(true)
    }

    /// Take the oldest pending message of a session, marking it sent.
    pub async fn take_next(&self, session_id: &SessionId) -> CoreResult<Option<QueuedMessage>> {
        let mut pending = self.pending.lock().await;
        let Some(index) = pending.iter().position(|m| &m.session_id == session_id) else {
            return Ok(None);
        };

        let mut message = pending[index].clone();
        message.status = MessageStatus::Sent;
        self.records()
            .save(Collection::Messages, &message.id, &message)
            .await?;
        pending.remove(index);
        self.publish(&pending, session_id);

        log::info!("Delivering queued message {} to session {}", message.id, session_id);
        Ok(Some(message))
    }

    /// Put a taken message back at the head of its session's queue.
    pub async fn restore(&self, mut message: QueuedMessage) -> CoreResult<()> {
        message.status = MessageStatus::Pending;
        let mut pending = self.pending.lock().await;
        self.records()
            .save(Collection::Messages, &message.id, &message)
            .await?;
        let session_id = message.session_id.clone();
        let index = pending
            .iter()
            .position(|m| m.session_id == session_id)
            .unwrap_or(pending.len());
        pending.insert(index, message);
        self.publish(&pending, &session_id);
        Ok(())
    }

    /// Cancel every pending message of a session.
    pub async fn cancel_all(&self, session_id: &SessionId) -> CoreResult<usize> {
        let mut pending = self.pending.lock().await;
        let mut cancelled = 0;
        for message in pending.iter_mut().filter(|m| &m.session_id == session_id) {
            message.status = MessageStatus::Cancelled;
            self.records()
                .save(Collection::Messages, &message.id, &*message)
                .await?;
            cancelled += 1;
        }
        pending.retain(|m| &m.session_id != session_id);
        if cancelled > 0 {
            self.publish(&pending, session_id);
        }
        Ok(cancelled)
    }

    fn publish(&self, pending: &[QueuedMessage], session_id: &SessionId) {
        self.sessions.bus().publish(
            &Topic::Session(session_id.clone()),
            Event::QueueUpdated {
                session_id: session_id.clone(),
                messages: for_session(pending, session_id),
            },
        );
    }
}

fn for_session(pending: &[QueuedMessage], session_id: &SessionId) -> Vec<QueuedMessage> {
    pending
        .iter()
        .filter(|m| &m.session_id == session_id)
        .cloned()
        .collect()
}

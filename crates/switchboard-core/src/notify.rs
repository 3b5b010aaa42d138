//! User-facing notifications.
//!
//! Raised as a side effect of state transitions (a request waiting for a
//! decision, a timeout, a finished task) and only ever mutated by read/clear
//! actions. Retention is capped; the oldest notifications are dropped first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::bus::{Event, EventBus, Topic};
use crate::error::CoreResult;
use crate::session::SessionId;
use crate::store::{Collection, Records};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Request,
    Timeout,
    TaskCompleted,
    TaskFailed,
    SessionStopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

pub struct Notifier {
    items: RwLock<Vec<Notification>>,
    records: Records,
    bus: Arc<EventBus>,
    max: usize,
}

impl Notifier {
    pub fn new(records: Records, bus: Arc<EventBus>, max: usize) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            records,
            bus,
            max: max.max(1),
        }
    }

    pub async fn load(&self) -> CoreResult<usize> {
        let mut loaded: Vec<Notification> = self.records.load_all(Collection::Notifications).await?;
        loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let count = loaded.len();
        *self.items.write().await = loaded;
        Ok(count)
    }

    pub async fn notify(
        &self,
        session_id: Option<&SessionId>,
        kind: NotificationKind,
        message: impl Into<String>,
    ) -> CoreResult<Notification> {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.cloned(),
            kind,
            message: message.into(),
            read: false,
            created_at: Utc::now(),
        };
        self.records
            .save(Collection::Notifications, &notification.id, &notification)
            .await?;

        let unread = {
            let mut items = self.items.write().await;
            items.push(notification.clone());
            while items.len() > self.max {
                let dropped = items.remove(0);
                self.records
                    .remove(Collection::Notifications, &dropped.id)
                    .await?;
            }
            unread_in(&items)
        };

        self.bus.publish(
            &Topic::Notifications,
            Event::Notification {
                notification: notification.clone(),
            },
        );
        self.bus
            .publish(&Topic::Notifications, Event::NotificationsChanged { unread });
        Ok(notification)
    }

    /// Newest first.
    pub async fn list(&self, unread_only: bool) -> Vec<Notification> {
        self.items
            .read()
            .await
            .iter()
            .rev()
            .filter(|n| !unread_only || !n.read)
            .cloned()
            .collect()
    }

    pub async fn unread_count(&self) -> usize {
        unread_in(&self.items.read().await)
    }

    pub async fn mark_read(&self, id: &str) -> CoreResult<bool> {
        let unread = {
            let mut items = self.items.write().await;
            let Some(notification) = items.iter_mut().find(|n| n.id == id) else {
                return Ok(false);
            };
            if notification.read {
                return Ok(true);
            }
            notification.read = true;
            self.records
                .save(Collection::Notifications, id, &*notification)
                .await?;
            unread_in(&items)
        };
        self.changed(unread);
        Ok(true)
    }

    pub async fn mark_all_read(&self) -> CoreResult<usize> {
        let mut items = self.items.write().await;
        let mut marked = 0;
        for notification in items.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            self.records
                .save(Collection::Notifications, &notification.id, &*notification)
                .await?;
            marked += 1;
        }
        drop(items);

        if marked > 0 {
            self.changed(0);
        }
        Ok(marked)
    }

    pub async fn clear(&self) -> CoreResult<usize> {
        let mut items = self.items.write().await;
        for notification in items.iter() {
            self.records
                .remove(Collection::Notifications, &notification.id)
                .await?;
        }
        let cleared = items.len();
        items.clear();
        drop(items);

        self.changed(0);
        Ok(cleared)
    }

    pub async fn remove_for_session(&self, session_id: &SessionId) -> CoreResult<usize> {
        let mut items = self.items.write().await;
        let before = items.len();
        let mut kept = Vec::with_capacity(before);
        for notification in items.drain(..) {
            if notification.session_id.as_ref() == Some(session_id) {
                self.records
                    .remove(Collection::Notifications, &notification.id)
                    .await?;
            } else {
                kept.push(notification);
            }
        }
        *items = kept;
        let removed = before - items.len();
        let unread = unread_in(&items);
        drop(items);

        if removed > 0 {
            self.changed(unread);
        }
        Ok(removed)
    }

    fn changed(&self, unread: usize) {
        self.bus
            .publish(&Topic::Notifications, Event::NotificationsChanged { unread });
    }
}

fn unread_in(items: &[Notification]) -> usize {
    items.iter().filter(|n| !n.read).count()
}

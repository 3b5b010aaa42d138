//! Framework-agnostic event fan-out.
//!
//! The EventBus is a publish-subscribe primitive distributing state deltas to
//! every connected observer (WebSocket clients, chat-bot bridges, blocked
//! CLI waiters) from a single source.
//!
//! Delivery is best-effort and at-most-once: a subscriber that falls behind
//! by more than the channel capacity skips the missed events and must
//! reconcile by pulling full state. The bus keeps no log.
//!
//! # Topics
//!
//! | Topic | Events |
//! |---|---|
//! | `sessions` | `session_updated`, `session_deleted` |
//! | `session:{id}` | `session_updated`, `request_opened`, `request_resolved`, `queue_updated` |
//! | `chat:{id}` | `chat_turn` |
//! | `thinking:{id}` | `thinking` |
//! | `task:{id}` | `task_started`, `task_activity`, `task_finished` |
//! | `notifications` | `notification`, `notifications_changed` |
//! | `rules` | `rule_added`, `rule_removed` |
//!
//! # Example
//!
//! ```rust
//! use switchboard_core::bus::{Event, EventBus, Topic};
//! use switchboard_core::SessionId;
//!
//! let bus = EventBus::new();
//! let mut sub = bus.subscribe("thinking:*");
//!
//! let session_id = SessionId::from("abc123");
//! bus.publish(&Topic::Thinking(session_id.clone()), Event::Thinking { session_id, active: true });
//!
//! // In async context:
//! // let event = sub.recv().await.unwrap();
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::chat::ChatTurn;
use crate::dispatch::{AgentActivity, QueuedMessage, Task, TaskId};
use crate::notify::Notification;
use crate::permission::{AllowlistRule, PendingRequest};
use crate::session::{Session, SessionId};

/// Default channel capacity for the event bus.
/// Events beyond this capacity will cause slow subscribers to miss events (lag).
const DEFAULT_CAPACITY: usize = 1024;

/// A fan-out topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Sessions,
    Session(SessionId),
    Chat(SessionId),
    Thinking(SessionId),
    Task(TaskId),
    Notifications,
    Rules,
}

impl Topic {
    pub fn name(&self) -> String {
        match self {
            Topic::Sessions => "sessions".to_string(),
            Topic::Session(id) => format!("session:{id}"),
            Topic::Chat(id) => format!("chat:{id}"),
            Topic::Thinking(id) => format!("thinking:{id}"),
            Topic::Task(id) => format!("task:{id}"),
            Topic::Notifications => "notifications".to_string(),
            Topic::Rules => "rules".to_string(),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Every state delta the core publishes, one variant per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        session_id: SessionId,
        hard: bool,
    },
    RequestOpened {
        request: PendingRequest,
    },
    RequestResolved {
        request: PendingRequest,
    },
    QueueUpdated {
        session_id: SessionId,
        messages: Vec<QueuedMessage>,
    },
    ChatTurn {
        turn: ChatTurn,
    },
    /// "CLI is thinking" start/stop marker.
    Thinking {
        session_id: SessionId,
        active: bool,
    },
    TaskStarted {
        task: Task,
    },
    TaskActivity {
        task_id: TaskId,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        activity: AgentActivity,
    },
    TaskFinished {
        task: Task,
    },
    Notification {
        notification: Notification,
    },
    NotificationsChanged {
        unread: usize,
    },
    RuleAdded {
        rule: AllowlistRule,
    },
    RuleRemoved {
        rule_id: String,
    },
}

/// An event together with the topic it was published on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub event: Event,
}

/// Broadcast hub for [`BusEvent`]s.
///
/// Uses a tokio broadcast channel internally: a single ordered stream, so
/// per-topic publish order is preserved for every subscriber.
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Create a new EventBus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new EventBus with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event on a topic.
    ///
    /// Returns the number of subscribers that received the event.
    /// With no subscribers the event is dropped and 0 is returned.
    pub fn publish(&self, topic: &Topic, event: Event) -> usize {
        let event = BusEvent {
            topic: topic.name(),
            event,
        };
        log::debug!("publish {}", event.topic);
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to topics matching `pattern` (see [`topic_matches`]).
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            patterns: vec![pattern.into()],
        }
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            patterns: Vec::new(),
        }
    }

    /// Raw receiver of every event, for transports that filter themselves.
    pub fn receiver(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Get the current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A filtered stream of bus events.
///
/// Past events are never delivered; only events published after the
/// subscription was created.
pub struct Subscription {
    receiver: broadcast::Receiver<BusEvent>,
    patterns: Vec<String>,
}

impl Subscription {
    /// Also receive topics matching `pattern`.
    pub fn add_pattern(&mut self, pattern: impl Into<String>) {
        self.patterns.push(pattern.into());
    }

    pub fn accepts(&self, topic: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| topic_matches(topic, p))
    }

    /// Wait for the next matching event.
    ///
    /// Returns `None` once the bus is gone. Lag is logged and skipped.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event.topic) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    log::warn!("Subscriber lagged by {} events", count);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Check if a topic matches a subscription pattern.
///
/// Supports:
/// - exact match (`session:abc`)
/// - suffix wildcard (`task:*` matches every `task:{id}`)
/// - per-segment wildcard (`*:abc` matches `chat:abc`, `thinking:abc`, ...)
/// - `*` alone matches everything
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    if pattern == "*" || topic == pattern {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(":*") {
        if topic.starts_with(prefix) && topic[prefix.len()..].starts_with(':') {
            return true;
        }
    }

    if pattern.contains('*') {
        let pattern_parts: Vec<&str> = pattern.split(':').collect();
        let topic_parts: Vec<&str> = topic.split(':').collect();
        if pattern_parts.len() != topic_parts.len() {
            return false;
        }
        return pattern_parts
            .iter()
            .zip(topic_parts.iter())
            .all(|(p, t)| *p == "*" || p == t);
    }

    false
}

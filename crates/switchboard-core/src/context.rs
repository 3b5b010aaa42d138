//! Conductor - the composed coordination core.
//!
//! Holds every component behind an `Arc` so interfaces (HTTP server, chat
//! bridges, tests) share one instance. Single-component operations are
//! called on the components directly; the conductor implements the ones
//! that span several of them.
//!
//! ```text
//!                      ┌──────────────────────┐
//!                      │      Conductor       │
//!                      ├──────────────────────┤
//!                      │  SessionRegistry     │
//!                      │  PermissionBroker    │
//!                      │  ControlCoordinator  │
//!                      │  TaskDispatcher      │
//!                      │  MessageQueue        │
//!                      │  Allowlist, Notifier │
//!                      │  ChatLog, EventBus   │
//!                      └──────────┬───────────┘
//!                                 │
//!              ┌──────────────────┼──────────────────┐
//!              ▼                  ▼                  ▼
//!        CLI hooks          HTTP / WebSocket     chat bridges
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Event, EventBus, Topic};
use crate::chat::{ChatLog, ChatTurn, TurnRole};
use crate::config::CoreConfig;
use crate::control::ControlCoordinator;
use crate::dispatch::{
    AgentRunner, CliAgent, MessageQueue, QueuedMessage, Task, TaskDispatcher, TaskRequest,
};
use crate::error::{CoreError, CoreResult};
use crate::notify::Notifier;
use crate::permission::{Allowlist, Decider, Decision, PermissionBroker, RequestKind, RuleScope};
use crate::session::{Actor, Session, SessionId, SessionRegistry};
use crate::store::{Collection, Records, Store};

#[derive(Default)]
pub struct ConductorBuilder {
    config: Option<CoreConfig>,
    records: Option<Records>,
    bus: Option<Arc<EventBus>>,
    runner: Option<Arc<dyn AgentRunner>>,
}

impl ConductorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.records = Some(Records::new(store));
        self
    }

    pub fn records(mut self, records: Records) -> Self {
        self.records = Some(records);
        self
    }

    /// Use an existing EventBus (for testing or custom configurations).
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the CLI agent (tests use a scripted runner).
    pub fn runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Wire the components. Call [`Conductor::load`] before serving.
    pub fn build(self) -> Conductor {
        let config = self.config.unwrap_or_default();
        let records = self.records.unwrap_or_else(Records::memory);
        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::new()));
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(CliAgent::new(config.agent.clone())));

        let sessions = Arc::new(SessionRegistry::new(records.clone(), Arc::clone(&bus)));
        let allowlist = Arc::new(Allowlist::new(
            records.clone(),
            Arc::clone(&bus),
            config.rule_precedence,
        ));
        let notifier = Arc::new(Notifier::new(
            records.clone(),
            Arc::clone(&bus),
            config.max_notifications,
        ));
        let chat = Arc::new(ChatLog::new(records.clone(), Arc::clone(&bus)));
        let queue = Arc::new(MessageQueue::new(Arc::clone(&sessions)));
        let broker = Arc::new(PermissionBroker::new(
            Arc::clone(&sessions),
            Arc::clone(&allowlist),
            Arc::clone(&queue),
            Arc::clone(&notifier),
            config.broker_settings(),
        ));
        let control = Arc::new(ControlCoordinator::new(
            Arc::clone(&sessions),
            Arc::clone(&broker),
            Arc::clone(&notifier),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&queue),
            Arc::clone(&chat),
            Arc::clone(&notifier),
            runner,
        ));

        Conductor {
            config: Arc::new(config),
            bus,
            records,
            sessions,
            allowlist,
            notifier,
            chat,
            queue,
            broker,
            control,
            dispatcher,
        }
    }
}

/// Central shared state. Cloning clones the pointers.
#[derive(Clone)]
pub struct Conductor {
    pub config: Arc<CoreConfig>,
    pub bus: Arc<EventBus>,
    pub records: Records,
    pub sessions: Arc<SessionRegistry>,
    pub allowlist: Arc<Allowlist>,
    pub notifier: Arc<Notifier>,
    pub chat: Arc<ChatLog>,
    pub queue: Arc<MessageQueue>,
    pub broker: Arc<PermissionBroker>,
    pub control: Arc<ControlCoordinator>,
    pub dispatcher: Arc<TaskDispatcher>,
}

impl Conductor {
    pub fn builder() -> ConductorBuilder {
        ConductorBuilder::new()
    }

    /// Rebuild in-memory state from the store.
    pub async fn load(&self) -> CoreResult<()> {
        let sessions = self.sessions.load().await?;
        let rules = self.allowlist.load().await?;
        let messages = self.queue.load().await?;
        let notifications = self.notifier.load().await?;
        let interrupted = self.dispatcher.load().await?;
        log::info!(
            "Loaded {} sessions, {} rules, {} queued messages, {} notifications ({} interrupted tasks)",
            sessions,
            rules,
            messages,
            notifications,
            interrupted
        );
        Ok(())
    }

    pub async fn get_session(&self, session_id: &SessionId) -> CoreResult<Session> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| CoreError::not_found("session", session_id))
    }

    /// Hand control to a remote actor, then run anything already queued.
    pub async fn handoff(&self, session_id: &SessionId, actor: Actor) -> CoreResult<Session> {
        let session = self.control.handoff(session_id, actor).await?;
        self.drain(session_id).await;
        Ok(session)
    }

    pub async fn release(&self, session_id: &SessionId) -> CoreResult<Session> {
        let session = self.control.release(session_id).await?;
        self.drain(session_id).await;
        Ok(session)
    }

    /// Bounded by `timeout` or the configured release wait.
    pub async fn wait_for_release(
        &self,
        session_id: &SessionId,
        timeout: Option<Duration>,
    ) -> CoreResult<Session> {
        let timeout = timeout.unwrap_or_else(|| self.config.release_wait());
        self.control.wait_for_release(session_id, timeout).await
    }

    /// Answer the open request; a freed session may pick up queued work.
    pub async fn resolve(
        &self,
        session_id: &SessionId,
        decision: Decision,
        decider: Decider,
        scope: Option<RuleScope>,
        reply: Option<String>,
        pattern: Option<String>,
    ) -> CoreResult<bool> {
        let resolved = self
            .broker
            .resolve(session_id, decision, decider, scope, reply, pattern)
            .await?;
        if resolved {
            self.drain(session_id).await;
        }
        Ok(resolved)
    }

    /// Submit a task; with `wait`, return only once it has finished.
    pub async fn execute_task(&self, request: TaskRequest, wait: bool) -> CoreResult<Task> {
        if wait {
            self.dispatcher.execute(request).await
        } else {
            self.dispatcher.submit(request).await
        }
    }

    /// Record a turn the CLI reports about itself.
    pub async fn append_chat(
        &self,
        session_id: &SessionId,
        role: TurnRole,
        content: &str,
    ) -> CoreResult<ChatTurn> {
        if !self.sessions.contains(session_id).await {
            return Err(CoreError::not_found("session", session_id));
        }
        self.chat.append(session_id, role, content, None, None).await
    }

    /// Queue a message for a session and deliver it if possible: as the
    /// reply to an open stop request, or as the next task of an idle,
    /// remotely driven session.
    pub async fn enqueue_message(
        &self,
        session_id: &SessionId,
        text: &str,
        source: Actor,
    ) -> CoreResult<QueuedMessage> {
        let message = self.queue.enqueue(session_id, text, source).await?;

        let stop_open = self
            .sessions
            .get(session_id)
            .await
            .and_then(|s| s.pending_request)
            .is_some_and(|r| r.kind == RequestKind::Stop && r.is_open());

        if stop_open {
            if let Some(next) = self.queue.take_next(session_id).await? {
                let decider = match next.source {
                    Actor::Chat => Decider::Chat,
                    Actor::Web | Actor::Api => Decider::Web,
                };
                let reply = Some(next.text.clone());
                let delivered = self
                    .broker
                    .resolve(session_id, Decision::Approved, decider, None, reply, None)
                    .await?;
                if !delivered {
                    self.queue.restore(next).await?;
                }
            }
        } else {
            self.drain(session_id).await;
        }
        Ok(message)
    }

    /// Delete a session. Soft deletion hides it from default listings; hard
    /// deletion also removes everything it owns from the store.
    ///
    /// The session is closed to new tasks before its running task is
    /// stopped, so nothing started mid-deletion outlives it.
    pub async fn delete_session(&self, session_id: &SessionId, hard: bool) -> CoreResult<()> {
        {
            let mut slot = self.sessions.lock(session_id).await?;
            slot.closing = true;
            if let Some(request) = self.broker.abort(&mut slot, "session deleted").await {
                log::info!("Denied request {} of deleted session {}", request.id, session_id);
            }
        }

        let cancelled = match self.queue.cancel_all(session_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                self.reopen(session_id).await;
                return Err(e);
            }
        };
        self.stop_task(session_id).await;

        {
            let mut slot = self.sessions.lock(session_id).await?;
            let deleted = if hard {
                self.sessions.remove(&mut slot).await
            } else {
                self.sessions.soft_delete(&mut slot).await.map(|_| ())
            };
            slot.closing = false;
            deleted?;
        }

        if hard {
            for collection in [
                Collection::Requests,
                Collection::Tasks,
                Collection::Turns,
                Collection::Messages,
            ] {
                self.records
                    .remove_for_session(collection, session_id.as_str())
                    .await?;
            }
            self.allowlist.remove_for_session(session_id).await?;
            self.notifier.remove_for_session(session_id).await?;
            self.broker.forget(session_id).await;
        }

        log::info!(
            "{} session {} ({} queued messages cancelled)",
            if hard { "Hard-deleted" } else { "Soft-deleted" },
            session_id,
            cancelled
        );
        self.bus.publish(
            &Topic::Sessions,
            Event::SessionDeleted {
                session_id: session_id.clone(),
                hard,
            },
        );
        Ok(())
    }

    /// Cancel the session's running task. The task is settled when this
    /// returns; its agent winds down in the background.
    async fn stop_task(&self, session_id: &SessionId) {
        if let Some(task_id) = self.sessions.running_task(session_id).await {
            if self.dispatcher.cancel(&task_id).await {
                log::info!("Stopped task {} of session {}", task_id, session_id);
            }
        }
    }

    /// Undo the closing mark of a deletion that failed part way.
    async fn reopen(&self, session_id: &SessionId) {
        if let Ok(mut slot) = self.sessions.lock(session_id).await {
            slot.closing = false;
        }
    }

    async fn drain(&self, session_id: &SessionId) {
        if let Err(e) = self.dispatcher.drain(session_id).await {
            log::warn!("Failed to drain queue of session {}: {}", session_id, e);
        }
    }
}

impl Default for Conductor {
    fn default() -> Self {
        Self::builder().build()
    }
}

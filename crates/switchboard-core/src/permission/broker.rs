//! Permission broker.
//!
//! Bridges a CLI hook, which blocks on [`PermissionBroker::request`], and
//! remote deciders, which answer asynchronously through
//! [`PermissionBroker::resolve`].
//!
//! # Lifecycle
//!
//! ```text
//! request() ──► allowlist match? ──yes──► approved/denied (auto)
//!                    │ no
//!                    ▼
//!              per-session turn (one open request per session)
//!                    │
//!                    ▼
//!         stop + queued message? ──yes──► approved (auto, reply = message)
//!                    │ no
//!                    ▼
//!      open: persist, attach to session, publish, notify
//!                    │
//!       ┌────────────┴─────────────┐
//!   resolve()                  deadline
//!   approved/denied            timeout (auto)
//! ```
//!
//! The waiter handle lives in the session slot. Whoever takes it out while
//! holding the slot lock (resolver, timeout, session deletion) is the sole
//! resolver, so each request is resolved exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout_at, Instant};

use super::allowlist::{Allowlist, NewRule, RuleEffect, RuleScope};
use super::pattern;
use super::prefixes::suggest_patterns;
use super::request::{Decider, Decision, PendingRequest, RequestKind, TimeoutPolicy};
use crate::bus::{Event, Topic};
use crate::dispatch::MessageQueue;
use crate::error::{CoreError, CoreResult};
use crate::notify::{NotificationKind, Notifier};
use crate::session::{SessionId, SessionRegistry, SessionSlot, SessionStatus, Waiter};
use crate::store::Collection;

/// Broker timing and timeout semantics.
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    pub permission_timeout: Duration,
    /// Timeout for every non-permission kind.
    pub notification_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            permission_timeout: Duration::from_secs(300),
            notification_timeout: Duration::from_secs(120),
            timeout_policy: TimeoutPolicy::Deny,
        }
    }
}

/// What a blocked hook learns when its request ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub request_id: String,
    pub decision: Decision,
    pub decider: Decider,
    /// Whether the hook may proceed, after applying the timeout policy.
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    /// The allowlist rule that decided the request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

pub struct PermissionBroker {
    sessions: Arc<SessionRegistry>,
    allowlist: Arc<Allowlist>,
    queue: Arc<MessageQueue>,
    notifier: Arc<Notifier>,
    turns: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
    settings: BrokerSettings,
}

impl PermissionBroker {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        allowlist: Arc<Allowlist>,
        queue: Arc<MessageQueue>,
        notifier: Arc<Notifier>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            sessions,
            allowlist,
            queue,
            notifier,
            turns: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    fn timeout_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Permission => self.settings.permission_timeout,
            _ => self.settings.notification_timeout,
        }
    }

    /// Ask for a decision and block until one arrives or the kind's timeout
    /// elapses. The whole call, including waiting for an earlier request of
    /// the same session, is bounded by that timeout.
    pub async fn request(
        &self,
        session_id: &SessionId,
        kind: RequestKind,
        message: impl Into<String>,
        tool: Option<String>,
        args: Option<Value>,
    ) -> CoreResult<Outcome> {
        let deadline = Instant::now() + self.timeout_for(kind);
        if self.sessions.get(session_id).await.is_none() {
            return Err(CoreError::not_found("session", session_id));
        }

        let mut request = PendingRequest::new(session_id.clone(), kind, message, tool, args);

        if kind == RequestKind::Permission {
            if let Some(tool) = request.tool.clone() {
                let invocation = pattern::invocation_for(request.args.as_ref());
                if let Some(rule) = self.allowlist.evaluate(session_id, &tool, &invocation).await {
                    let decision = match rule.effect {
                        RuleEffect::Allow => Decision::Approved,
                        RuleEffect::Deny => Decision::Denied,
                    };
                    log::info!(
                        "Rule {} {:?} {} `{}` for session {}",
                        rule.id,
                        decision,
                        tool,
                        invocation,
                        session_id
                    );
                    request.resolve(decision, Decider::Auto, None);
                    self.record_unattached(&request).await?;
                    return Ok(self.outcome(&request, Some(rule.id)));
                }

                if let Some(command) = request
                    .args
                    .as_ref()
                    .and_then(|a| a.get("command"))
                    .and_then(Value::as_str)
                {
                    request.suggestions = suggest_patterns(command);
                }
            }
        }

        let turn = self.turn(session_id).await;
        let _turn = match timeout_at(deadline, turn.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                log::warn!(
                    "Request for session {} timed out waiting for an earlier request",
                    session_id
                );
                request.resolve(Decision::Timeout, Decider::Auto, None);
                self.record_unattached(&request).await?;
                return Ok(self.outcome(&request, None));
            }
        };

        if kind == RequestKind::Stop {
            if let Some(next) = self.queue.take_next(session_id).await? {
                request.resolve(Decision::Approved, Decider::Auto, Some(next.text));
                self.record_unattached(&request).await?;
                return Ok(self.outcome(&request, None));
            }
        }

        let mut rx = self.open(&request).await?;

        let waited = timeout_at(deadline, &mut rx).await;
        let resolved = match waited {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(_)) => self.abandoned(request),
            Err(_) => match self.expire(session_id, &request.id).await {
                Some(expired) => expired,
                // Someone else took the waiter first and has already sent.
                None => match rx.await {
                    Ok(resolved) => resolved,
                    Err(_) => self.abandoned(request),
                },
            },
        };

        Ok(self.outcome(&resolved, None))
    }

    /// Answer the session's open request.
    ///
    /// With a `scope`, a rule for the request's tool is also added: allow on
    /// approval, deny on denial, with `pattern` or `*`. Returns false when
    /// the session has no open request. When the decision cannot be
    /// persisted the hook is still woken, but the store error is returned
    /// and no rule is added.
    pub async fn resolve(
        &self,
        session_id: &SessionId,
        decision: Decision,
        decider: Decider,
        scope: Option<RuleScope>,
        reply: Option<String>,
        pattern: Option<String>,
    ) -> CoreResult<bool> {
        if !matches!(decision, Decision::Approved | Decision::Denied) {
            return Err(CoreError::InvalidInput(format!(
                "decision must be approved or denied, got {decision:?}"
            )));
        }
        if decider == Decider::Auto {
            return Err(CoreError::InvalidInput(
                "auto decisions are reserved for the broker".to_string(),
            ));
        }

        let mut slot = match self.sessions.lock(session_id).await {
            Ok(slot) => slot,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some((request, persisted)) = self.finalize(&mut slot, decision, decider, reply).await
        else {
            return Ok(false);
        };
        drop(slot);

        log::info!(
            "Request {} of session {} {:?} by {:?}",
            request.id,
            session_id,
            decision,
            decider
        );
        persisted?;

        if let (Some(scope), Some(tool)) = (scope, request.tool.clone()) {
            let rule = NewRule {
                tool,
                pattern: pattern.unwrap_or_else(|| "*".to_string()),
                scope,
                session_id: (scope == RuleScope::Session).then(|| session_id.clone()),
                effect: match decision {
                    Decision::Approved => RuleEffect::Allow,
                    _ => RuleEffect::Deny,
                },
            };
            if let Err(e) = self.allowlist.add(rule).await {
                log::warn!("Failed to add rule from request {}: {}", request.id, e);
            }
        }

        Ok(true)
    }

    /// Deny a session's open request because the session is going away
    /// (deleted, or its CLI exited). The caller holds the slot.
    pub(crate) async fn abort(&self, slot: &mut SessionSlot, reason: &str) -> Option<PendingRequest> {
        let (request, persisted) = self
            .finalize(slot, Decision::Denied, Decider::Auto, Some(reason.to_string()))
            .await?;
        if let Err(e) = persisted {
            log::warn!("Failed to persist aborted request {}: {}", request.id, e);
        }
        Some(request)
    }

    /// Drop the per-session turn lock of a removed session.
    pub(crate) async fn forget(&self, session_id: &SessionId) {
        self.turns.lock().await.remove(session_id);
    }

    async fn turn(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut turns = self.turns.lock().await;
        Arc::clone(turns.entry(session_id.clone()).or_default())
    }

    /// Attach `request` to its session and install the waiter.
    async fn open(&self, request: &PendingRequest) -> CoreResult<oneshot::Receiver<PendingRequest>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.sessions.lock(&request.session_id).await?;
            self.sessions
                .records()
                .save(Collection::Requests, &request.id, request)
                .await?;

            slot.session.pending_request = Some(request.clone());
            slot.session.status = SessionStatus::Waiting;
            slot.waiter = Some(Waiter {
                request_id: request.id.clone(),
                tx,
            });
            if let Err(e) = self.sessions.commit(&mut slot).await {
                slot.waiter = None;
                slot.session.pending_request = None;
                return Err(e);
            }
        }

        log::info!(
            "Opened {:?} request {} for session {}",
            request.kind,
            request.id,
            request.session_id
        );
        self.sessions.bus().publish(
            &Topic::Session(request.session_id.clone()),
            Event::RequestOpened {
                request: request.clone(),
            },
        );
        if let Err(e) = self
            .notifier
            .notify(
                Some(&request.session_id),
                NotificationKind::Request,
                request.message.clone(),
            )
            .await
        {
            log::warn!("Failed to notify about request {}: {}", request.id, e);
        }

        Ok(rx)
    }

    /// Time out `request_id` if it is still the session's open request.
    async fn expire(&self, session_id: &SessionId, request_id: &str) -> Option<PendingRequest> {
        let mut slot = self.sessions.lock(session_id).await.ok()?;
        if slot.waiter.as_ref().map(|w| w.request_id.as_str()) != Some(request_id) {
            return None;
        }
        let (request, persisted) = self
            .finalize(&mut slot, Decision::Timeout, Decider::Auto, None)
            .await?;
        drop(slot);
        if let Err(e) = persisted {
            log::warn!("Failed to persist timeout of request {}: {}", request_id, e);
        }

        log::warn!("Request {} of session {} timed out", request_id, session_id);
        if let Err(e) = self
            .notifier
            .notify(
                Some(session_id),
                NotificationKind::Timeout,
                format!("Timed out: {}", request.message),
            )
            .await
        {
            log::warn!("Failed to notify about timeout of {}: {}", request_id, e);
        }
        Some(request)
    }

    /// Take the waiter, record the decision, persist, publish, wake.
    ///
    /// The waiter is woken even when persisting fails; the second value
    /// carries that failure back to the caller.
    async fn finalize(
        &self,
        slot: &mut SessionSlot,
        decision: Decision,
        decider: Decider,
        reply: Option<String>,
    ) -> Option<(PendingRequest, CoreResult<()>)> {
        let waiter = slot.waiter.take()?;
        let Some(mut request) = slot.session.pending_request.take() else {
            log::warn!(
                "Session {} had a waiter but no open request",
                slot.session.id
            );
            return None;
        };

        request.resolve(decision, decider, reply);
        slot.session.status = if request.kind == RequestKind::Stop && request.reply.is_none() {
            SessionStatus::Waiting
        } else {
            SessionStatus::Running
        };

        let saved = self
            .sessions
            .records()
            .save(Collection::Requests, &request.id, &request)
            .await
            .map_err(CoreError::from);
        let committed = self.sessions.commit(slot).await.map(|_| ());
        let persisted = saved.and(committed);
        if let Err(e) = &persisted {
            log::error!("Failed to persist resolution of request {}: {}", request.id, e);
        }

        self.sessions.bus().publish(
            &Topic::Session(request.session_id.clone()),
            Event::RequestResolved {
                request: request.clone(),
            },
        );
        let _ = waiter.tx.send(request.clone());
        Some((request, persisted))
    }

    /// Persist and publish a request that never became the session's open one.
    async fn record_unattached(&self, request: &PendingRequest) -> CoreResult<()> {
        self.sessions
            .records()
            .save(Collection::Requests, &request.id, request)
            .await?;
        self.sessions.bus().publish(
            &Topic::Session(request.session_id.clone()),
            Event::RequestResolved {
                request: request.clone(),
            },
        );
        Ok(())
    }

    /// The waiter vanished without a decision; report a timeout.
    fn abandoned(&self, mut request: PendingRequest) -> PendingRequest {
        log::warn!("Request {} lost its waiter", request.id);
        request.resolve(Decision::Timeout, Decider::Auto, None);
        request
    }

    fn outcome(&self, request: &PendingRequest, rule_id: Option<String>) -> Outcome {
        Outcome {
            request_id: request.id.clone(),
            decision: request.decision,
            decider: request.decider.unwrap_or(Decider::Auto),
            allowed: self.settings.timeout_policy.allows(request.decision),
            reply: request.reply.clone(),
            rule_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::permission::allowlist::DEFAULT_PRECEDENCE;
    use crate::session::{Actor, ControlState, Session};
    use crate::store::flaky::FlakyStore;
    use crate::store::Records;
    use serde_json::json;

    struct Harness {
        sessions: Arc<SessionRegistry>,
        allowlist: Arc<Allowlist>,
        queue: Arc<MessageQueue>,
        notifier: Arc<Notifier>,
        broker: Arc<PermissionBroker>,
    }

    async fn harness(settings: BrokerSettings) -> Harness {
        harness_on(Records::memory(), settings).await
    }

    async fn harness_on(records: Records, settings: BrokerSettings) -> Harness {
        let bus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new(records.clone(), Arc::clone(&bus)));
        let allowlist = Arc::new(Allowlist::new(
            records.clone(),
            Arc::clone(&bus),
            DEFAULT_PRECEDENCE,
        ));
        let queue = Arc::new(MessageQueue::new(Arc::clone(&sessions)));
        let notifier = Arc::new(Notifier::new(records, bus, 100));
        let broker = Arc::new(PermissionBroker::new(
            Arc::clone(&sessions),
            Arc::clone(&allowlist),
            Arc::clone(&queue),
            Arc::clone(&notifier),
            settings,
        ));

        let id = SessionId::from("s1");
        let (mut slot, _) = sessions
            .lock_or_create(&id, || Session::new(id.clone(), "/tmp/project", None))
            .await;
        sessions.commit(&mut slot).await.unwrap();

        Harness {
            sessions,
            allowlist,
            queue,
            notifier,
            broker,
        }
    }

    fn s1() -> SessionId {
        SessionId::from("s1")
    }

    fn bash(command: &str) -> Option<Value> {
        Some(json!({ "command": command }))
    }

    /// Spawn a permission request and wait until it is visible on the session.
    async fn open_request(
        h: &Harness,
        command: &str,
    ) -> tokio::task::JoinHandle<CoreResult<Outcome>> {
        let broker = Arc::clone(&h.broker);
        let args = bash(command);
        let handle = tokio::spawn(async move {
            broker
                .request(&s1(), RequestKind::Permission, "Allow?", Some("Bash".into()), args)
                .await
        });
        wait_until_open(h).await;
        handle
    }

    async fn wait_until_open(h: &Harness) {
        for _ in 0..200 {
            if let Some(session) = h.sessions.get(&s1()).await {
                if session.pending_request.is_some() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request never opened");
    }

    mod allowlist_fast_path {
        use super::*;

        #[tokio::test]
        async fn matching_allow_rule_auto_approves() {
            let h = harness(BrokerSettings::default()).await;
            let rule = h.allowlist.add(NewRule::allow("Bash", "npm *")).await.unwrap();

            let outcome = h
                .broker
                .request(&s1(), RequestKind::Permission, "npm", Some("Bash".into()), bash("npm install"))
                .await
                .unwrap();

            assert_eq!(outcome.decision, Decision::Approved);
            assert_eq!(outcome.decider, Decider::Auto);
            assert!(outcome.allowed);
            assert_eq!(outcome.rule_id, Some(rule.id));

            let session = h.sessions.get(&s1()).await.unwrap();
            assert!(session.pending_request.is_none());
            assert_eq!(session.status, SessionStatus::Running);
        }

        #[tokio::test]
        async fn matching_deny_rule_auto_denies() {
            let h = harness(BrokerSettings::default()).await;
            h.allowlist
                .add(NewRule::allow("Bash", "rm *").with_effect(RuleEffect::Deny))
                .await
                .unwrap();

            let outcome = h
                .broker
                .request(&s1(), RequestKind::Permission, "rm", Some("Bash".into()), bash("rm -rf /"))
                .await
                .unwrap();
            assert_eq!(outcome.decision, Decision::Denied);
            assert!(!outcome.allowed);
        }

        #[tokio::test]
        async fn unknown_session_is_not_found() {
            let h = harness(BrokerSettings::default()).await;
            let result = h
                .broker
                .request(&SessionId::from("nope"), RequestKind::Info, "hi", None, None)
                .await;
            assert!(matches!(result, Err(CoreError::NotFound(_))));
        }
    }

    mod resolution {
        use super::*;

        #[tokio::test]
        async fn open_request_is_visible_with_suggestions() {
            let h = harness(BrokerSettings::default()).await;
            let handle = open_request(&h, "git status && npm test").await;

            let session = h.sessions.get(&s1()).await.unwrap();
            assert_eq!(session.status, SessionStatus::Waiting);
            let request = session.pending_request.unwrap();
            assert_eq!(request.suggestions, vec!["git status *", "npm test *"]);
            assert_eq!(h.notifier.list(true).await.len(), 1);

            h.broker
                .resolve(&s1(), Decision::Approved, Decider::Web, None, None, None)
                .await
                .unwrap();
            handle.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn resolve_wakes_the_hook() {
            let h = harness(BrokerSettings::default()).await;
            let handle = open_request(&h, "cargo build").await;

            let resolved = h
                .broker
                .resolve(&s1(), Decision::Denied, Decider::Chat, None, Some("not now".into()), None)
                .await
                .unwrap();
            assert!(resolved);

            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.decision, Decision::Denied);
            assert_eq!(outcome.decider, Decider::Chat);
            assert_eq!(outcome.reply.as_deref(), Some("not now"));
            assert!(!outcome.allowed);

            let session = h.sessions.get(&s1()).await.unwrap();
            assert!(session.pending_request.is_none());
            assert_eq!(session.status, SessionStatus::Running);
        }

        #[tokio::test]
        async fn resolve_without_open_request_is_false() {
            let h = harness(BrokerSettings::default()).await;
            let resolved = h
                .broker
                .resolve(&s1(), Decision::Approved, Decider::Web, None, None, None)
                .await
                .unwrap();
            assert!(!resolved);

            let unknown = h
                .broker
                .resolve(&SessionId::from("x"), Decision::Approved, Decider::Web, None, None, None)
                .await
                .unwrap();
            assert!(!unknown);
        }

        #[tokio::test]
        async fn resolve_rejects_non_terminal_decisions() {
            let h = harness(BrokerSettings::default()).await;
            for decision in [Decision::Pending, Decision::Timeout] {
                let result = h
                    .broker
                    .resolve(&s1(), decision, Decider::Web, None, None, None)
                    .await;
                assert!(matches!(result, Err(CoreError::InvalidInput(_))));
            }
        }

        #[tokio::test]
        async fn exactly_one_concurrent_resolver_wins() {
            let h = harness(BrokerSettings::default()).await;
            let handle = open_request(&h, "make").await;

            let mut resolvers = Vec::new();
            for i in 0..8 {
                let broker = Arc::clone(&h.broker);
                let decider = if i % 2 == 0 { Decider::Web } else { Decider::Chat };
                resolvers.push(tokio::spawn(async move {
                    broker
                        .resolve(&s1(), Decision::Approved, decider, None, None, None)
                        .await
                        .unwrap()
                }));
            }

            let mut winners = 0;
            for resolver in resolvers {
                if resolver.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
            assert_eq!(handle.await.unwrap().unwrap().decision, Decision::Approved);
        }

        #[tokio::test]
        async fn scoped_approval_adds_rule_for_next_request() {
            let h = harness(BrokerSettings::default()).await;
            let handle = open_request(&h, "npm install").await;

            h.broker
                .resolve(
                    &s1(),
                    Decision::Approved,
                    Decider::Web,
                    Some(RuleScope::Session),
                    None,
                    Some("npm *".into()),
                )
                .await
                .unwrap();
            handle.await.unwrap().unwrap();

            let rules = h.allowlist.list(Some(&s1())).await;
            assert_eq!(rules.len(), 1);
            assert_eq!(rules[0].pattern, "npm *");
            assert_eq!(rules[0].scope, RuleScope::Session);

            let outcome = h
                .broker
                .request(&s1(), RequestKind::Permission, "again", Some("Bash".into()), bash("npm test"))
                .await
                .unwrap();
            assert_eq!(outcome.decider, Decider::Auto);
            assert!(outcome.allowed);
        }

        #[tokio::test]
        async fn unpersisted_decision_is_an_error_after_waking_hook() {
            let store = Arc::new(FlakyStore::default());
            let h = harness_on(Records::new(store.clone()), BrokerSettings::default()).await;
            let handle = open_request(&h, "cargo publish").await;
            let request_id = h.sessions.get(&s1()).await.unwrap().pending_request.unwrap().id;

            store.break_writes();
            let result = h
                .broker
                .resolve(
                    &s1(),
                    Decision::Approved,
                    Decider::Web,
                    Some(RuleScope::Global),
                    None,
                    None,
                )
                .await;
            assert!(matches!(result, Err(CoreError::Store(_))));

            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.decision, Decision::Approved);
            assert!(h.allowlist.list(None).await.is_empty());

            let stored: PendingRequest = h
                .sessions
                .records()
                .load(Collection::Requests, &request_id)
                .await
                .unwrap()
                .unwrap();
            assert!(stored.is_open());
        }

        #[tokio::test]
        async fn scoped_global_approval_defaults_to_star() {
            let h = harness(BrokerSettings::default()).await;
            let handle = open_request(&h, "ls").await;

            h.broker
                .resolve(&s1(), Decision::Approved, Decider::Web, Some(RuleScope::Global), None, None)
                .await
                .unwrap();
            handle.await.unwrap().unwrap();

            let rules = h.allowlist.list(None).await;
            assert_eq!(rules.len(), 1);
            assert_eq!(rules[0].pattern, "*");
            assert!(rules[0].session_id.is_none());
        }
    }

    mod timeouts {
        use super::*;

        fn short() -> BrokerSettings {
            BrokerSettings {
                permission_timeout: Duration::from_secs(30),
                notification_timeout: Duration::from_secs(10),
                timeout_policy: TimeoutPolicy::Deny,
            }
        }

        #[tokio::test(start_paused = true)]
        async fn unanswered_request_times_out_as_deny() {
            let h = harness(short()).await;
            let started = Instant::now();
            let outcome = h
                .broker
                .request(&s1(), RequestKind::Permission, "?", Some("Bash".into()), bash("ls"))
                .await
                .unwrap();

            assert!(started.elapsed() >= Duration::from_secs(30));
            assert_eq!(outcome.decision, Decision::Timeout);
            assert_eq!(outcome.decider, Decider::Auto);
            assert!(!outcome.allowed);

            let session = h.sessions.get(&s1()).await.unwrap();
            assert!(session.pending_request.is_none());
            assert_eq!(session.control_state, ControlState::CliActive);

            let stored: PendingRequest = h
                .sessions
                .records()
                .load(Collection::Requests, &outcome.request_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.decision, Decision::Timeout);
        }

        #[tokio::test(start_paused = true)]
        async fn timeout_keeps_remote_control() {
            let h = harness(short()).await;
            {
                let mut slot = h.sessions.lock(&s1()).await.unwrap();
                slot.session.control_state = ControlState::RemoteActive;
                h.sessions.commit(&mut slot).await.unwrap();
            }

            let outcome = h
                .broker
                .request(&s1(), RequestKind::Permission, "?", Some("Bash".into()), bash("make"))
                .await
                .unwrap();
            assert_eq!(outcome.decision, Decision::Timeout);

            let session = h.sessions.get(&s1()).await.unwrap();
            assert!(session.pending_request.is_none());
            assert_eq!(session.control_state, ControlState::RemoteActive);
            assert_eq!(session.status, SessionStatus::Running);
        }

        #[tokio::test(start_paused = true)]
        async fn notification_kinds_use_their_own_timeout() {
            let h = harness(short()).await;
            let started = Instant::now();
            h.broker
                .request(&s1(), RequestKind::Info, "fyi", None, None)
                .await
                .unwrap();

            let waited = started.elapsed();
            assert!(waited >= Duration::from_secs(10));
            assert!(waited < Duration::from_secs(30));
        }

        #[tokio::test(start_paused = true)]
        async fn allow_policy_lets_timeout_proceed() {
            let mut settings = short();
            settings.timeout_policy = TimeoutPolicy::Allow;
            let h = harness(settings).await;

            let outcome = h
                .broker
                .request(&s1(), RequestKind::Info, "fyi", None, None)
                .await
                .unwrap();
            assert_eq!(outcome.decision, Decision::Timeout);
            assert!(outcome.allowed);
        }

        #[tokio::test(start_paused = true)]
        async fn resolve_after_timeout_is_noop() {
            let h = harness(short()).await;
            h.broker
                .request(&s1(), RequestKind::Warning, "careful", None, None)
                .await
                .unwrap();

            let resolved = h
                .broker
                .resolve(&s1(), Decision::Approved, Decider::Web, None, None, None)
                .await
                .unwrap();
            assert!(!resolved);
        }

        #[tokio::test(start_paused = true)]
        async fn second_request_waits_for_first() {
            let h = harness(BrokerSettings::default()).await;
            let first = open_request(&h, "first").await;
            let first_id = h.sessions.get(&s1()).await.unwrap().pending_request.unwrap().id;

            let broker = Arc::clone(&h.broker);
            let second = tokio::spawn(async move {
                broker
                    .request(&s1(), RequestKind::Permission, "second", Some("Bash".into()), bash("second"))
                    .await
            });
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(
                h.sessions.get(&s1()).await.unwrap().pending_request.unwrap().id,
                first_id
            );

            h.broker
                .resolve(&s1(), Decision::Approved, Decider::Web, None, None, None)
                .await
                .unwrap();
            first.await.unwrap().unwrap();

            wait_until_open(&h).await;
            h.broker
                .resolve(&s1(), Decision::Denied, Decider::Web, None, None, None)
                .await
                .unwrap();
            assert_eq!(second.await.unwrap().unwrap().decision, Decision::Denied);
        }

        #[tokio::test(start_paused = true)]
        async fn queued_request_times_out_behind_open_one() {
            let h = harness(short()).await;
            let first = open_request(&h, "first").await;

            let started = Instant::now();
            let second = h
                .broker
                .request(&s1(), RequestKind::Permission, "second", Some("Bash".into()), bash("second"))
                .await
                .unwrap();
            assert_eq!(second.decision, Decision::Timeout);
            assert!(started.elapsed() <= Duration::from_secs(30));

            assert_eq!(first.await.unwrap().unwrap().decision, Decision::Timeout);
        }
    }

    mod stop_requests {
        use super::*;

        #[tokio::test]
        async fn stop_drains_queued_message() {
            let h = harness(BrokerSettings::default()).await;
            h.queue.enqueue(&s1(), "now run the tests", Actor::Chat).await.unwrap();

            let outcome = h
                .broker
                .request(&s1(), RequestKind::Stop, "done", None, None)
                .await
                .unwrap();
            assert_eq!(outcome.decision, Decision::Approved);
            assert_eq!(outcome.decider, Decider::Auto);
            assert_eq!(outcome.reply.as_deref(), Some("now run the tests"));
            assert!(h.queue.list(&s1()).await.is_empty());
        }

        #[tokio::test]
        async fn stop_without_reply_leaves_session_waiting() {
            let h = harness(BrokerSettings::default()).await;
            let broker = Arc::clone(&h.broker);
            let handle = tokio::spawn(async move {
                broker.request(&s1(), RequestKind::Stop, "done", None, None).await
            });
            wait_until_open(&h).await;

            h.broker
                .resolve(&s1(), Decision::Approved, Decider::Web, None, None, None)
                .await
                .unwrap();
            handle.await.unwrap().unwrap();

            let session = h.sessions.get(&s1()).await.unwrap();
            assert_eq!(session.status, SessionStatus::Waiting);
        }
    }
}

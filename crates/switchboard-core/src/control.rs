//! Control-state coordination between the CLI and remote actors.
//!
//! ```text
//!               handoff                     release (CLI attached)
//! cli_active ─────────────► remote_active ───────────────────► cli_waiting
//!     ▲  │                    ▲      │                            │
//!     │  │ heartbeat          │      │ release (no CLI)           │
//!     │  ▼                    │      ▼                            │
//! cli_waiting ────────────────┘   released ◄──── detach ──────────┘
//! ```
//!
//! Every transition happens under the session's slot lock, so concurrent
//! handoffs resolve to exactly one winner.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::error::{CoreError, CoreResult};
use crate::notify::{NotificationKind, Notifier};
use crate::permission::PermissionBroker;
use crate::session::{Actor, ControlState, Session, SessionId, SessionRegistry, SessionStatus};

/// Upper bound between re-checks while waiting for a release.
const RELEASE_POLL: Duration = Duration::from_secs(1);

/// What the CLI reports on each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heartbeat {
    /// Idle at a prompt.
    Waiting,
    /// Working on a turn.
    Active,
}

pub struct ControlCoordinator {
    sessions: Arc<SessionRegistry>,
    broker: Arc<PermissionBroker>,
    notifier: Arc<Notifier>,
}

impl ControlCoordinator {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        broker: Arc<PermissionBroker>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            sessions,
            broker,
            notifier,
        }
    }

    /// Create the session or re-attach the CLI to it.
    pub async fn register(
        &self,
        session_id: &SessionId,
        project_dir: &str,
        name: Option<String>,
    ) -> CoreResult<Session> {
        if project_dir.trim().is_empty() {
            return Err(CoreError::InvalidInput("project_dir is required".to_string()));
        }

        let (mut slot, created) = self
            .sessions
            .lock_or_create(session_id, || {
                Session::new(session_id.clone(), project_dir, name.clone())
            })
            .await;

        if created {
            log::info!("Registered session {} in {}", session_id, project_dir);
        } else {
            let session = &mut slot.session;
            session.cli_attached = true;
            session.deleted_at = None;
            session.project_dir = project_dir.to_string();
            if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                session.name = name;
            }
            if session.control_state != ControlState::RemoteActive {
                session.control_state = ControlState::CliActive;
                session.status = active_status(session);
            }
            log::info!(
                "CLI re-attached to session {} ({:?})",
                session_id,
                session.control_state
            );
        }

        self.sessions.commit(&mut slot).await
    }

    /// Give a remote actor control. Exactly one concurrent caller wins.
    pub async fn handoff(&self, session_id: &SessionId, actor: Actor) -> CoreResult<Session> {
        let mut slot = self.sessions.lock(session_id).await?;
        if slot.session.is_deleted() {
            return Err(CoreError::not_found("session", session_id));
        }
        if slot.session.control_state == ControlState::RemoteActive {
            return Err(CoreError::Conflict("already under remote control".to_string()));
        }

        slot.session.control_state = ControlState::RemoteActive;
        slot.session.controller = Some(actor);
        log::info!("Session {} handed off to {:?}", session_id, actor);
        self.sessions.commit(&mut slot).await
    }

    /// Return control from the remote actor. Running tasks keep running.
    pub async fn release(&self, session_id: &SessionId) -> CoreResult<Session> {
        let mut slot = self.sessions.lock(session_id).await?;
        if slot.session.control_state != ControlState::RemoteActive {
            return Err(CoreError::Conflict(format!(
                "session {session_id} is not under remote control"
            )));
        }

        let busy = slot.running_task().is_some();
        let session = &mut slot.session;
        session.controller = None;
        if session.cli_attached {
            session.control_state = ControlState::CliWaiting;
            if !busy {
                session.status = SessionStatus::Waiting;
            }
        } else {
            session.control_state = ControlState::Released;
        }
        log::info!("Session {} released ({:?})", session_id, session.control_state);
        self.sessions.commit(&mut slot).await
    }

    /// Record CLI liveness. Returns the session so the CLI can tell whether
    /// it still holds control.
    pub async fn heartbeat(&self, session_id: &SessionId, signal: Heartbeat) -> CoreResult<Session> {
        let mut slot = self.sessions.lock(session_id).await?;
        let session = &mut slot.session;

        match session.control_state {
            ControlState::RemoteActive => {}
            state => {
                if state == ControlState::Released {
                    log::info!("CLI is back on session {}", session_id);
                    session.cli_attached = true;
                }
                match signal {
                    Heartbeat::Waiting => {
                        session.control_state = ControlState::CliWaiting;
                        session.status = SessionStatus::Waiting;
                    }
                    Heartbeat::Active => {
                        session.control_state = ControlState::CliActive;
                        session.status = active_status(session);
                    }
                }
            }
        }

        self.sessions.commit(&mut slot).await
    }

    /// The CLI process exited. Its hook can no longer act on an answer, so
    /// an open request is denied first.
    pub async fn detach(&self, session_id: &SessionId) -> CoreResult<Session> {
        let mut slot = self.sessions.lock(session_id).await?;
        if let Some(request) = self.broker.abort(&mut slot, "cli detached").await {
            log::info!("Denied request {} of detached session {}", request.id, session_id);
        }
        let session = &mut slot.session;
        session.cli_attached = false;
        session.status = SessionStatus::Stopped;
        if matches!(
            session.control_state,
            ControlState::CliActive | ControlState::CliWaiting
        ) {
            session.control_state = ControlState::Released;
        }
        let session = self.sessions.commit(&mut slot).await?;
        drop(slot);

        log::info!("CLI detached from session {}", session_id);
        if let Err(e) = self
            .notifier
            .notify(
                Some(session_id),
                NotificationKind::SessionStopped,
                format!("Session {} stopped", session.name),
            )
            .await
        {
            log::warn!("Failed to notify about session {}: {}", session_id, e);
        }
        Ok(session)
    }

    /// Wait until the session is no longer under remote control, or until
    /// `timeout` elapses. Returns the session as last seen.
    pub async fn wait_for_release(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> CoreResult<Session> {
        let deadline = Instant::now() + timeout;
        let mut updates = self.sessions.bus().subscribe(format!("session:{session_id}"));

        loop {
            let session = self
                .sessions
                .get(session_id)
                .await
                .ok_or_else(|| CoreError::not_found("session", session_id))?;
            if !session.is_remote_controlled() || Instant::now() >= deadline {
                return Ok(session);
            }

            let wake = (Instant::now() + RELEASE_POLL).min(deadline);
            if let Ok(None) = timeout_at(wake, updates.recv()).await {
                sleep_until(wake).await;
            }
        }
    }
}

/// Running, unless an open request holds the session at `waiting`.
fn active_status(session: &Session) -> SessionStatus {
    if session.pending_request.is_some() {
        SessionStatus::Waiting
    } else {
        SessionStatus::Running
    }
}

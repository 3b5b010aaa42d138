//! SessionRegistry - the single source of truth for session state.
//!
//! Each session lives in its own slot behind its own async mutex, so
//! transitions on one session are strictly serialized while different
//! sessions proceed in parallel. The map of slots is only write-locked to
//! insert or remove a slot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard, RwLock};

use super::state::{Session, SessionId, SessionStatus};
use crate::bus::{Event, EventBus, Topic};
use crate::dispatch::TaskId;
use crate::error::{CoreError, CoreResult};
use crate::permission::{Decider, Decision, PendingRequest};
use crate::store::{Collection, Records};

/// The wake handle of a blocked hook call.
///
/// Whoever takes it out of the slot (resolver, timeout, deletion) is the
/// request's only resolver.
pub(crate) struct Waiter {
    pub request_id: String,
    pub tx: oneshot::Sender<PendingRequest>,
}

/// A session plus the in-memory handles that do not survive a restart.
pub struct SessionSlot {
    pub session: Session,
    pub(crate) waiter: Option<Waiter>,
    pub(crate) running_task: Option<TaskId>,
    /// Set while the session is being deleted; no new task may claim it.
    pub(crate) closing: bool,
    removed: bool,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session,
            waiter: None,
            running_task: None,
            closing: false,
            removed: false,
        }
    }

    pub fn running_task(&self) -> Option<&TaskId> {
        self.running_task.as_ref()
    }

    pub fn has_waiter(&self) -> bool {
        self.waiter.is_some()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

pub type SlotGuard = OwnedMutexGuard<SessionSlot>;

pub struct SessionRegistry {
    slots: RwLock<HashMap<SessionId, Arc<Mutex<SessionSlot>>>>,
    records: Records,
    bus: Arc<EventBus>,
}

impl SessionRegistry {
    pub fn new(records: Records, bus: Arc<EventBus>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            records,
            bus,
        }
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Rebuild the in-memory index from the store.
    ///
    /// Requests that were open when the process stopped lost their waiters;
    /// they are recorded as timed out so the persisted view stays consistent.
    /// Reconnecting hooks re-issue their request.
    pub async fn load(&self) -> CoreResult<usize> {
        let sessions: Vec<Session> = self.records.load_all(Collection::Sessions).await?;
        let count = sessions.len();

        let mut slots = self.slots.write().await;
        for mut session in sessions {
            if let Some(mut request) = session.pending_request.take() {
                if request.resolve(Decision::Timeout, Decider::Auto, None) {
                    log::info!(
                        "Expiring request {} of session {} left open by previous run",
                        request.id,
                        session.id
                    );
                    self.records
                        .save(Collection::Requests, &request.id, &request)
                        .await?;
                }
                if session.status == SessionStatus::Waiting && session.cli_attached {
                    session.status = SessionStatus::Running;
                }
                self.records
                    .save(Collection::Sessions, session.id.as_str(), &session)
                    .await?;
            }
            slots.insert(session.id.clone(), Arc::new(Mutex::new(SessionSlot::new(session))));
        }

        log::info!("Loaded {} sessions", count);
        Ok(count)
    }

    /// Lock a session's slot. Fails with `NotFound` for unknown ids.
    pub async fn lock(&self, id: &SessionId) -> CoreResult<SlotGuard> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(id).cloned()
        };
        let slot = slot.ok_or_else(|| CoreError::not_found("session", id))?;
        let guard = slot.lock_owned().await;
        if guard.removed {
            return Err(CoreError::not_found("session", id));
        }
        Ok(guard)
    }

    /// Lock a session's slot, creating it with `make` when missing.
    ///
    /// Returns whether the slot was created. A created slot is not persisted
    /// until [`commit`](Self::commit) is called.
    pub async fn lock_or_create(
        &self,
        id: &SessionId,
        make: impl Fn() -> Session,
    ) -> (SlotGuard, bool) {
        loop {
            let (slot, created) = {
                let mut slots = self.slots.write().await;
                match slots.get(id) {
                    Some(slot) => (Arc::clone(slot), false),
                    None => {
                        let slot = Arc::new(Mutex::new(SessionSlot::new(make())));
                        slots.insert(id.clone(), Arc::clone(&slot));
                        (slot, true)
                    }
                }
            };
            let guard = slot.lock_owned().await;
            // Lost a race with removal; the next pass creates a fresh slot.
            if !guard.removed {
                return (guard, created);
            }
        }
    }

    /// Persist the slot's session and publish it on `sessions` and
    /// `session:{id}`.
    ///
    /// The durable write happens before anyone is told about the change.
    pub async fn commit(&self, slot: &mut SessionSlot) -> CoreResult<Session> {
        if slot.removed {
            return Err(CoreError::not_found("session", &slot.session.id));
        }
        slot.session.touch();
        self.records
            .save(Collection::Sessions, slot.session.id.as_str(), &slot.session)
            .await?;

        let session = slot.session.clone();
        for topic in [Topic::Sessions, Topic::Session(session.id.clone())] {
            self.bus.publish(
                &topic,
                Event::SessionUpdated {
                    session: session.clone(),
                },
            );
        }
        Ok(session)
    }

    /// Remove a session from the registry and the store.
    ///
    /// The caller must hold the slot; later lockers see `NotFound`.
    pub async fn remove(&self, slot: &mut SessionSlot) -> CoreResult<()> {
        slot.removed = true;
        let id = slot.session.id.clone();
        self.slots.write().await.remove(&id);
        self.records.remove(Collection::Sessions, id.as_str()).await?;
        Ok(())
    }

    /// Mark the slot's session soft-deleted and persist it.
    pub async fn soft_delete(&self, slot: &mut SessionSlot) -> CoreResult<Session> {
        slot.session.deleted_at = Some(Utc::now());
        self.commit(slot).await
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(id).cloned()
        }?;
        let guard = slot.lock().await;
        if guard.removed {
            return None;
        }
        Some(guard.session.clone())
    }

    /// Whether the session exists. Soft-deleted sessions count; removed
    /// ones do not.
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.get(id).await.is_some()
    }

    /// Whether the session currently runs a task.
    pub async fn running_task(&self, id: &SessionId) -> Option<TaskId> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(id).cloned()
        }?;
        let guard = slot.lock().await;
        guard.running_task.clone()
    }

    /// All sessions, most recently active first.
    pub async fn list(&self, include_deleted: bool) -> Vec<Session> {
        let slots: Vec<Arc<Mutex<SessionSlot>>> =
            self.slots.read().await.values().cloned().collect();

        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.lock().await;
            if guard.removed || (!include_deleted && guard.session.is_deleted()) {
                continue;
            }
            sessions.push(guard.session.clone());
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }
}

//! Task dispatcher.
//!
//! Runs prompts against the agent on behalf of remote actors. A session
//! runs at most one task at a time; the claim lives in the session slot so
//! it is checked and taken under the same lock as every other transition.
//! Custom tasks (no session) are unconstrained.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::agent::{AgentActivity, AgentError, AgentInvocation, AgentOutput, AgentRunner};
use super::queue::MessageQueue;
use super::task::{Task, TaskId, TaskPhase, TaskRequest};
use crate::bus::{Event, Topic};
use crate::chat::{ChatLog, TurnRole};
use crate::error::{CoreError, CoreResult};
use crate::notify::{NotificationKind, Notifier};
use crate::session::{ControlState, SessionId, SessionRegistry, SessionStatus};
use crate::store::Collection;

/// Longest prompt excerpt quoted in notifications.
const PROMPT_EXCERPT: usize = 60;

/// Where a finished task's final record is delivered.
type Done = oneshot::Sender<CoreResult<Task>>;

/// A reserved task id. `running` is set once the task is persisted and its
/// run is spawned; whoever removes the entry settles the task.
struct ActiveTask {
    cancel: CancellationToken,
    running: Option<(Task, Done)>,
}

pub struct TaskDispatcher {
    sessions: Arc<SessionRegistry>,
    queue: Arc<MessageQueue>,
    chat: Arc<ChatLog>,
    notifier: Arc<Notifier>,
    runner: Arc<dyn AgentRunner>,
    active: Mutex<HashMap<TaskId, ActiveTask>>,
}

impl TaskDispatcher {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        queue: Arc<MessageQueue>,
        chat: Arc<ChatLog>,
        notifier: Arc<Notifier>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        Self {
            sessions,
            queue,
            chat,
            notifier,
            runner,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Mark tasks left running by a previous process as failed.
    pub async fn load(&self) -> CoreResult<usize> {
        let tasks: Vec<Task> = self.sessions.records().load_all(Collection::Tasks).await?;
        let mut interrupted = 0;
        for mut task in tasks.into_iter().filter(|t| !t.is_finished()) {
            task.phase = TaskPhase::Failed;
            task.error = Some("interrupted by restart".to_string());
            task.finished_at = Some(Utc::now());
            self.sessions
                .records()
                .save(Collection::Tasks, task.id.as_str(), &task)
                .await?;
            interrupted += 1;
        }
        if interrupted > 0 {
            log::warn!("Marked {} interrupted tasks as failed", interrupted);
        }
        Ok(interrupted)
    }

    /// Start a task and return it while it runs.
    pub async fn submit(self: &Arc<Self>, request: TaskRequest) -> CoreResult<Task> {
        let (task, _done) = self.start(request).await?;
        Ok(task)
    }

    /// Start a task and wait for its terminal state.
    ///
    /// Fails with the store error when the terminal record could not be
    /// written.
    pub async fn execute(self: &Arc<Self>, request: TaskRequest) -> CoreResult<Task> {
        let (_, done) = self.start(request).await?;
        done.await
            .map_err(|_| CoreError::Agent("task runner went away".to_string()))?
    }

    /// Stop a running task. False when it is unknown or already settled.
    ///
    /// The task is recorded as cancelled and its session claim dropped
    /// before this returns; the agent is signalled and winds down on its
    /// own.
    pub async fn cancel(self: &Arc<Self>, task_id: &TaskId) -> bool {
        let running = {
            let mut active = self.active.lock().await;
            match active.get(task_id) {
                Some(entry) if entry.running.is_some() => {}
                _ => return false,
            }
            active.remove(task_id).and_then(|entry| {
                entry.cancel.cancel();
                entry.running
            })
        };
        let Some((mut task, done)) = running else {
            return false;
        };

        log::info!("Cancelling task {}", task_id);
        apply_result(&mut task, Err(AgentError::Cancelled));
        self.settle(task, done).await;
        true
    }

    /// Cancel whatever the session is running.
    pub async fn cancel_for_session(self: &Arc<Self>, session_id: &SessionId) -> bool {
        match self.sessions.running_task(session_id).await {
            Some(task_id) => self.cancel(&task_id).await,
            None => false,
        }
    }

    pub async fn is_running(&self, task_id: &TaskId) -> bool {
        self.active.lock().await.contains_key(task_id)
    }

    /// Tasks, newest first, optionally limited to one session.
    pub async fn list(&self, session_id: Option<&SessionId>) -> CoreResult<Vec<Task>> {
        let records = self.sessions.records();
        let mut tasks: Vec<Task> = match session_id {
            Some(id) => records.load_for_session(Collection::Tasks, id.as_str()).await?,
            None => records.load_all(Collection::Tasks).await?,
        };
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    pub async fn get(&self, task_id: &TaskId) -> CoreResult<Task> {
        self.sessions
            .records()
            .load(Collection::Tasks, task_id.as_str())
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    /// Submit the session's next queued message if the session is idle and
    /// not driven by the CLI. Returns the started task, if any.
    pub async fn drain(self: &Arc<Self>, session_id: &SessionId) -> CoreResult<Option<Task>> {
        let Some(session) = self.sessions.get(session_id).await else {
            return Ok(None);
        };
        let remote_driven = matches!(
            session.control_state,
            ControlState::RemoteActive | ControlState::Released
        );
        if !remote_driven || session.is_deleted() || session.pending_request.is_some() {
            return Ok(None);
        }
        if self.sessions.running_task(session_id).await.is_some() {
            return Ok(None);
        }

        let Some(message) = self.queue.take_next(session_id).await? else {
            return Ok(None);
        };
        match self.submit(TaskRequest::from_message(&message)).await {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                self.queue.restore(message).await?;
                if e.is_conflict() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn start(
        self: &Arc<Self>,
        request: TaskRequest,
    ) -> CoreResult<(Task, oneshot::Receiver<CoreResult<Task>>)> {
        if request.prompt.trim().is_empty() {
            return Err(CoreError::InvalidInput("prompt is empty".to_string()));
        }
        let id = request.id.clone().unwrap_or_default();
        let cancel = CancellationToken::new();
        self.reserve(&id, &cancel).await?;

        let working_dir = match &request.session_id {
            Some(session_id) => match self.claim(session_id, &id).await {
                Ok(project_dir) => request.working_dir.clone().or(Some(project_dir)),
                Err(e) => {
                    self.active.lock().await.remove(&id);
                    return Err(e);
                }
            },
            None => request.working_dir.clone(),
        };

        let task = Task::running(id.clone(), &request, working_dir);
        if let Err(e) = self
            .sessions
            .records()
            .save(Collection::Tasks, id.as_str(), &task)
            .await
        {
            self.active.lock().await.remove(&id);
            if let Some(session_id) = &request.session_id {
                self.release(session_id, &id).await;
            }
            return Err(e.into());
        }

        log::info!(
            "Started task {} for {}",
            id,
            task.session_id
                .as_ref()
                .map(|s| format!("session {s}"))
                .unwrap_or_else(|| "custom run".to_string())
        );
        let bus = self.sessions.bus();
        bus.publish(&Topic::Task(id.clone()), Event::TaskStarted { task: task.clone() });
        if let Some(session_id) = &task.session_id {
            bus.publish(
                &Topic::Thinking(session_id.clone()),
                Event::Thinking {
                    session_id: session_id.clone(),
                    active: true,
                },
            );
            self.record_turn(session_id, TurnRole::User, &task.prompt, &task)
                .await;
        }

        let (done_tx, done_rx) = oneshot::channel();
        if let Some(entry) = self.active.lock().await.get_mut(&id) {
            entry.running = Some((task.clone(), done_tx));
        }
        tokio::spawn(spawn_run(Arc::clone(self), task.clone(), cancel));
        Ok((task, done_rx))
    }

    /// Register the cancellation handle before anything runs.
    async fn reserve(&self, id: &TaskId, cancel: &CancellationToken) -> CoreResult<()> {
        let mut active = self.active.lock().await;
        let known = active.contains_key(id)
            || self
                .sessions
                .records()
                .load::<Task>(Collection::Tasks, id.as_str())
                .await?
                .is_some();
        if known {
            return Err(CoreError::Conflict(format!("task {id} already exists")));
        }
        active.insert(
            id.clone(),
            ActiveTask {
                cancel: cancel.clone(),
                running: None,
            },
        );
        Ok(())
    }

    /// Take the session's single task claim. Returns its project directory.
    async fn claim(&self, session_id: &SessionId, task_id: &TaskId) -> CoreResult<String> {
        let mut slot = self.sessions.lock(session_id).await?;
        if slot.session.is_deleted() || slot.is_closing() {
            return Err(CoreError::not_found("session", session_id));
        }
        if slot.running_task.is_some() {
            return Err(CoreError::Conflict("session busy".to_string()));
        }

        slot.running_task = Some(task_id.clone());
        slot.session.status = SessionStatus::Running;
        if let Err(e) = self.sessions.commit(&mut slot).await {
            slot.running_task = None;
            return Err(e);
        }
        Ok(slot.session.project_dir.clone())
    }

    /// Drop the session's task claim if `task_id` still holds it.
    async fn release(&self, session_id: &SessionId, task_id: &TaskId) {
        let Ok(mut slot) = self.sessions.lock(session_id).await else {
            return;
        };
        if slot.running_task.as_ref() != Some(task_id) {
            return;
        }
        slot.running_task = None;
        if slot.session.control_state != ControlState::CliActive {
            slot.session.status = SessionStatus::Waiting;
        }
        if let Err(e) = self.sessions.commit(&mut slot).await {
            log::warn!("Failed to persist session {} after task: {}", session_id, e);
        }
    }

    async fn run(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel::<AgentActivity>();
        let forward = {
            let bus = Arc::clone(self.sessions.bus());
            let task_id = task.id.clone();
            let session_id = task.session_id.clone();
            tokio::spawn(async move {
                while let Some(activity) = activity_rx.recv().await {
                    bus.publish(
                        &Topic::Task(task_id.clone()),
                        Event::TaskActivity {
                            task_id: task_id.clone(),
                            session_id: session_id.clone(),
                            activity,
                        },
                    );
                }
            })
        };

        let invocation = AgentInvocation {
            task_id: task.id.clone(),
            prompt: task.prompt.clone(),
            model: task.model.clone(),
            reasoning: task.reasoning.clone(),
            working_dir: task.working_dir.clone(),
        };
        let agent = {
            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move { runner.run(invocation, activity_tx, cancel).await })
        };
        let result = match agent.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Agent for task {} did not return: {}", task.id, e);
                Err(AgentError::Failed(if e.is_panic() {
                    "agent panicked".to_string()
                } else {
                    "agent aborted".to_string()
                }))
            }
        };
        let _ = forward.await;

        self.finish(&task.id, result).await;
    }

    /// Record the agent's result unless `cancel` already settled the task.
    async fn finish(self: &Arc<Self>, task_id: &TaskId, result: Result<AgentOutput, AgentError>) {
        let running = self
            .active
            .lock()
            .await
            .remove(task_id)
            .and_then(|entry| entry.running);
        let Some((mut task, done)) = running else {
            log::debug!("Task {} was settled before its agent returned", task_id);
            return;
        };

        apply_result(&mut task, result);
        self.settle(task, done).await;
    }

    /// Persist a terminal task, report it, free its session and hand the
    /// record to whoever waits on it.
    async fn settle(self: &Arc<Self>, task: Task, done: Done) {
        log::info!("Task {} finished: {:?}", task.id, task.phase);

        let saved = self
            .sessions
            .records()
            .save(Collection::Tasks, task.id.as_str(), &task)
            .await;
        if let Err(e) = &saved {
            log::error!("Failed to persist task {}: {}", task.id, e);
        }
        if let Some(session_id) = &task.session_id {
            let (role, text) = match task.phase {
                TaskPhase::Completed => (TurnRole::Assistant, task.result.clone().unwrap_or_default()),
                TaskPhase::Cancelled => (TurnRole::System, "Task cancelled".to_string()),
                _ => (
                    TurnRole::System,
                    format!("Task failed: {}", task.error.as_deref().unwrap_or_default()),
                ),
            };
            self.record_turn(session_id, role, &text, &task).await;
        }
        self.notify_finished(&task).await;
        if let Some(session_id) = &task.session_id {
            self.release(session_id, &task.id).await;
        }

        let bus = self.sessions.bus();
        bus.publish(&Topic::Task(task.id.clone()), Event::TaskFinished { task: task.clone() });
        if let Some(session_id) = &task.session_id {
            bus.publish(
                &Topic::Thinking(session_id.clone()),
                Event::Thinking {
                    session_id: session_id.clone(),
                    active: false,
                },
            );
        }

        let session_id = task.session_id.clone();
        let _ = done.send(saved.map(|_| task).map_err(CoreError::from));

        if let Some(session_id) = session_id {
            if let Err(e) = self.drain(&session_id).await {
                log::warn!("Failed to drain queue of session {}: {}", session_id, e);
            }
        }
    }

    async fn record_turn(&self, session_id: &SessionId, role: TurnRole, content: &str, task: &Task) {
        if content.trim().is_empty() {
            return;
        }
        let source = (role == TurnRole::User).then_some(task.source);
        if let Err(e) = self
            .chat
            .append(session_id, role, content, Some(task.id.clone()), source)
            .await
        {
            log::warn!("Failed to record chat turn for task {}: {}", task.id, e);
        }
    }

    async fn notify_finished(&self, task: &Task) {
        let (kind, message) = match task.phase {
            TaskPhase::Completed => (
                NotificationKind::TaskCompleted,
                format!("Task completed: {}", excerpt(&task.prompt)),
            ),
            TaskPhase::Failed => (
                NotificationKind::TaskFailed,
                format!(
                    "Task failed: {} ({})",
                    excerpt(&task.prompt),
                    task.error.as_deref().unwrap_or("unknown error")
                ),
            ),
            _ => return,
        };
        if let Err(e) = self
            .notifier
            .notify(task.session_id.as_ref(), kind, message)
            .await
        {
            log::warn!("Failed to notify about task {}: {}", task.id, e);
        }
    }
}

/// Boxed so the run loop (run, finish, drain, start, run) has a nameable type.
fn spawn_run(
    dispatcher: Arc<TaskDispatcher>,
    task: Task,
    cancel: CancellationToken,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(dispatcher.run(task, cancel))
}

fn apply_result(task: &mut Task, result: Result<AgentOutput, AgentError>) {
    task.finished_at = Some(Utc::now());
    task.success = false;

    match result {
        Err(AgentError::Cancelled) => {
            task.phase = TaskPhase::Cancelled;
            task.error = Some("cancelled".to_string());
        }
        Ok(output) => {
            task.duration_ms = Some(output.duration_ms);
            task.num_turns = Some(output.num_turns);
            if output.is_error {
                task.phase = TaskPhase::Failed;
                task.error = Some(output.result);
            } else {
                task.phase = TaskPhase::Completed;
                task.success = true;
                task.result = Some(output.result);
            }
        }
        Err(e) => {
            task.phase = TaskPhase::Failed;
            task.error = Some(e.to_string());
        }
    }
}

fn excerpt(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or_default();
    if line.chars().count() > PROMPT_EXCERPT {
        let cut: String = line.chars().take(PROMPT_EXCERPT).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

//! HTTP route handlers for command invocation.
//!
//! The main route is `/api/invoke/{command}` which accepts POST requests
//! with a JSON body `{"args": {...}}` (camelCase keys) and dispatches to the
//! matching conductor operation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchboard_core::chat::TurnRole;
use switchboard_core::control::Heartbeat;
use switchboard_core::dispatch::{TaskId, TaskRequest};
use switchboard_core::permission::{Decider, Decision, NewRule, RequestKind, RuleEffect, RuleScope};
use switchboard_core::{Actor, CoreError, SessionId};

use crate::SharedState;

/// Response format for command invocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeResponse {
    /// Whether the command succeeded.
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request body for command invocation.
#[derive(Debug, Default, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub args: Value,
}

/// Everything a command can fail with, mapped to a status code in one place.
#[derive(Debug)]
enum ApiError {
    BadArgs(String),
    UnknownCommand(String),
    Core(CoreError),
    Encode(serde_json::Error),
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self::Core(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadArgs(_) => StatusCode::BAD_REQUEST,
            Self::UnknownCommand(_) => StatusCode::NOT_FOUND,
            Self::Core(CoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Core(CoreError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Core(CoreError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Self::Core(CoreError::Store(_) | CoreError::Agent(_)) | Self::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadArgs(msg) => format!("Invalid arguments: {msg}"),
            Self::UnknownCommand(command) => format!("Unknown command: {command}"),
            Self::Core(error) => error.to_string(),
            Self::Encode(error) => format!("Cannot encode response: {error}"),
        }
    }
}

type CommandResult = Result<Value, ApiError>;

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ApiError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ApiError::BadArgs(e.to_string()))
}

fn to_data<T: Serialize>(value: T) -> CommandResult {
    serde_json::to_value(value).map_err(ApiError::Encode)
}

/// Handler for POST /api/invoke/{command}
pub async fn invoke_handler(
    Path(command): Path<String>,
    State(state): State<Arc<SharedState>>,
    Json(request): Json<InvokeRequest>,
) -> (StatusCode, Json<InvokeResponse>) {
    log::debug!("HTTP invoke: {} with args: {:?}", command, request.args);

    match dispatch(&state, &command, request.args).await {
        Ok(data) => (
            StatusCode::OK,
            Json(InvokeResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        ),
        Err(error) => {
            let status = error.status();
            if status.is_server_error() {
                log::error!("Command {} failed: {}", command, error.message());
            } else {
                log::debug!("Command {} rejected: {}", command, error.message());
            }
            (
                status,
                Json(InvokeResponse {
                    success: false,
                    data: None,
                    error: Some(error.message()),
                }),
            )
        }
    }
}

/// Handler for GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn dispatch(state: &SharedState, command: &str, args: Value) -> CommandResult {
    match command {
        // Hook surface
        "register_session" => register_session(state, args).await,
        "request" => request(state, args).await,
        "heartbeat" => heartbeat(state, args).await,
        "detach_session" => detach_session(state, args).await,
        "wait_for_release" => wait_for_release(state, args).await,
        "append_chat" => append_chat(state, args).await,

        // Sessions and control
        "list_sessions" => list_sessions(state, args).await,
        "get_session" => get_session(state, args).await,
        "delete_session" => delete_session(state, args).await,
        "handoff" => handoff(state, args).await,
        "release" => release(state, args).await,
        "resolve" => resolve(state, args).await,

        // Tasks
        "execute_task" => execute_task(state, args).await,
        "cancel_task" => cancel_task(state, args).await,
        "list_tasks" => list_tasks(state, args).await,
        "get_task" => get_task(state, args).await,

        // Allowlist
        "list_rules" => list_rules(state, args).await,
        "add_rule" => add_rule(state, args).await,
        "remove_rule" => remove_rule(state, args).await,

        // Queue and chat
        "enqueue_message" => enqueue_message(state, args).await,
        "list_queue" => list_queue(state, args).await,
        "cancel_message" => cancel_message(state, args).await,
        "get_chat" => get_chat(state, args).await,

        // Notifications
        "list_notifications" => list_notifications(state, args).await,
        "mark_notification_read" => mark_notification_read(state, args).await,
        "mark_all_notifications_read" => to_data(json!({
            "updated": state.conductor.notifier.mark_all_read().await?
        })),
        "clear_notifications" => to_data(json!({
            "cleared": state.conductor.notifier.clear().await?
        })),

        _ => Err(ApiError::UnknownCommand(command.to_string())),
    }
}

// ============================================================================
// ARGUMENTS
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionArgs {
    session_id: SessionId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterArgs {
    session_id: SessionId,
    project_dir: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestArgs {
    session_id: SessionId,
    kind: RequestKind,
    #[serde(default)]
    message: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatArgs {
    session_id: SessionId,
    state: Heartbeat,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitArgs {
    session_id: SessionId,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendChatArgs {
    session_id: SessionId,
    role: TurnRole,
    content: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListSessionsArgs {
    include_deleted: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteArgs {
    session_id: SessionId,
    #[serde(default)]
    hard: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandoffArgs {
    session_id: SessionId,
    #[serde(default)]
    actor: Actor,
}

fn default_decider() -> Decider {
    Decider::Web
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveArgs {
    session_id: SessionId,
    decision: Decision,
    #[serde(default = "default_decider")]
    decider: Decider,
    #[serde(default)]
    scope: Option<RuleScope>,
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteTaskArgs {
    #[serde(default)]
    task_id: Option<TaskId>,
    #[serde(default)]
    session_id: Option<SessionId>,
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    source: Actor,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    wait: bool,
}

impl ExecuteTaskArgs {
    fn into_request(self) -> (TaskRequest, bool) {
        let request = TaskRequest {
            id: self.task_id,
            session_id: self.session_id,
            prompt: self.prompt,
            model: self.model,
            reasoning: self.reasoning,
            source: self.source,
            working_dir: self.working_dir,
        };
        (request, self.wait)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskArgs {
    task_id: TaskId,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct OptionalSessionArgs {
    session_id: Option<SessionId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddRuleArgs {
    tool: String,
    pattern: String,
    /// Inferred from `session_id` when omitted.
    #[serde(default)]
    scope: Option<RuleScope>,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    effect: RuleEffect,
}

impl From<AddRuleArgs> for NewRule {
    fn from(args: AddRuleArgs) -> Self {
        let scope = args.scope.unwrap_or(if args.session_id.is_some() {
            RuleScope::Session
        } else {
            RuleScope::Global
        });
        NewRule {
            tool: args.tool,
            pattern: args.pattern,
            scope,
            session_id: args.session_id,
            effect: args.effect,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleArgs {
    rule_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueArgs {
    session_id: SessionId,
    text: String,
    #[serde(default)]
    source: Actor,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageArgs {
    message_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListNotificationsArgs {
    unread_only: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationArgs {
    notification_id: String,
}

// ============================================================================
// HOOK COMMANDS
// ============================================================================

async fn register_session(state: &SharedState, args: Value) -> CommandResult {
    let args: RegisterArgs = parse_args(args)?;
    let session = state
        .conductor
        .control
        .register(&args.session_id, &args.project_dir, args.name)
        .await?;
    to_data(session)
}

/// Blocks until the request is decided or times out.
async fn request(state: &SharedState, args: Value) -> CommandResult {
    let args: RequestArgs = parse_args(args)?;
    let outcome = state
        .conductor
        .broker
        .request(&args.session_id, args.kind, args.message, args.tool, args.args)
        .await?;
    to_data(outcome)
}

async fn heartbeat(state: &SharedState, args: Value) -> CommandResult {
    let args: HeartbeatArgs = parse_args(args)?;
    let session = state
        .conductor
        .control
        .heartbeat(&args.session_id, args.state)
        .await?;
    to_data(session)
}

async fn detach_session(state: &SharedState, args: Value) -> CommandResult {
    let args: SessionArgs = parse_args(args)?;
    to_data(state.conductor.control.detach(&args.session_id).await?)
}

async fn wait_for_release(state: &SharedState, args: Value) -> CommandResult {
    let args: WaitArgs = parse_args(args)?;
    let session = state
        .conductor
        .wait_for_release(&args.session_id, args.timeout_secs.map(Duration::from_secs))
        .await?;
    to_data(session)
}

async fn append_chat(state: &SharedState, args: Value) -> CommandResult {
    let args: AppendChatArgs = parse_args(args)?;
    let turn = state
        .conductor
        .append_chat(&args.session_id, args.role, &args.content)
        .await?;
    to_data(turn)
}

// ============================================================================
// SESSION AND CONTROL COMMANDS
// ============================================================================

async fn list_sessions(state: &SharedState, args: Value) -> CommandResult {
    let args: ListSessionsArgs = parse_args(args)?;
    to_data(state.conductor.sessions.list(args.include_deleted).await)
}

async fn get_session(state: &SharedState, args: Value) -> CommandResult {
    let args: SessionArgs = parse_args(args)?;
    to_data(state.conductor.get_session(&args.session_id).await?)
}

async fn delete_session(state: &SharedState, args: Value) -> CommandResult {
    let args: DeleteArgs = parse_args(args)?;
    state
        .conductor
        .delete_session(&args.session_id, args.hard)
        .await?;
    to_data(json!({ "deleted": true, "hard": args.hard }))
}

async fn handoff(state: &SharedState, args: Value) -> CommandResult {
    let args: HandoffArgs = parse_args(args)?;
    to_data(state.conductor.handoff(&args.session_id, args.actor).await?)
}

async fn release(state: &SharedState, args: Value) -> CommandResult {
    let args: SessionArgs = parse_args(args)?;
    to_data(state.conductor.release(&args.session_id).await?)
}

async fn resolve(state: &SharedState, args: Value) -> CommandResult {
    let args: ResolveArgs = parse_args(args)?;
    let resolved = state
        .conductor
        .resolve(
            &args.session_id,
            args.decision,
            args.decider,
            args.scope,
            args.reply,
            args.pattern,
        )
        .await?;
    to_data(json!({ "resolved": resolved }))
}

// ============================================================================
// TASK COMMANDS
// ============================================================================

async fn execute_task(state: &SharedState, args: Value) -> CommandResult {
    let args: ExecuteTaskArgs = parse_args(args)?;
    let (request, wait) = args.into_request();
    to_data(state.conductor.execute_task(request, wait).await?)
}

async fn cancel_task(state: &SharedState, args: Value) -> CommandResult {
    let args: TaskArgs = parse_args(args)?;
    let cancelled = state.conductor.dispatcher.cancel(&args.task_id).await;
    to_data(json!({ "cancelled": cancelled }))
}

async fn list_tasks(state: &SharedState, args: Value) -> CommandResult {
    let args: OptionalSessionArgs = parse_args(args)?;
    to_data(
        state
            .conductor
            .dispatcher
            .list(args.session_id.as_ref())
            .await?,
    )
}

async fn get_task(state: &SharedState, args: Value) -> CommandResult {
    let args: TaskArgs = parse_args(args)?;
    to_data(state.conductor.dispatcher.get(&args.task_id).await?)
}

// ============================================================================
// ALLOWLIST COMMANDS
// ============================================================================

async fn list_rules(state: &SharedState, args: Value) -> CommandResult {
    let args: OptionalSessionArgs = parse_args(args)?;
    to_data(state.conductor.allowlist.list(args.session_id.as_ref()).await)
}

async fn add_rule(state: &SharedState, args: Value) -> CommandResult {
    let args: AddRuleArgs = parse_args(args)?;
    to_data(state.conductor.allowlist.add(args.into()).await?)
}

async fn remove_rule(state: &SharedState, args: Value) -> CommandResult {
    let args: RuleArgs = parse_args(args)?;
    let removed = state.conductor.allowlist.remove(&args.rule_id).await?;
    to_data(json!({ "removed": removed }))
}

// ============================================================================
// QUEUE AND CHAT COMMANDS
// ============================================================================

async fn enqueue_message(state: &SharedState, args: Value) -> CommandResult {
    let args: EnqueueArgs = parse_args(args)?;
    let message = state
        .conductor
        .enqueue_message(&args.session_id, &args.text, args.source)
        .await?;
    to_data(message)
}

async fn list_queue(state: &SharedState, args: Value) -> CommandResult {
    let args: SessionArgs = parse_args(args)?;
    to_data(state.conductor.queue.list(&args.session_id).await)
}

async fn cancel_message(state: &SharedState, args: Value) -> CommandResult {
    let args: MessageArgs = parse_args(args)?;
    let cancelled = state.conductor.queue.cancel(&args.message_id).await?;
    to_data(json!({ "cancelled": cancelled }))
}

async fn get_chat(state: &SharedState, args: Value) -> CommandResult {
    let args: SessionArgs = parse_args(args)?;
    to_data(state.conductor.chat.history(&args.session_id).await?)
}

// ============================================================================
// NOTIFICATION COMMANDS
// ============================================================================

async fn list_notifications(state: &SharedState, args: Value) -> CommandResult {
    let args: ListNotificationsArgs = parse_args(args)?;
    to_data(state.conductor.notifier.list(args.unread_only).await)
}

async fn mark_notification_read(state: &SharedState, args: Value) -> CommandResult {
    let args: NotificationArgs = parse_args(args)?;
    let updated = state
        .conductor
        .notifier
        .mark_read(&args.notification_id)
        .await?;
    to_data(json!({ "updated": updated }))
}

// ============================================================================
// TESTS
// ============================================================================

//! Remote task execution and the follow-up message queue.

pub mod agent;
mod dispatcher;
mod queue;
mod task;

pub use agent::{
    ActivitySink, AgentActivity, AgentError, AgentInvocation, AgentOutput, AgentRunner, CliAgent,
};
pub use dispatcher::TaskDispatcher;
pub use queue::{MessageQueue, MessageStatus, QueuedMessage};
pub use task::{Task, TaskId, TaskPhase, TaskRequest};

//! The CLI agent collaborator.
//!
//! The dispatcher sees the agent as a black box behind [`AgentRunner`]:
//! prompt in, result or error out, with activity streamed on the side.
//! [`CliAgent`] is the production runner. It launches the agent binary in
//! print mode with stream-json output:
//!
//! ```text
//! claude -p <prompt> --output-format stream-json --verbose [--model m] [<reasoning flag> r]
//! ```
//!
//! and reads one JSON object per stdout line:
//!
//! ```json
//! {"type":"assistant","message":{"content":[{"type":"text","text":"..."}]}}
//! {"type":"result","result":"Done","duration_ms":1200,"num_turns":3,"is_error":false}
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::task::TaskId;
use crate::config::AgentConfig;
use crate::logging::Transcript;
use crate::shell::login_shell_command;

/// Number of trailing stderr lines kept for failure messages.
const STDERR_TAIL: usize = 20;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to start agent: {0}")]
    Spawn(String),

    #[error("Agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent ran but failed; the message is passed through verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub task_id: TaskId,
    pub prompt: String,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentOutput {
    pub result: String,
    pub duration_ms: u64,
    pub num_turns: u32,
    /// The agent finished but reported its own error.
    pub is_error: bool,
}

/// Progress reported while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentActivity {
    Text { text: String },
    ToolUse { name: String, input: Value },
    Stderr { line: String },
}

pub type ActivitySink = mpsc::UnboundedSender<AgentActivity>;

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one prompt to completion.
    ///
    /// Implementations must return promptly once `cancel` fires.
    async fn run(
        &self,
        invocation: AgentInvocation,
        activity: ActivitySink,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError>;
}

pub struct CliAgent {
    config: AgentConfig,
}

impl CliAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            invocation.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = invocation.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        if let (Some(flag), Some(reasoning)) = (
            self.config.reasoning_flag.as_deref(),
            invocation.reasoning.as_deref().filter(|r| !r.is_empty()),
        ) {
            args.push(flag.to_string());
            args.push(reasoning.to_string());
        }

        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.cancel_grace_ms)
    }
}

#[async_trait]
impl AgentRunner for CliAgent {
    async fn run(
        &self,
        invocation: AgentInvocation,
        activity: ActivitySink,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        let args = self.args(&invocation);
        let command = login_shell_command(
            &self.config.binary,
            &args,
            invocation.working_dir.as_deref(),
            self.config.shell_prefix.as_deref(),
        )
        .map_err(AgentError::Spawn)?;

        let mut child = Command::from(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn(e.to_string()))?;

        log::info!(
            "Started agent for task {} (pid {:?})",
            invocation.task_id,
            child.id()
        );
        let transcript = Transcript::open(self.config.log_dir.as_deref(), invocation.task_id.as_str());
        transcript.line("PROMPT", &invocation.prompt);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Spawn("stderr not captured".to_string()))?;

        let stderr_reader = {
            let activity = activity.clone();
            let transcript = transcript.clone();
            tokio::spawn(async move {
                let mut tail = Vec::new();
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Ok(Some(line)) = next_line(&mut reader, &mut buf).await {
                    transcript.line("STDERR", &line);
                    let _ = activity.send(AgentActivity::Stderr { line: line.clone() });
                    tail.push(line);
                    if tail.len() > STDERR_TAIL {
                        tail.remove(0);
                    }
                }
                tail
            })
        };

        let mut parser = StreamParser::default();
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stderr_reader.abort();
                    terminate(&mut child, self.grace()).await;
                    transcript.line("EXIT", "cancelled");
                    return Err(AgentError::Cancelled);
                }
                line = next_line(&mut reader, &mut buf) => match line? {
                    Some(line) => {
                        transcript.line("STDOUT", &line);
                        for item in parser.feed(&line) {
                            let _ = activity.send(item);
                        }
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                stderr_reader.abort();
                terminate(&mut child, self.grace()).await;
                return Err(AgentError::Cancelled);
            }
            status = child.wait() => status?,
        };
        let stderr_tail = stderr_reader.await.unwrap_or_default();
        transcript.line("EXIT", &status.to_string());

        match parser.into_output() {
            Some(output) => Ok(output),
            None if status.success() => Err(AgentError::Failed(
                "agent exited without a result".to_string(),
            )),
            None => Err(AgentError::Failed(format!(
                "agent exited with {}: {}",
                status,
                stderr_tail.join("\n")
            ))),
        }
    }
}

/// The next line without its terminator, with invalid UTF-8 replaced.
/// `None` at end of stream.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// SIGINT, wait up to `grace`, then kill.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we spawned.
        unsafe {
            libc::kill(pid as i32, libc::SIGINT);
        }
        if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill agent process: {}", e);
    }
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Turns stream-json lines into activity and the final output.
#[derive(Debug, Default)]
struct StreamParser {
    output: Option<AgentOutput>,
}

impl StreamParser {
    fn feed(&mut self, line: &str) -> Vec<AgentActivity> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let parsed: StreamLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("Skipping agent output line: {}", e);
                return Vec::new();
            }
        };

        match parsed.kind.as_str() {
            "assistant" => parsed
                .message
                .map(|m| m.content)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.is_empty() => {
                        Some(AgentActivity::Text { text })
                    }
                    ContentBlock::ToolUse { name, input } => {
                        Some(AgentActivity::ToolUse { name, input })
                    }
                    _ => None,
                })
                .collect(),
            "result" => {
                self.output = Some(AgentOutput {
                    result: parsed.result.unwrap_or_default(),
                    duration_ms: parsed.duration_ms.unwrap_or_default(),
                    num_turns: parsed.num_turns.unwrap_or_default(),
                    is_error: parsed.is_error,
                });
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn into_output(self) -> Option<AgentOutput> {
        self.output
    }
}

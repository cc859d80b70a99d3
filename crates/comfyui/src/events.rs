//! Events published by the renderer session and the execution client.
//!
//! [`StreamEvent`]s are the session's interpretation of raw WebSocket
//! messages, fanned out to every job monitor. [`JobEvent`]s describe job
//! lifecycle transitions for external observers.

use serde::Serialize;
use uuid::Uuid;

use crate::history::ArtifactRef;

/// What happened on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEventKind {
    /// The session's WebSocket connected (or reconnected).
    Connected,
    /// The session's WebSocket dropped.
    Disconnected,
    Started,
    Cached { nodes: Vec<String> },
    NodeExecuting { node: String },
    Progress { value: u32, max: u32 },
    Output { node: String, images: Vec<ArtifactRef> },
    /// The prompt finished executing.
    Completed,
    Failed { message: String },
    Interrupted,
}

impl StreamEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEventKind::Completed | StreamEventKind::Failed { .. } | StreamEventKind::Interrupted
        )
    }
}

/// A stream event, scoped to a prompt when the server says which.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub prompt_id: Option<String>,
    #[serde(flatten)]
    pub kind: StreamEventKind,
}

impl StreamEvent {
    pub fn session(kind: StreamEventKind) -> Self {
        Self {
            prompt_id: None,
            kind,
        }
    }

    pub fn for_prompt(prompt_id: impl Into<String>, kind: StreamEventKind) -> Self {
        Self {
            prompt_id: Some(prompt_id.into()),
            kind,
        }
    }
}

/// Lifecycle state of one execution job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Built,
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum JobUpdate {
    State { state: JobState },
    Progress { value: u32, max: u32 },
}

/// A job lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    /// Local correlation id, assigned before the renderer knows the job.
    pub ticket: Uuid,
    /// Renderer-assigned prompt id, once queued.
    pub job_id: Option<String>,
    #[serde(flatten)]
    pub update: JobUpdate,
}

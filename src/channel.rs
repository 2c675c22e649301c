//! Dispatch channel: the persistent, bidirectional link to the agent
//! runtime.
//!
//! Only message shapes are fixed here. [`QueuedChannel`] queues outbound
//! messages on a tokio [`mpsc`] so an embedder can bridge them onto any
//! transport and feed replies back through
//! [`Dispatcher::handle_inbound`](crate::dispatch::Dispatcher::handle_inbound).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TaskError;
use crate::task::{SessionId, Task, TaskId};

/// Pass-through options of a new session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub skip_permissions: bool,
    pub verbose_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_config: Option<Value>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl From<&Task> for SessionOptions {
    fn from(task: &Task) -> Self {
        Self {
            skip_permissions: task.skip_permissions,
            verbose_logs: task.verbose_logs,
            role: task.role.clone(),
            goal_config: task.goal_config.clone(),
            resources: task.resources.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    NewSession {
        task_id: TaskId,
        instruction: String,
        options: SessionOptions,
    },
    ResumeSession {
        task_id: TaskId,
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
    },
}

impl OutboundMessage {
    pub fn task_id(&self) -> &TaskId {
        match self {
            OutboundMessage::NewSession { task_id, .. }
            | OutboundMessage::ResumeSession { task_id, .. } => task_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    SessionCreated {
        task_id: TaskId,
        session_id: SessionId,
    },
    SessionOutput {
        task_id: TaskId,
        #[serde(default)]
        data: Value,
    },
    SessionError {
        task_id: TaskId,
        #[serde(default)]
        error: String,
    },
    SessionComplete {
        task_id: TaskId,
        exit_code: i32,
    },
}

impl InboundMessage {
    pub fn task_id(&self) -> &TaskId {
        match self {
            InboundMessage::SessionCreated { task_id, .. }
            | InboundMessage::SessionOutput { task_id, .. }
            | InboundMessage::SessionError { task_id, .. }
            | InboundMessage::SessionComplete { task_id, .. } => task_id,
        }
    }
}

/// The runtime's answer to an outbound request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelAck {
    /// Accepted. A resume may already name the authoritative session; a new
    /// session reports its id later through `session-created`.
    Accepted { session_id: Option<SessionId> },
    Rejected { reason: String },
}

#[async_trait]
pub trait DispatchChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Deliver a request. Fails with `ChannelUnavailable` when disconnected.
    async fn send(&self, message: OutboundMessage) -> Result<ChannelAck, TaskError>;
}

/// Channel that queues outbound messages for an external transport.
pub struct QueuedChannel {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    connected: AtomicBool,
}

impl QueuedChannel {
    /// Create a connected channel and the receiver its transport drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            tx,
            connected: AtomicBool::new(true),
        };
        (channel, rx)
    }

    /// Reflect the transport's connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl DispatchChannel for QueuedChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    async fn send(&self, message: OutboundMessage) -> Result<ChannelAck, TaskError> {
        if !self.is_connected() {
            return Err(TaskError::ChannelUnavailable);
        }
        self.tx
            .send(message)
            .map_err(|_| TaskError::ChannelUnavailable)?;
        Ok(ChannelAck::Accepted { session_id: None })
    }
}

//! Remote collaborators: the task CRUD API and the transcript API.
//!
//! Components depend on these traits, not on a transport; [`crate::http`]
//! provides the `reqwest` implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::task::{SessionId, Task, TaskDraft, TaskId, TaskStatus};
use crate::transcript::RawEvent;

/// Answer of a task status query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: TaskStatus,
    #[serde(default)]
    pub has_result: bool,
    #[serde(default)]
    pub result_pointer: Option<String>,
}

/// Follow-up instruction for an existing session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequest {
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_settings: Option<Value>,
}

/// Result of continuing a session. `session_id` may differ from the one
/// that was continued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponse {
    pub session_id: SessionId,
    #[serde(default)]
    pub session_changed: bool,
    #[serde(default)]
    pub has_output: bool,
}

#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn list(&self) -> Result<Vec<Task>, ApiError>;

    async fn create(&self, draft: &TaskDraft) -> Result<Task, ApiError>;

    async fn update(&self, id: &TaskId, draft: &TaskDraft) -> Result<Task, ApiError>;

    async fn delete(&self, id: &TaskId) -> Result<(), ApiError>;

    async fn status(&self, id: &TaskId) -> Result<StatusReport, ApiError>;

    /// Store a reconciled session id on the persisted task record.
    async fn persist_session(&self, id: &TaskId, session_id: &SessionId) -> Result<(), ApiError>;
}

#[async_trait]
pub trait TranscriptApi: Send + Sync {
    /// Raw event log of a session. `ApiError::NotFound` means the runtime
    /// has not persisted it yet.
    async fn messages(
        &self,
        container_path: &str,
        session_id: &SessionId,
    ) -> Result<Vec<RawEvent>, ApiError>;

    async fn continue_session(
        &self,
        session_id: &SessionId,
        request: &ContinueRequest,
    ) -> Result<ContinueResponse, ApiError>;
}

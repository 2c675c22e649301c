//! Task records, drafts, and partial updates.
//!
//! A [`Task`] is what the remote CRUD API stores; a [`TaskDraft`] is the
//! user-editable subset sent on create/update; a [`TaskPatch`] is the
//! field-merge unit every in-process mutation goes through.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::TaskError;

// ── Identifiers ──────────────────────────────────────────────────────

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable task identifier assigned by the CRUD API.
    TaskId
);
string_id!(
    /// Runtime-minted conversational session identifier. Not stable across resumes.
    SessionId
);

// ── Enums ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    #[default]
    Immediate,
    Daily,
    Weekly,
}

impl ScheduleFrequency {
    pub fn is_scheduled(self) -> bool {
        self != ScheduleFrequency::Immediate
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Interactive,
    Background,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// `completed` and `failed` end a background run.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn enabled_default() -> bool {
    true
}

// ── Task ─────────────────────────────────────────────────────────────

/// A persisted unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Free-text instruction handed to the runtime after the resource tokens.
    pub goal: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub goal_config: Option<Value>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub schedule_frequency: ScheduleFrequency,
    /// `HH:MM`, present iff the task is scheduled.
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default)]
    pub verbose_logs: bool,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub has_result: bool,
    #[serde(default)]
    pub result_pointer: Option<String>,
}

impl Task {
    /// Enforce record invariants: scheduled tasks always run in the background.
    pub fn normalize(&mut self) {
        if self.schedule_frequency.is_scheduled() {
            self.execution_mode = ExecutionMode::Background;
        }
    }

    pub fn is_background(&self) -> bool {
        self.execution_mode == ExecutionMode::Background
    }

    /// Timestamp used for newest-first display ordering.
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_run.unwrap_or(self.created_at)
    }
}

// ── Draft ────────────────────────────────────────────────────────────

/// The user-editable part of a task, sent on create and update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub name: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_config: Option<Value>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub schedule_frequency: ScheduleFrequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub skip_permissions: bool,
    #[serde(default)]
    pub verbose_logs: bool,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl TaskDraft {
    pub fn new(name: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            goal: goal.into(),
            role: None,
            goal_config: None,
            resources: Vec::new(),
            schedule_frequency: ScheduleFrequency::Immediate,
            schedule_time: None,
            execution_mode: ExecutionMode::Interactive,
            skip_permissions: false,
            verbose_logs: false,
            enabled: true,
        }
    }

    /// Apply the record invariants and tidy free-form input.
    pub fn normalized(mut self) -> Self {
        if self.schedule_frequency.is_scheduled() {
            self.execution_mode = ExecutionMode::Background;
        } else {
            self.schedule_time = None;
        }
        self.resources = self
            .resources
            .into_iter()
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .collect();
        self.name = self.name.trim().to_string();
        self
    }

    /// Reject drafts the runtime could not act on.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.name.trim().is_empty() {
            return Err(TaskError::InvalidDraft("name is required".to_string()));
        }
        if self.goal.trim().is_empty() {
            return Err(TaskError::InvalidDraft("goal is required".to_string()));
        }
        if self.schedule_frequency.is_scheduled() {
            let Some(time) = self.schedule_time.as_deref() else {
                return Err(TaskError::InvalidDraft(
                    "scheduled tasks need a schedule time".to_string(),
                ));
            };
            if NaiveTime::parse_from_str(time.trim(), "%H:%M").is_err() {
                return Err(TaskError::InvalidDraft(format!(
                    "schedule time {time:?} is not HH:MM"
                )));
            }
        }
        Ok(())
    }

    /// Content fingerprint of the form, stable across identical submissions.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(Sha256::digest(&bytes))
    }

    /// Whether saving this draft would change `task` (unsaved-edit check).
    pub fn differs_from(&self, task: &Task) -> bool {
        self.clone().normalized() != TaskDraft::from(task).normalized()
    }
}

impl From<&Task> for TaskDraft {
    fn from(task: &Task) -> Self {
        Self {
            name: task.name.clone(),
            goal: task.goal.clone(),
            role: task.role.clone(),
            goal_config: task.goal_config.clone(),
            resources: task.resources.clone(),
            schedule_frequency: task.schedule_frequency,
            schedule_time: task.schedule_time.clone(),
            execution_mode: task.execution_mode,
            skip_permissions: task.skip_permissions,
            verbose_logs: task.verbose_logs,
            enabled: task.enabled,
        }
    }
}

// ── Patch ────────────────────────────────────────────────────────────

/// Fields to merge into a cached task. `None` leaves a field untouched.
///
/// The session id can only be set from inside the crate; the session
/// tracker is its single writer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: Option<bool>,
    pub has_result: Option<bool>,
    pub result_pointer: Option<Option<String>>,
    pub(crate) session_id: Option<SessionId>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn last_run(at: DateTime<Utc>) -> Self {
        Self {
            last_run: Some(at),
            ..Self::default()
        }
    }

    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub(crate) fn session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(at) = self.last_run {
            task.last_run = Some(at);
        }
        if let Some(enabled) = self.enabled {
            task.enabled = enabled;
        }
        if let Some(has_result) = self.has_result {
            task.has_result = has_result;
        }
        if let Some(pointer) = &self.result_pointer {
            task.result_pointer = pointer.clone();
        }
        if let Some(session_id) = &self.session_id {
            task.session_id = Some(session_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn task_decodes_camel_case_payload_with_defaults() {
        let task: Task = serde_json::from_value(json!({
            "id": "t1",
            "name": "Nightly summary",
            "goal": "Summarize",
            "resources": ["a.txt"],
            "scheduleFrequency": "daily",
            "scheduleTime": "09:30",
            "sessionId": "S1",
            "status": "running",
            "createdAt": "2026-01-02T03:04:05Z"
        }))
        .unwrap();

        assert_eq!(task.id, TaskId::from("t1"));
        assert_eq!(task.session_id, Some(SessionId::from("S1")));
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.enabled);
        assert_eq!(task.execution_mode, ExecutionMode::Interactive);
    }

    #[test]
    fn normalize_forces_scheduled_tasks_into_background() {
        let mut draft = TaskDraft::new("Digest", "Summarize");
        draft.schedule_frequency = ScheduleFrequency::Weekly;
        draft.schedule_time = Some("08:00".to_string());
        let draft = draft.normalized();
        assert_eq!(draft.execution_mode, ExecutionMode::Background);
    }

    #[test]
    fn immediate_drafts_drop_stale_schedule_time() {
        let mut draft = TaskDraft::new("Now", "Do it");
        draft.schedule_time = Some("08:00".to_string());
        draft.resources = vec![" a.txt ".to_string(), "  ".to_string()];
        let draft = draft.normalized();
        assert_eq!(draft.schedule_time, None);
        assert_eq!(draft.resources, vec!["a.txt".to_string()]);
    }

    #[test]
    fn validate_requires_schedule_time_for_scheduled_tasks() {
        let mut draft = TaskDraft::new("Digest", "Summarize");
        draft.schedule_frequency = ScheduleFrequency::Daily;
        assert!(matches!(draft.validate(), Err(TaskError::InvalidDraft(_))));

        draft.schedule_time = Some("25:99".to_string());
        assert!(matches!(draft.validate(), Err(TaskError::InvalidDraft(_))));

        draft.schedule_time = Some("07:15".to_string());
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_goal() {
        let draft = TaskDraft::new("Name", "   ");
        assert!(matches!(draft.validate(), Err(TaskError::InvalidDraft(_))));
    }

    #[test]
    fn fingerprint_tracks_form_content() {
        let a = TaskDraft::new("One", "Goal");
        let b = TaskDraft::new("One", "Goal");
        let c = TaskDraft::new("One", "Other goal");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut task: Task = serde_json::from_value(json!({
            "id": "t1",
            "name": "n",
            "goal": "g",
            "sessionId": "S1",
            "createdAt": "2026-01-02T03:04:05Z"
        }))
        .unwrap();

        TaskPatch::status(TaskStatus::Completed).apply_to(&mut task);

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.session_id, Some(SessionId::from("S1")));
        assert_eq!(task.name, "n");
    }

    #[test]
    fn draft_detects_unsaved_edits() {
        let task: Task = serde_json::from_value(json!({
            "id": "t1",
            "name": "n",
            "goal": "g",
            "createdAt": "2026-01-02T03:04:05Z"
        }))
        .unwrap();

        let mut draft = TaskDraft::from(&task);
        assert!(!draft.differs_from(&task));
        draft.goal = "changed".to_string();
        assert!(draft.differs_from(&task));
    }
}

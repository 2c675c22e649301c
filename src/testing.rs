//! In-memory collaborators and fixtures for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::api::{ContinueRequest, ContinueResponse, StatusReport, TaskApi, TranscriptApi};
use crate::channel::{ChannelAck, DispatchChannel, OutboundMessage};
use crate::error::{ApiError, TaskError};
use crate::task::{
    ExecutionMode, ScheduleFrequency, SessionId, Task, TaskDraft, TaskId, TaskStatus,
};
use crate::transcript::{RawContent, RawEvent, Role};

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn task(id: &str) -> Task {
    Task {
        id: TaskId::from(id),
        name: format!("task {id}"),
        goal: "Summarize".to_string(),
        role: None,
        goal_config: None,
        resources: Vec::new(),
        schedule_frequency: ScheduleFrequency::Immediate,
        schedule_time: None,
        execution_mode: ExecutionMode::Interactive,
        skip_permissions: false,
        verbose_logs: false,
        session_id: None,
        status: TaskStatus::Pending,
        last_run: None,
        created_at: ts(0),
        enabled: true,
        has_result: false,
        result_pointer: None,
    }
}

pub fn task_with_session(id: &str, session: &str) -> Task {
    Task {
        session_id: Some(SessionId::from(session)),
        ..task(id)
    }
}

pub fn background_task(id: &str, status: TaskStatus) -> Task {
    Task {
        execution_mode: ExecutionMode::Background,
        status,
        ..task(id)
    }
}

pub fn assistant_text(secs: i64, text: &str) -> RawEvent {
    RawEvent::new(
        Role::Assistant,
        RawContent::Text(text.to_string()),
        ts(secs),
    )
}

/// A pair of notifies that lets a test hold a fake call open.
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    fn new() -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gate = Self {
            entered: entered.clone(),
            release: release.clone(),
        };
        (gate, entered, release)
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

// ── Task API ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeTaskApi {
    pub tasks: Mutex<Vec<Task>>,
    pub statuses: Mutex<HashMap<TaskId, StatusReport>>,
    pub failing_status: Mutex<HashSet<TaskId>>,
    pub status_calls: Mutex<Vec<TaskId>>,
    pub persisted: Mutex<Vec<(TaskId, SessionId)>>,
    pub updates: Mutex<Vec<(TaskId, TaskDraft)>>,
    create_gate: Mutex<Option<Arc<Gate>>>,
    next_id: AtomicUsize,
}

impl FakeTaskApi {
    pub fn set_status(&self, id: &str, status: TaskStatus, result_pointer: Option<&str>) {
        self.statuses.lock().insert(
            TaskId::from(id),
            StatusReport {
                status,
                has_result: result_pointer.is_some(),
                result_pointer: result_pointer.map(str::to_string),
            },
        );
    }

    pub fn gate_create(&self) -> (Arc<Notify>, Arc<Notify>) {
        let (gate, entered, release) = Gate::new();
        *self.create_gate.lock() = Some(Arc::new(gate));
        (entered, release)
    }
}

fn task_from_draft(id: TaskId, draft: &TaskDraft) -> Task {
    Task {
        id,
        name: draft.name.clone(),
        goal: draft.goal.clone(),
        role: draft.role.clone(),
        goal_config: draft.goal_config.clone(),
        resources: draft.resources.clone(),
        schedule_frequency: draft.schedule_frequency,
        schedule_time: draft.schedule_time.clone(),
        execution_mode: draft.execution_mode,
        skip_permissions: draft.skip_permissions,
        verbose_logs: draft.verbose_logs,
        enabled: draft.enabled,
        ..task("")
    }
}

#[async_trait]
impl TaskApi for FakeTaskApi {
    async fn list(&self) -> Result<Vec<Task>, ApiError> {
        Ok(self.tasks.lock().clone())
    }

    async fn create(&self, draft: &TaskDraft) -> Result<Task, ApiError> {
        let gate = self.create_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = task_from_draft(TaskId::new(format!("task-{n}")), draft);
        self.tasks.lock().push(task.clone());
        Ok(task)
    }

    async fn update(&self, id: &TaskId, draft: &TaskDraft) -> Result<Task, ApiError> {
        self.updates.lock().push((id.clone(), draft.clone()));
        let updated = task_from_draft(id.clone(), draft);
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| &task.id != id);
        tasks.push(updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: &TaskId) -> Result<(), ApiError> {
        self.tasks.lock().retain(|task| &task.id != id);
        Ok(())
    }

    async fn status(&self, id: &TaskId) -> Result<StatusReport, ApiError> {
        self.status_calls.lock().push(id.clone());
        if self.failing_status.lock().contains(id) {
            return Err(ApiError::Transport(anyhow!("status backend unreachable")));
        }
        self.statuses
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    async fn persist_session(&self, id: &TaskId, session_id: &SessionId) -> Result<(), ApiError> {
        self.persisted
            .lock()
            .push((id.clone(), session_id.clone()));
        Ok(())
    }
}

// ── Transcript API ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeTranscriptApi {
    logs: Mutex<HashMap<SessionId, Vec<RawEvent>>>,
    pub fetched: Mutex<Vec<SessionId>>,
    pub continued: Mutex<Vec<(SessionId, ContinueRequest)>>,
    not_found_remaining: AtomicUsize,
    transport_fail: AtomicBool,
    continue_response: Mutex<Option<ContinueResponse>>,
    continue_gate: Mutex<Option<Arc<Gate>>>,
    messages_gate: Mutex<Option<Arc<Gate>>>,
}

impl FakeTranscriptApi {
    pub fn set_log(&self, session: &str, events: Vec<RawEvent>) {
        self.logs.lock().insert(SessionId::from(session), events);
    }

    /// Answer the next `n` fetches with `NotFound`.
    pub fn not_found_times(&self, n: usize) {
        self.not_found_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_transport(&self, fail: bool) {
        self.transport_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_continue_response(&self, response: ContinueResponse) {
        *self.continue_response.lock() = Some(response);
    }

    pub fn gate_continue(&self) -> (Arc<Notify>, Arc<Notify>) {
        let (gate, entered, release) = Gate::new();
        *self.continue_gate.lock() = Some(Arc::new(gate));
        (entered, release)
    }

    /// Hold the next log fetch open; later fetches pass straight through.
    pub fn gate_next_fetch(&self) -> (Arc<Notify>, Arc<Notify>) {
        let (gate, entered, release) = Gate::new();
        *self.messages_gate.lock() = Some(Arc::new(gate));
        (entered, release)
    }
}

#[async_trait]
impl TranscriptApi for FakeTranscriptApi {
    async fn messages(
        &self,
        _container_path: &str,
        session_id: &SessionId,
    ) -> Result<Vec<RawEvent>, ApiError> {
        self.fetched.lock().push(session_id.clone());
        let gate = self.messages_gate.lock().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.transport_fail.load(Ordering::SeqCst) {
            return Err(ApiError::Transport(anyhow!("connection reset")));
        }
        let remaining = self.not_found_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.not_found_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ApiError::NotFound(session_id.to_string()));
        }
        self.logs
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(session_id.to_string()))
    }

    async fn continue_session(
        &self,
        session_id: &SessionId,
        request: &ContinueRequest,
    ) -> Result<ContinueResponse, ApiError> {
        self.continued
            .lock()
            .push((session_id.clone(), request.clone()));
        let gate = self.continue_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let response = self.continue_response.lock().clone();
        Ok(response.unwrap_or_else(|| ContinueResponse {
            session_id: session_id.clone(),
            session_changed: false,
            has_output: true,
        }))
    }
}

// ── Dispatch channel ─────────────────────────────────────────────────

pub struct FakeChannel {
    pub connected: AtomicBool,
    pub sent: Mutex<Vec<OutboundMessage>>,
    ack: Mutex<ChannelAck>,
    send_gate: Mutex<Option<Arc<Gate>>>,
}

impl Default for FakeChannel {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            ack: Mutex::new(ChannelAck::Accepted { session_id: None }),
            send_gate: Mutex::new(None),
        }
    }
}

impl FakeChannel {
    pub fn set_ack(&self, ack: ChannelAck) {
        *self.ack.lock() = ack;
    }

    pub fn gate_send(&self) -> (Arc<Notify>, Arc<Notify>) {
        let (gate, entered, release) = Gate::new();
        *self.send_gate.lock() = Some(Arc::new(gate));
        (entered, release)
    }
}

#[async_trait]
impl DispatchChannel for FakeChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: OutboundMessage) -> Result<ChannelAck, TaskError> {
        if !self.is_connected() {
            return Err(TaskError::ChannelUnavailable);
        }
        let gate = self.send_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.sent.lock().push(message);
        Ok(self.ack.lock().clone())
    }
}

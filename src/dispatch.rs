//! Task dispatch: turning a task into a runtime request and folding the
//! runtime's messages back into the store.
//!
//! Interactive and background tasks differ only in their delivery strategy,
//! which is picked once from the task's execution mode. Everything else
//! (the confirmation gate, the connectivity check, new-vs-resume, session
//! reconciliation) is shared.
//!
//! Events meant for the user (completion notices, streamed output,
//! "refresh the detail view") go out on an [`mpsc`] channel the UI drains.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelAck, DispatchChannel, InboundMessage, OutboundMessage, SessionOptions};
use crate::constants::RESOURCE_MARKER;
use crate::error::TaskError;
use crate::session::{Reconciliation, SessionTracker};
use crate::store::TaskStore;
use crate::task::{ExecutionMode, Task, TaskDraft, TaskId, TaskPatch, TaskStatus};

// ── Public types ─────────────────────────────────────────────────────

/// A message from the task components to the UI.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent {
    /// A background run finished successfully.
    Completed {
        task_id: TaskId,
        task_name: String,
        result_pointer: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A run failed.
    Failed {
        task_id: TaskId,
        task_name: String,
        reason: Option<String>,
        result_pointer: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// The task's detail view should re-read the store.
    DetailChanged { task_id: TaskId },
    /// Streamed output of a live interactive session.
    Output { task_id: TaskId, data: Value },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::DetailChanged { task_id }
            | TaskEvent::Output { task_id, .. } => task_id,
        }
    }
}

/// Whether the user has agreed to enable a disabled task before running it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Confirmation {
    #[default]
    NotConfirmed,
    Confirmed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The task is disabled; ask the user, then dispatch again with
    /// [`Confirmation::Confirmed`]. Nothing was sent.
    DisabledTaskConfirmationRequired(TaskId),
    /// A new session was requested. Its id arrives with `session-created`
    /// unless the runtime acknowledged with it already.
    Started {
        task_id: TaskId,
        mode: ExecutionMode,
        reconciliation: Option<Reconciliation>,
    },
    /// The task's existing session was resumed.
    Resumed {
        task_id: TaskId,
        mode: ExecutionMode,
        reconciliation: Option<Reconciliation>,
    },
}

/// Resource tokens followed by a blank separator and the goal.
///
/// `["a.txt", "b.txt"]` + `"Summarize"` → `"@a.txt @b.txt  Summarize"`.
pub fn build_instruction(resources: &[String], goal: &str) -> String {
    if resources.is_empty() {
        return goal.to_string();
    }
    let tokens: Vec<String> = resources
        .iter()
        .map(|path| format!("{RESOURCE_MARKER}{path}"))
        .collect();
    format!("{}  {}", tokens.join(" "), goal)
}

// ── Delivery strategies ──────────────────────────────────────────────

trait Delivery: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Instruction carried by a resume request.
    fn resume_instruction(&self, instruction: String) -> Option<String>;

    /// Local bookkeeping once the runtime accepted the request.
    fn on_accepted(&self, store: &TaskStore, id: &TaskId, patch: &mut TaskPatch);
}

/// Attaches a live view; a resume re-opens the conversation without
/// replaying the goal.
struct InteractiveDelivery;

impl Delivery for InteractiveDelivery {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Interactive
    }

    fn resume_instruction(&self, _instruction: String) -> Option<String> {
        None
    }

    fn on_accepted(&self, store: &TaskStore, id: &TaskId, _patch: &mut TaskPatch) {
        store.mark_live(id);
    }
}

/// Runs unattended; a resume re-issues the goal and the status poller
/// takes over from here.
struct BackgroundDelivery;

impl Delivery for BackgroundDelivery {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Background
    }

    fn resume_instruction(&self, instruction: String) -> Option<String> {
        Some(instruction)
    }

    fn on_accepted(&self, _store: &TaskStore, _id: &TaskId, patch: &mut TaskPatch) {
        patch.status = Some(TaskStatus::Running);
    }
}

fn delivery_for(task: &Task) -> &'static dyn Delivery {
    match task.execution_mode {
        ExecutionMode::Interactive => &InteractiveDelivery,
        ExecutionMode::Background => &BackgroundDelivery,
    }
}

// ── In-flight guard ──────────────────────────────────────────────────

/// Held while a submission runs; dropping it frees the key.
struct InFlight<'a> {
    keys: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

pub struct Dispatcher {
    store: Arc<TaskStore>,
    tracker: Arc<SessionTracker>,
    channel: Arc<dyn DispatchChannel>,
    events: mpsc::UnboundedSender<TaskEvent>,
    in_flight: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        tracker: Arc<SessionTracker>,
        channel: Arc<dyn DispatchChannel>,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        Self {
            store,
            tracker,
            channel,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn begin(&self, key: String) -> Result<InFlight<'_>, TaskError> {
        if !self.in_flight.lock().insert(key.clone()) {
            debug!(%key, "submission already in flight");
            return Err(TaskError::SubmitInFlight);
        }
        Ok(InFlight {
            keys: &self.in_flight,
            key,
        })
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    /// Create a task from a form. A second identical submission while the
    /// first is pending fails with `SubmitInFlight`.
    pub async fn submit(&self, draft: TaskDraft) -> Result<Task, TaskError> {
        let draft = draft.normalized();
        let _guard = self.begin(format!("create:{}", draft.fingerprint()))?;
        self.store.create(draft).await
    }

    /// Save edits to an existing task, guarded like [`Dispatcher::submit`].
    pub async fn save(&self, id: &TaskId, draft: TaskDraft) -> Result<Task, TaskError> {
        let _guard = self.begin(format!("update:{id}"))?;
        self.store.update(id, draft).await
    }

    /// Run a task: start a new session, or resume the one it already has.
    ///
    /// On `ChannelUnavailable` and `DispatchRejected` the task is left
    /// exactly as it was.
    pub async fn dispatch(
        &self,
        id: &TaskId,
        confirmation: Confirmation,
    ) -> Result<DispatchOutcome, TaskError> {
        let _guard = self.begin(format!("dispatch:{id}"))?;
        let mut task = self
            .store
            .get(id)
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;

        if !task.enabled && confirmation != Confirmation::Confirmed {
            info!(task_id = %id, "disabled task needs confirmation before running");
            return Ok(DispatchOutcome::DisabledTaskConfirmationRequired(id.clone()));
        }
        if !self.channel.is_connected() {
            warn!(task_id = %id, "dispatch channel unavailable");
            return Err(TaskError::ChannelUnavailable);
        }
        if !task.enabled {
            task = self.store.enable(id).await?;
            info!(task_id = %id, "task enabled on confirmation");
        }

        let delivery = delivery_for(&task);
        let instruction = build_instruction(&task.resources, &task.goal);
        let resumed = task.session_id.is_some();
        let message = match &task.session_id {
            Some(session_id) => OutboundMessage::ResumeSession {
                task_id: id.clone(),
                session_id: session_id.clone(),
                instruction: delivery.resume_instruction(instruction),
            },
            None => OutboundMessage::NewSession {
                task_id: id.clone(),
                instruction,
                options: SessionOptions::from(&task),
            },
        };

        let reported = match self.channel.send(message).await? {
            ChannelAck::Rejected { reason } => {
                warn!(task_id = %id, %reason, "runtime rejected dispatch");
                return Err(TaskError::DispatchRejected { reason });
            }
            ChannelAck::Accepted { session_id } => session_id,
        };

        let mut patch = TaskPatch::last_run(Utc::now());
        delivery.on_accepted(&self.store, id, &mut patch);
        self.store.patch(id, &patch);

        let reconciliation = match reported {
            Some(session_id) => Some(self.tracker.reconcile(id, session_id).await?),
            None => None,
        };
        self.emit(TaskEvent::DetailChanged {
            task_id: id.clone(),
        });

        let mode = delivery.mode();
        info!(task_id = %id, ?mode, resumed, "task dispatched");
        Ok(if resumed {
            DispatchOutcome::Resumed {
                task_id: id.clone(),
                mode,
                reconciliation,
            }
        } else {
            DispatchOutcome::Started {
                task_id: id.clone(),
                mode,
                reconciliation,
            }
        })
    }

    /// Fold a runtime message into the store.
    ///
    /// Background status stays with the poller; completion and error
    /// messages for those tasks only prompt a detail refresh.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<(), TaskError> {
        let task_id = message.task_id().clone();
        let Some(task) = self.store.get(&task_id) else {
            debug!(%task_id, "inbound message for unknown task");
            return Ok(());
        };

        match message {
            InboundMessage::SessionCreated { session_id, .. } => {
                self.tracker.reconcile(&task_id, session_id).await?;
                self.emit(TaskEvent::DetailChanged { task_id });
            }
            InboundMessage::SessionOutput { data, .. } => {
                self.emit(TaskEvent::Output { task_id, data });
            }
            InboundMessage::SessionError { error, .. } => {
                warn!(%task_id, %error, "session reported an error");
                if !task.is_background() {
                    self.store.clear_live(&task_id);
                    self.store
                        .patch(&task_id, &TaskPatch::status(TaskStatus::Failed));
                    self.emit(TaskEvent::Failed {
                        task_id: task_id.clone(),
                        task_name: task.name,
                        reason: Some(error),
                        result_pointer: None,
                        timestamp: Utc::now(),
                    });
                }
                self.emit(TaskEvent::DetailChanged { task_id });
            }
            InboundMessage::SessionComplete { exit_code, .. } => {
                debug!(%task_id, exit_code, "session complete");
                if !task.is_background() {
                    self.store.clear_live(&task_id);
                    let status = if exit_code == 0 {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    self.store.patch(&task_id, &TaskPatch::status(status));
                }
                self.emit(TaskEvent::DetailChanged { task_id });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::task::SessionId;
    use crate::testing::{
        FakeChannel, FakeTaskApi, FakeTranscriptApi, background_task, task, task_with_session,
    };

    struct Harness {
        store: Arc<TaskStore>,
        tasks: Arc<FakeTaskApi>,
        channel: Arc<FakeChannel>,
        dispatcher: Arc<Dispatcher>,
        events: mpsc::UnboundedReceiver<TaskEvent>,
    }

    fn harness() -> Harness {
        let tasks = Arc::new(FakeTaskApi::default());
        let store = Arc::new(TaskStore::new(tasks.clone()));
        let tracker = Arc::new(SessionTracker::new(
            store.clone(),
            Arc::new(FakeTranscriptApi::default()),
            "/work",
            RetryPolicy::default(),
        ));
        let channel = Arc::new(FakeChannel::default());
        let (tx, events) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            tracker,
            channel.clone(),
            tx,
        ));
        Harness {
            store,
            tasks,
            channel,
            dispatcher,
            events,
        }
    }

    #[test]
    fn instruction_prefixes_resource_tokens() {
        let resources = vec!["a.txt".to_string(), "b.txt".to_string()];
        assert_eq!(
            build_instruction(&resources, "Summarize"),
            "@a.txt @b.txt  Summarize"
        );
        assert_eq!(build_instruction(&[], "Summarize"), "Summarize");
    }

    #[tokio::test]
    async fn first_dispatch_requests_a_new_session() {
        let h = harness();
        let id = TaskId::from("t1");
        let mut fresh = task("t1");
        fresh.resources = vec!["a.txt".to_string(), "b.txt".to_string()];
        fresh.skip_permissions = true;
        h.store.upsert(fresh);

        let outcome = h
            .dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Started { .. }));
        let sent = h.channel.sent.lock().clone();
        let OutboundMessage::NewSession {
            instruction,
            options,
            ..
        } = &sent[0]
        else {
            panic!("expected new-session, got {sent:?}");
        };
        assert_eq!(instruction, "@a.txt @b.txt  Summarize");
        assert!(options.skip_permissions);
        assert!(h.store.get(&id).unwrap().last_run.is_some());
        assert!(h.store.is_running(&id));
    }

    #[tokio::test]
    async fn session_created_records_the_session() {
        let h = harness();
        let id = TaskId::from("t1");
        h.store.upsert(task("t1"));
        h.dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap();

        h.dispatcher
            .handle_inbound(InboundMessage::SessionCreated {
                task_id: id.clone(),
                session_id: SessionId::from("S1"),
            })
            .await
            .unwrap();

        assert_eq!(
            h.store.get(&id).unwrap().session_id,
            Some(SessionId::from("S1"))
        );
        assert_eq!(
            *h.tasks.persisted.lock(),
            vec![(id, SessionId::from("S1"))]
        );
    }

    #[tokio::test]
    async fn interactive_resume_reconciles_the_acknowledged_session() {
        let h = harness();
        let id = TaskId::from("t1");
        h.store.upsert(task_with_session("t1", "S1"));
        h.channel.set_ack(ChannelAck::Accepted {
            session_id: Some(SessionId::from("S2")),
        });

        let outcome = h
            .dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Resumed { .. }));
        assert_eq!(
            h.channel.sent.lock()[0],
            OutboundMessage::ResumeSession {
                task_id: id.clone(),
                session_id: SessionId::from("S1"),
                instruction: None,
            }
        );
        assert_eq!(
            h.store.get(&id).unwrap().session_id,
            Some(SessionId::from("S2"))
        );
    }

    #[tokio::test]
    async fn background_resume_reissues_the_goal_and_marks_running() {
        let h = harness();
        let id = TaskId::from("bg");
        let mut bg = background_task("bg", TaskStatus::Completed);
        bg.session_id = Some(SessionId::from("S1"));
        h.store.upsert(bg);

        h.dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap();

        let sent = h.channel.sent.lock().clone();
        let OutboundMessage::ResumeSession { instruction, .. } = &sent[0] else {
            panic!("expected resume-session, got {sent:?}");
        };
        assert_eq!(instruction.as_deref(), Some("Summarize"));
        assert_eq!(h.store.get(&id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn disabled_task_requires_confirmation() {
        let h = harness();
        let id = TaskId::from("t1");
        let mut disabled = task("t1");
        disabled.enabled = false;
        h.store.upsert(disabled);

        let outcome = h
            .dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::DisabledTaskConfirmationRequired(id.clone())
        );
        assert!(h.channel.sent.lock().is_empty());

        h.dispatcher
            .dispatch(&id, Confirmation::Confirmed)
            .await
            .unwrap();
        assert!(h.store.get(&id).unwrap().enabled);
        assert_eq!(h.tasks.updates.lock().len(), 1);
        assert_eq!(h.channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn disconnected_channel_leaves_the_task_untouched() {
        let h = harness();
        let id = TaskId::from("t1");
        h.store.upsert(task("t1"));
        h.channel.connected.store(false, Ordering::SeqCst);
        let before = h.store.get(&id).unwrap();

        let err = h
            .dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::ChannelUnavailable));
        assert_eq!(h.store.get(&id).unwrap(), before);
        assert!(h.channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn rejection_leaves_the_task_untouched() {
        let h = harness();
        let id = TaskId::from("bg");
        h.store.upsert(background_task("bg", TaskStatus::Pending));
        h.channel.set_ack(ChannelAck::Rejected {
            reason: "quota exceeded".to_string(),
        });

        let err = h
            .dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::DispatchRejected { reason } if reason == "quota exceeded"));
        let cached = h.store.get(&id).unwrap();
        assert_eq!(cached.status, TaskStatus::Pending);
        assert_eq!(cached.last_run, None);
    }

    #[tokio::test]
    async fn concurrent_dispatch_of_the_same_task_is_refused() {
        let h = harness();
        let id = TaskId::from("t1");
        h.store.upsert(task("t1"));
        let (entered, release) = h.channel.gate_send();

        let first = tokio::spawn({
            let dispatcher = h.dispatcher.clone();
            let id = id.clone();
            async move { dispatcher.dispatch(&id, Confirmation::NotConfirmed).await }
        });
        entered.notified().await;

        let second = h
            .dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await;
        assert!(matches!(second, Err(TaskError::SubmitInFlight)));

        release.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(h.channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_submission_is_refused_while_pending() {
        let h = harness();
        let (entered, release) = h.tasks.gate_create();

        let first = tokio::spawn({
            let dispatcher = h.dispatcher.clone();
            async move { dispatcher.submit(TaskDraft::new("Digest", "Summarize")).await }
        });
        entered.notified().await;

        let second = h
            .dispatcher
            .submit(TaskDraft::new("Digest", "Summarize"))
            .await;
        assert!(matches!(second, Err(TaskError::SubmitInFlight)));

        release.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(h.tasks.tasks.lock().len(), 1);
    }

    #[tokio::test]
    async fn interactive_completion_clears_the_live_view() {
        let mut h = harness();
        let id = TaskId::from("t1");
        h.store.upsert(task("t1"));
        h.dispatcher
            .dispatch(&id, Confirmation::NotConfirmed)
            .await
            .unwrap();
        assert!(h.store.is_running(&id));

        h.dispatcher
            .handle_inbound(InboundMessage::SessionOutput {
                task_id: id.clone(),
                data: json!({"text": "working"}),
            })
            .await
            .unwrap();
        h.dispatcher
            .handle_inbound(InboundMessage::SessionComplete {
                task_id: id.clone(),
                exit_code: 0,
            })
            .await
            .unwrap();

        assert!(!h.store.is_running(&id));
        assert_eq!(h.store.get(&id).unwrap().status, TaskStatus::Completed);

        let mut seen = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&TaskEvent::Output {
            task_id: id.clone(),
            data: json!({"text": "working"}),
        }));
        assert_eq!(seen.last(), Some(&TaskEvent::DetailChanged { task_id: id }));
    }

    #[tokio::test]
    async fn background_completion_is_left_to_the_poller() {
        let h = harness();
        let id = TaskId::from("bg");
        h.store.upsert(background_task("bg", TaskStatus::Running));

        h.dispatcher
            .handle_inbound(InboundMessage::SessionComplete {
                task_id: id.clone(),
                exit_code: 0,
            })
            .await
            .unwrap();

        assert_eq!(h.store.get(&id).unwrap().status, TaskStatus::Running);
    }
}

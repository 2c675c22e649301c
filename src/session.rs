//! Session identity tracking.
//!
//! The runtime mints a new session id whenever a session is resumed, so the
//! id on a task goes stale. [`SessionTracker::reconcile`] is the only writer
//! of `Task::session_id`: it moves the store record to the reported id,
//! persists it, and re-keys any open transcript view so that work bound to
//! the old id is recognised as stale when it comes back.
//!
//! Every fetch reads the session id from the store at call time; nothing
//! here caches an id for later requests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ContinueRequest, ContinueResponse, TranscriptApi};
use crate::config::RetryPolicy;
use crate::error::{ApiError, TaskError};
use crate::store::TaskStore;
use crate::task::{SessionId, TaskId, TaskPatch, TaskStatus};
use crate::transcript::{DisplayMessage, RawEvent, Transcript, TranscriptUpdate, reconstruct};

/// Per-task state of an open transcript view.
#[derive(Default)]
struct ViewState {
    /// Bumped on every reconciliation; in-flight work captured an older value.
    generation: u64,
    transcript: Transcript,
}

/// What a reconciliation did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// The reported id already was the task's session.
    Unchanged,
    Superseded {
        previous: Option<SessionId>,
        current: SessionId,
        /// Whether the remote task record accepted the new id.
        persisted: bool,
        /// Change to the open view's transcript, if a view is open.
        view: Option<TranscriptUpdate>,
    },
}

/// Result of a follow-up sent through the transcript API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FollowUpOutcome {
    Applied {
        response: ContinueResponse,
        reconciliation: Reconciliation,
    },
    /// The session moved on while the request was in flight; the response
    /// was dropped.
    Stale,
}

pub struct SessionTracker {
    store: Arc<TaskStore>,
    transcripts: Arc<dyn TranscriptApi>,
    container_path: String,
    retry: RetryPolicy,
    views: Mutex<HashMap<TaskId, ViewState>>,
}

impl SessionTracker {
    pub fn new(
        store: Arc<TaskStore>,
        transcripts: Arc<dyn TranscriptApi>,
        container_path: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transcripts,
            container_path: container_path.into(),
            retry,
            views: Mutex::new(HashMap::new()),
        }
    }

    // ── Views ────────────────────────────────────────────────────────

    /// Register an open transcript view for `id`. Idempotent.
    pub fn open_view(&self, id: &TaskId) {
        self.views.lock().entry(id.clone()).or_default();
    }

    /// Drop the view of `id`. An interactive task stops counting as running
    /// once nothing shows it.
    pub fn close_view(&self, id: &TaskId) {
        self.views.lock().remove(id);
        self.store.clear_live(id);
    }

    pub fn is_view_open(&self, id: &TaskId) -> bool {
        self.views.lock().contains_key(id)
    }

    /// Messages currently shown by the view of `id`.
    pub fn view_messages(&self, id: &TaskId) -> Option<Vec<DisplayMessage>> {
        self.views
            .lock()
            .get(id)
            .map(|view| view.transcript.messages().to_vec())
    }

    fn view_generation(&self, id: &TaskId) -> Option<u64> {
        self.views.lock().get(id).map(|view| view.generation)
    }

    // ── Fetching ─────────────────────────────────────────────────────

    /// The authoritative session of a task, read from the store.
    pub fn current_session(&self, id: &TaskId) -> Result<SessionId, TaskError> {
        let task = self
            .store
            .get(id)
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;
        task.session_id.ok_or_else(|| TaskError::NoSession(id.clone()))
    }

    /// Fetch a session's raw log, retrying while the runtime has not
    /// persisted it yet.
    ///
    /// An empty log counts as "not yet" until the final attempt, where it is
    /// returned as is.
    pub async fn fetch_events(&self, session_id: &SessionId) -> Result<Vec<RawEvent>, TaskError> {
        let attempts = self.retry.attempts();
        for (attempt, delay) in self.retry.delays().iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }
            let last = attempt + 1 == attempts;
            match self
                .transcripts
                .messages(&self.container_path, session_id)
                .await
            {
                Ok(events) if events.is_empty() && !last => {
                    debug!(%session_id, attempt, "session log empty, retrying");
                }
                Ok(events) => return Ok(events),
                Err(ApiError::NotFound(_)) => {
                    debug!(%session_id, attempt, "session not persisted yet");
                }
                Err(source) => {
                    return Err(TaskError::TranscriptFetchFailed {
                        session_id: session_id.clone(),
                        source,
                    });
                }
            }
        }
        Err(TaskError::SessionNotYetAvailable {
            session_id: session_id.clone(),
            attempts,
        })
    }

    /// Load the transcript of a task's current session.
    ///
    /// With a view open the fetch is applied to it as a delta and the view's
    /// messages are returned; otherwise the log is reconstructed from scratch.
    pub async fn load(&self, id: &TaskId) -> Result<Vec<DisplayMessage>, TaskError> {
        let session_id = self.current_session(id)?;
        match self.view_generation(id) {
            Some(generation) => {
                self.refresh_view(id, &session_id, generation).await?;
                Ok(self.view_messages(id).unwrap_or_default())
            }
            None => {
                let events = self.fetch_events(&session_id).await?;
                Ok(reconstruct(&events))
            }
        }
    }

    async fn refresh_view(
        &self,
        id: &TaskId,
        session_id: &SessionId,
        generation: u64,
    ) -> Result<TranscriptUpdate, TaskError> {
        let events = self.fetch_events(session_id).await?;
        let mut views = self.views.lock();
        let Some(view) = views.get_mut(id) else {
            return Ok(TranscriptUpdate::Unchanged);
        };
        if view.generation != generation {
            debug!(task_id = %id, %session_id, "dropping transcript fetched for a superseded session");
            return Ok(TranscriptUpdate::Unchanged);
        }
        Ok(view.transcript.apply(events))
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Make `reported` the task's session everywhere it is cached.
    ///
    /// The store converges before anything is awaited. A failed remote
    /// persist is logged and reported in the outcome; a failed view refresh
    /// is returned as an error after the store has already moved.
    pub async fn reconcile(
        &self,
        id: &TaskId,
        reported: SessionId,
    ) -> Result<Reconciliation, TaskError> {
        let task = self
            .store
            .get(id)
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;
        if task.session_id.as_ref() == Some(&reported) {
            return Ok(Reconciliation::Unchanged);
        }

        let previous = task.session_id;
        self.store
            .set_session_id(id, reported.clone())
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;
        let generation = self.views.lock().get_mut(id).map(|view| {
            view.generation += 1;
            view.generation
        });
        info!(
            task_id = %id,
            previous = ?previous.as_ref().map(SessionId::as_str),
            current = %reported,
            "session superseded"
        );

        let persisted = match self.store.api().persist_session(id, &reported).await {
            Ok(()) => true,
            Err(error) => {
                warn!(task_id = %id, %error, "failed to persist reconciled session id");
                false
            }
        };

        let view = match generation {
            Some(generation) => Some(self.refresh_view(id, &reported, generation).await?),
            None => None,
        };

        Ok(Reconciliation::Superseded {
            previous,
            current: reported,
            persisted,
            view,
        })
    }

    // ── Follow-ups ───────────────────────────────────────────────────

    /// Send a follow-up instruction on the task's current session.
    ///
    /// The response is applied only if the session is still the one the
    /// request was bound to; its session id is then authoritative.
    pub async fn follow_up(
        &self,
        id: &TaskId,
        goal: &str,
        notification_settings: Option<Value>,
    ) -> Result<FollowUpOutcome, TaskError> {
        let session_id = self.current_session(id)?;
        let generation = self.view_generation(id);
        let request = ContinueRequest {
            goal: goal.to_string(),
            notification_settings,
        };

        let response = self
            .transcripts
            .continue_session(&session_id, &request)
            .await?;

        let still_current = self
            .store
            .get(id)
            .and_then(|task| task.session_id)
            .is_some_and(|current| current == session_id);
        if !still_current || self.view_generation(id) != generation {
            debug!(task_id = %id, %session_id, "dropping stale follow-up response");
            return Ok(FollowUpOutcome::Stale);
        }

        let mut patch = TaskPatch::last_run(chrono::Utc::now());
        if self.store.get(id).is_some_and(|task| task.is_background()) {
            patch.status = Some(TaskStatus::Running);
        }
        self.store.patch(id, &patch);

        let reconciliation = self.reconcile(id, response.session_id.clone()).await?;
        Ok(FollowUpOutcome::Applied {
            response,
            reconciliation,
        })
    }
}

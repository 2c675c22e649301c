//! Task store: the single in-memory owner of task state.
//!
//! Views and components read snapshots synchronously; every mutation goes
//! through [`TaskStore::upsert`] or [`TaskStore::patch`], which merge into
//! the cached record instead of replacing it. The lock is never held across
//! an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::api::TaskApi;
use crate::error::{ApiError, TaskError};
use crate::task::{ExecutionMode, SessionId, Task, TaskDraft, TaskId, TaskPatch, TaskStatus};

pub struct TaskStore {
    api: Arc<dyn TaskApi>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// Interactive tasks with a live view attached.
    live: RwLock<HashSet<TaskId>>,
}

impl TaskStore {
    pub fn new(api: Arc<dyn TaskApi>) -> Self {
        Self {
            api,
            tasks: RwLock::new(HashMap::new()),
            live: RwLock::new(HashSet::new()),
        }
    }

    /// The CRUD collaborator backing this store.
    pub fn api(&self) -> &Arc<dyn TaskApi> {
        &self.api
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// All cached tasks, newest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| b.recency().cmp(&a.recency()).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Background tasks the remote side reports as running.
    pub fn running_background(&self) -> Vec<Task> {
        self.tasks
            .read()
            .values()
            .filter(|task| task.is_background() && task.status == TaskStatus::Running)
            .cloned()
            .collect()
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Insert or merge a task record.
    ///
    /// A record coming from the remote side never rolls back a session id
    /// already reconciled locally; only the session tracker moves it.
    pub fn upsert(&self, mut task: Task) -> Task {
        task.normalize();
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.get(&task.id) {
            if existing.session_id.is_some() {
                task.session_id = existing.session_id.clone();
            }
        }
        tasks.insert(task.id.clone(), task.clone());
        task
    }

    /// Merge `patch` into the cached task. `None` if it is gone.
    pub fn patch(&self, id: &TaskId, patch: &TaskPatch) -> Option<Task> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id)?;
        patch.apply_to(task);
        task.normalize();
        Some(task.clone())
    }

    pub fn remove(&self, id: &TaskId) -> Option<Task> {
        self.live.write().remove(id);
        self.tasks.write().remove(id)
    }

    pub(crate) fn set_session_id(&self, id: &TaskId, session_id: SessionId) -> Option<Task> {
        self.patch(id, &TaskPatch::session(session_id))
    }

    // ── Liveness ─────────────────────────────────────────────────────

    pub fn mark_live(&self, id: &TaskId) {
        self.live.write().insert(id.clone());
    }

    pub fn clear_live(&self, id: &TaskId) {
        self.live.write().remove(id);
    }

    pub fn is_live(&self, id: &TaskId) -> bool {
        self.live.read().contains(id)
    }

    /// Interactive tasks run while a live view is attached; background tasks
    /// while their status says so.
    pub fn is_running(&self, id: &TaskId) -> bool {
        match self.get(id) {
            Some(task) => match task.execution_mode {
                ExecutionMode::Interactive => self.is_live(id),
                ExecutionMode::Background => task.status == TaskStatus::Running,
            },
            None => false,
        }
    }

    // ── Remote round-trips ───────────────────────────────────────────

    /// Re-list from the CRUD API, merging records and dropping tasks that no
    /// longer exist remotely. Returns the number of tasks cached.
    pub async fn refresh(&self) -> Result<usize, TaskError> {
        let fetched = self.api.list().await?;
        let keep: HashSet<TaskId> = fetched.iter().map(|task| task.id.clone()).collect();
        {
            let mut tasks = self.tasks.write();
            tasks.retain(|id, _| keep.contains(id));
        }
        self.live.write().retain(|id| keep.contains(id));
        for task in fetched {
            self.upsert(task);
        }
        let count = self.len();
        debug!(count, "task store refreshed");
        Ok(count)
    }

    pub async fn create(&self, draft: TaskDraft) -> Result<Task, TaskError> {
        let draft = draft.normalized();
        draft.validate()?;
        let task = self.api.create(&draft).await?;
        info!(task_id = %task.id, name = %task.name, "task created");
        Ok(self.upsert(task))
    }

    pub async fn update(&self, id: &TaskId, draft: TaskDraft) -> Result<Task, TaskError> {
        let draft = draft.normalized();
        draft.validate()?;
        let task = match self.api.update(id, &draft).await {
            Ok(task) => task,
            Err(ApiError::NotFound(_)) => return Err(TaskError::NotFound(id.clone())),
            Err(err) => return Err(err.into()),
        };
        Ok(self.upsert(task))
    }

    pub async fn delete(&self, id: &TaskId) -> Result<(), TaskError> {
        match self.api.delete(id).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.remove(id);
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Enable a disabled task remotely, then locally.
    pub(crate) async fn enable(&self, id: &TaskId) -> Result<Task, TaskError> {
        let task = self.get(id).ok_or_else(|| TaskError::NotFound(id.clone()))?;
        let mut draft = TaskDraft::from(&task);
        draft.enabled = true;
        self.update(id, draft).await
    }
}

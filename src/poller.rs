//! Background status poller.
//!
//! Background tasks run without a live view, so their progress is learned
//! by asking the CRUD API for each task the store believes is `running`.
//! A transition into a terminal state produces exactly one user
//! notification per `(task, status)` pair, however often it is observed,
//! until the remote side reports the task running again. Remote reports
//! never move a task from `running` back to `pending`.
//!
//! [`StatusPoller::spawn`] runs [`StatusPoller::tick`] on a fixed interval
//! in a tokio task; [`PollerHandle::wake`] forces an early tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::StatusReport;
use crate::dispatch::TaskEvent;
use crate::store::TaskStore;
use crate::task::{Task, TaskId, TaskPatch, TaskStatus};

/// What one polling pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub polled: usize,
    pub transitions: usize,
    pub notified: usize,
    pub errors: usize,
}

pub struct StatusPoller {
    store: Arc<TaskStore>,
    events: mpsc::UnboundedSender<TaskEvent>,
    notified: Mutex<HashSet<(TaskId, TaskStatus)>>,
}

impl StatusPoller {
    pub fn new(store: Arc<TaskStore>, events: mpsc::UnboundedSender<TaskEvent>) -> Self {
        Self {
            store,
            events,
            notified: Mutex::new(HashSet::new()),
        }
    }

    /// Poll every running background task once.
    ///
    /// Failures are logged and skipped; the task is retried next tick.
    pub async fn tick(&self) -> TickReport {
        self.prune();
        let tracked = self.store.running_background();
        let mut report = TickReport::default();
        if tracked.is_empty() {
            return report;
        }

        for task in tracked {
            report.polled += 1;
            match self.store.api().status(&task.id).await {
                Ok(status) => {
                    if let Some(notified) = self.apply(&task.id, status) {
                        report.transitions += 1;
                        if notified {
                            report.notified += 1;
                        }
                    }
                }
                Err(error) => {
                    report.errors += 1;
                    warn!(task_id = %task.id, %error, "status query failed");
                }
            }
        }
        report
    }

    /// Forget notified pairs of tasks that left the store.
    fn prune(&self) {
        self.notified
            .lock()
            .retain(|(id, _)| self.store.contains(id));
    }

    /// Merge a status report. `None` when nothing changed or the task is
    /// gone; otherwise whether a notification went out.
    fn apply(&self, id: &TaskId, report: StatusReport) -> Option<bool> {
        // Compare with the live record, not the snapshot the tick started from.
        let current = self.store.get(id)?;

        // Only a run the remote side reports makes the task notifiable again.
        if report.status == TaskStatus::Running {
            self.notified.lock().retain(|(notified, _)| notified != id);
        }
        if current.status == TaskStatus::Running && report.status == TaskStatus::Pending {
            debug!(task_id = %id, "remote run not started yet; still tracking");
            return None;
        }
        if current.status == report.status
            && current.has_result == report.has_result
            && current.result_pointer == report.result_pointer
        {
            return None;
        }

        let patch = TaskPatch {
            status: Some(report.status),
            has_result: Some(report.has_result),
            result_pointer: Some(report.result_pointer),
            ..TaskPatch::default()
        };
        let updated = self.store.patch(id, &patch)?;
        if current.status != updated.status {
            info!(
                task_id = %id,
                from = %current.status,
                to = %updated.status,
                "background task status changed"
            );
        }

        let notified = updated.status.is_terminal()
            && self.notified.lock().insert((id.clone(), updated.status));
        if notified {
            let _ = self.events.send(completion_event(&updated));
        } else if updated.status.is_terminal() {
            debug!(task_id = %id, status = %updated.status, "terminal status already notified");
        }
        let _ = self.events.send(TaskEvent::DetailChanged {
            task_id: id.clone(),
        });
        Some(notified)
    }

    /// Run [`tick`](Self::tick) every `interval` until stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> PollerHandle {
        let wake = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());
        let wake_clone = wake.clone();
        let stop_clone = stop.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_clone.notified() => break,
                    _ = ticker.tick() => {}
                    _ = wake_clone.notified() => {}
                }
                let report = self.tick().await;
                if report.polled > 0 {
                    debug!(?report, "status poll finished");
                }
            }
            debug!("status poller stopped");
        });

        PollerHandle { wake, stop, join }
    }
}

fn completion_event(task: &Task) -> TaskEvent {
    match task.status {
        TaskStatus::Failed => TaskEvent::Failed {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            reason: None,
            result_pointer: task.result_pointer.clone(),
            timestamp: Utc::now(),
        },
        _ => TaskEvent::Completed {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            result_pointer: task.result_pointer.clone(),
            timestamp: Utc::now(),
        },
    }
}

/// Control of a spawned poller.
pub struct PollerHandle {
    wake: Arc<Notify>,
    stop: Arc<Notify>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Poll now instead of waiting for the next interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop after the current tick and wait for the loop to exit.
    pub async fn stop(mut self) {
        self.stop.notify_one();
        let _ = (&mut self.join).await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

//! Error taxonomy surfaced by the task components.
//!
//! Collaborator failures are [`ApiError`]; everything a caller of the
//! dispatcher, tracker, store or poller sees is a [`TaskError`]. Stale
//! responses are not errors and never show up here.

use thiserror::Error;

use crate::task::{SessionId, TaskId};

/// Failure of a remote collaborator call (task CRUD or transcript API).
#[derive(Debug, Error)]
pub enum ApiError {
    /// The addressed resource does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote side answered with a non-success status.
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Network, encoding, or decoding failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Typed failures of task lifecycle operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The dispatch channel is not connected; the task was left unmodified.
    #[error("dispatch channel is not connected")]
    ChannelUnavailable,

    /// The runtime refused the request; the task was left unmodified.
    #[error("runtime rejected the request: {reason}")]
    DispatchRejected { reason: String },

    /// The session's transcript was still not queryable after every retry.
    #[error("session {session_id} is not available yet after {attempts} attempt(s)")]
    SessionNotYetAvailable { session_id: SessionId, attempts: usize },

    /// The transcript query failed for a reason other than "not yet available".
    #[error("transcript fetch failed for session {session_id}: {source}")]
    TranscriptFetchFailed {
        session_id: SessionId,
        #[source]
        source: ApiError,
    },

    /// No task with this id is present in the store.
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The task has never been dispatched, so there is no session to address.
    #[error("task {0} has no session")]
    NoSession(TaskId),

    /// An identical submission is still in flight.
    #[error("a submission for this task is already in flight")]
    SubmitInFlight,

    /// The draft failed validation.
    #[error("invalid task: {0}")]
    InvalidDraft(String),

    /// Remote CRUD call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

//! taskrelay: task lifecycle, session identity, and transcript
//! reconstruction for an external AI-agent runtime.
//!
//! A UI layer owns one [`TaskStore`] and hands `Arc`s of it to the other
//! components; none of them keep private copies of task state.
//!
//! | Module       | Responsibility                                        |
//! |--------------|-------------------------------------------------------|
//! | `task`       | `Task`, `TaskDraft`, `TaskPatch`, enums & invariants  |
//! | `store`      | In-memory task cache with field-merge mutation        |
//! | `dispatch`   | Instruction building, new/resume delivery, inbound    |
//! | `session`    | Session-id reconciliation, transcript views, retries  |
//! | `transcript` | Pure raw-event log → display message reconstruction   |
//! | `poller`     | Background status polling & completion notifications |
//! | `api`        | Collaborator traits (CRUD, transcript) + DTOs         |
//! | `http`       | `reqwest` implementation of the collaborator traits   |
//! | `channel`    | Dispatch channel messages and queued channel          |
//! | `config`     | Layered configuration loading                         |
//! | `error`      | Typed error taxonomy                                  |
//! | `logging`    | `tracing` subscriber setup for binaries               |

pub mod api;
pub mod channel;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod logging;
pub mod poller;
pub mod session;
pub mod store;
pub mod task;
pub mod transcript;
mod util;

#[cfg(test)]
mod testing;

pub use api::{ContinueRequest, ContinueResponse, StatusReport, TaskApi, TranscriptApi};
pub use channel::{ChannelAck, DispatchChannel, InboundMessage, OutboundMessage, QueuedChannel};
pub use config::{ConfigSource, RelayConfig, RetryPolicy};
pub use dispatch::{Confirmation, DispatchOutcome, Dispatcher, TaskEvent, build_instruction};
pub use error::{ApiError, TaskError};
pub use http::HttpApi;
pub use poller::{PollerHandle, StatusPoller, TickReport};
pub use session::{FollowUpOutcome, Reconciliation, SessionTracker};
pub use store::TaskStore;
pub use task::{
    ExecutionMode, ScheduleFrequency, SessionId, Task, TaskDraft, TaskId, TaskPatch, TaskStatus,
};
pub use transcript::{
    ContentPart, DisplayMessage, MessageKind, RawContent, RawEvent, Role, Transcript,
    TranscriptUpdate, reconstruct, reconstruct_from,
};

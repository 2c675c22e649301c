//! Compile-time constants and tunables shared across the crate.

/// Application name used for config directories and log filters.
pub const APP_NAME: &str = "taskrelay";
/// Application version injected from `Cargo.toml` at compile time.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file looked up in the working directory and the platform config dir.
pub const CONFIG_FILE_NAME: &str = "taskrelay.json";

/// Default base URL of the task/transcript HTTP API.
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3001/api";
/// Default container path handed to the transcript API.
pub const DEFAULT_CONTAINER_PATH: &str = ".";

// ── Dispatch ─────────────────────────────────────────────────────────

/// Prefix of a resource reference token in a built instruction.
pub const RESOURCE_MARKER: char = '@';

// ── Session / transcript ─────────────────────────────────────────────

/// Delays (ms) before each transcript fetch attempt for a fresh session.
pub const DEFAULT_SESSION_RETRY_DELAYS_MS: [u64; 3] = [0, 1000, 2000];

/// Prefixes of user turns generated by the runtime rather than typed by a human.
pub const COMMAND_MARKERS: &[&str] = &[
    "<command-name>",
    "<command-message>",
    "<command-args>",
    "<local-command-stdout>",
    "<local-command-stderr>",
];

// ── Polling ──────────────────────────────────────────────────────────

/// Default background status poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

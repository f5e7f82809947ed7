//! Error kinds for the plugin host.
//!
//! Errors are carried as tagged values and returned to callers; nothing is
//! thrown across the host/worker boundary. Failures that cross the sandbox
//! channel are flattened to strings first and re-tagged on arrival.

use thiserror::Error;

/// Why a plugin failed to activate.
///
/// Cloneable because concurrent callers of `ensure_activated` share one
/// memoised activation future.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActivationError {
    #[error("Plugin \"{0}\" is not installed")]
    NotInstalled(String),

    #[error("Plugin \"{0}\" is disabled")]
    Disabled(String),

    #[error("Activation event \"{event}\" is not declared by plugin \"{plugin_id}\"")]
    EventNotDeclared { plugin_id: String, event: String },

    #[error("Plugin \"{0}\" has no entry source")]
    EntrySourceMissing(String),

    #[error("Plugin \"{plugin_id}\" crashed during activation: {message}")]
    Crashed { plugin_id: String, message: String },

    #[error("Plugin \"{plugin_id}\" did not become ready within {timeout_ms} ms")]
    ReadyTimeout { plugin_id: String, timeout_ms: u64 },

    /// The plugin already failed this session; only a reload clears this.
    #[error("Plugin \"{0}\" previously failed; reload to retry")]
    PreviouslyFailed(String),
}

/// Call-scoped failure of a single sandbox invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Invocation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The session crashed while the request was pending.
    #[error("Session crashed: {0}")]
    Crashed(String),

    /// The worker reported a handler failure or an unknown target id.
    #[error("{0}")]
    Handler(String),

    #[error("No running session for plugin \"{0}\"")]
    SessionGone(String),
}

/// Top-level error surfaced by dispatchers to the editor shell.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Invocation(#[from] InvokeError),

    #[error("Unknown contribution \"{0}\"")]
    UnknownContribution(String),

    /// An OS-shell or editor-shell call failed.
    #[error("{0}")]
    Shell(String),
}

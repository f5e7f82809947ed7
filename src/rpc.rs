//! The host↔worker message protocol.
//!
//! Both directions carry JSON objects with a `type` discriminant. The enums
//! here are the closed lists; `parse_host_message` / `parse_worker_message`
//! type-narrow raw values and reject anything off-list. A rejected worker
//! message is a session crash, a rejected host message makes the worker
//! report an error and exit.

use crate::manifest::PluginManifest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default timeout for one sandbox invocation.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(8);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide monotonic request id with a caller-supplied
/// prefix, e.g. `host-17` or `worker-18`.
pub fn next_request_id(prefix: &str) -> String {
    let n = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{n}")
}

// ---------------------------------------------------------------------------
// Host → worker
// ---------------------------------------------------------------------------

/// What a host `invoke` targets inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeMethod {
    Command,
    Transform,
    Exporter,
    Importer,
    Status,
    InlineAnnotations,
    UiControl,
    UiPanelAction,
    UiEvaluate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    #[serde(rename_all = "camelCase")]
    Init {
        plugin_id: String,
        manifest: PluginManifest,
        entry_source: String,
    },
    #[serde(rename_all = "camelCase")]
    Invoke {
        request_id: String,
        method: InvokeMethod,
        target: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Worker → host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Ready,
    Error {
        message: String,
    },
    RegisterCommand {
        descriptor: Value,
    },
    RegisterTransform {
        descriptor: Value,
    },
    RegisterExporter {
        descriptor: Value,
    },
    RegisterImporter {
        descriptor: Value,
    },
    RegisterStatusBadge {
        descriptor: Value,
    },
    RegisterInlineAnnotations {
        descriptor: Value,
    },
    RegisterUiControl {
        descriptor: Value,
    },
    RegisterUiPanel {
        descriptor: Value,
    },
    RegisterElementLoop {
        descriptor: Value,
    },
    #[serde(rename_all = "camelCase")]
    HostRequest {
        request_id: String,
        operation: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: String,
        permission: String,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Type-narrowing parsers
// ---------------------------------------------------------------------------

pub fn parse_host_message(raw: &Value) -> Result<HostMessage, String> {
    serde_json::from_value(raw.clone()).map_err(|e| format!("Undecodable host message: {e}"))
}

pub fn parse_worker_message(raw: &Value) -> Result<WorkerMessage, String> {
    serde_json::from_value(raw.clone()).map_err(|e| format!("Undecodable worker message: {e}"))
}

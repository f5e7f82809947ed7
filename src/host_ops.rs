//! The plugin host adapter.
//!
//! Implements the host side of every `host-request` a worker can issue.
//! Permission checks are centralised here: each operation names the exact
//! capability it requires, and a denied check produces an `ok=false`
//! response with no observable side effect. Operations the core does not
//! implement itself are forwarded to the OS shell as an opaque native
//! passthrough, after an operation-name-specific permission check, an
//! allowlist check for network targets, and a per-plugin rate limit.

use crate::lifecycle::HostShared;
use crate::manifest::InstalledPlugin;
use crate::permissions::Permission;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window for the native-passthrough rate limit.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

fn require(plugin: &InstalledPlugin, perm: Permission) -> Result<(), String> {
    if plugin.holds(perm) {
        Ok(())
    } else {
        Err(format!("Permission denied: {perm}"))
    }
}

/// `document:set-plugin-data` accepts either the raw value or `{value}`.
fn unwrap_value_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("value") => {
            obj.remove("value").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Map a native operation name to the capability it requires. Unknown
/// prefixes are rejected before the shell ever sees them.
fn required_permission_for(operation: &str) -> Option<Permission> {
    if operation.starts_with("fs:pick-read") {
        Some(Permission::FsPickRead)
    } else if operation.starts_with("fs:pick-write") {
        Some(Permission::FsPickWrite)
    } else if operation.starts_with("network:https") {
        Some(Permission::NetworkHttps)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// URL allowlist
// ---------------------------------------------------------------------------

/// Check if a URL matches a pattern: a URL prefix, optionally ending with
/// `*` for a wildcard suffix.
fn url_matches_pattern(url: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        url.starts_with(prefix)
    } else {
        url == pattern
    }
}

/// Validate a network target: HTTPS only, and it must match one of the
/// manifest's declared URL patterns. No declared patterns means no access.
fn validate_https_url(raw: &str, allowed_urls: &[String]) -> Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("Invalid URL: {e}"))?;
    if parsed.scheme() != "https" {
        return Err(format!(
            "Scheme \"{}\" is not allowed; use https",
            parsed.scheme()
        ));
    }
    if allowed_urls.iter().any(|p| url_matches_pattern(raw, p)) {
        Ok(())
    } else {
        Err(format!(
            "URL \"{raw}\" does not match any allowed URL pattern"
        ))
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Check and record one native call for the given plugin. Rejects when the
/// per-minute budget is exhausted.
fn check_rate_limit(shared: &HostShared, plugin_id: &str) -> Result<(), String> {
    let limit = shared.config.host_call_rate_limit;
    let entry = shared
        .host_call_windows
        .entry(plugin_id.to_string())
        .or_insert_with(|| parking_lot::Mutex::new(VecDeque::new()));
    let mut timestamps = entry.lock();
    let now = Instant::now();

    while timestamps
        .front()
        .is_some_and(|t| now.duration_since(*t) > RATE_LIMIT_WINDOW)
    {
        timestamps.pop_front();
    }

    if timestamps.len() >= limit {
        return Err(format!(
            "Plugin \"{plugin_id}\" exceeded the host-call rate limit ({limit} calls/minute)"
        ));
    }

    timestamps.push_back(now);
    Ok(())
}

// ---------------------------------------------------------------------------
// Host requests
// ---------------------------------------------------------------------------

pub(crate) async fn handle_host_request(
    shared: &HostShared,
    plugin_id: &str,
    operation: &str,
    payload: Value,
) -> Result<Value, String> {
    let Some(plugin) = shared.installed_plugin(plugin_id) else {
        return Err(format!("Unknown plugin: \"{plugin_id}\""));
    };

    match operation {
        "document:get" => {
            require(&plugin, Permission::DocumentRead)?;
            Ok(shared.editor.get_document())
        }
        "document:replace" => {
            require(&plugin, Permission::DocumentWrite)?;
            if !crate::document::is_document_tree(&payload) {
                return Err("document:replace requires a document tree".into());
            }
            shared.editor.replace_document(payload)?;
            Ok(Value::Null)
        }
        "document:get-plugin-data" => {
            require(&plugin, Permission::DocumentRead)?;
            Ok(shared
                .editor
                .get_plugin_data(plugin_id)
                .unwrap_or(Value::Null))
        }
        "document:set-plugin-data" => {
            require(&plugin, Permission::DocumentWrite)?;
            let value = unwrap_value_envelope(payload);
            let encoded = serde_json::to_vec(&value)
                .map_err(|e| format!("Plugin data is not serializable: {e}"))?;
            let cap = shared.config.plugin_data_cap_bytes;
            if encoded.len() > cap {
                return Err(format!(
                    "Plugin data exceeds maximum size ({} bytes > {cap} bytes)",
                    encoded.len()
                ));
            }
            shared.editor.set_plugin_data(plugin_id, Some(value))?;
            Ok(Value::Null)
        }
        operation => {
            let Some(required) = required_permission_for(operation) else {
                return Err(format!("Unknown host operation: \"{operation}\""));
            };
            require(&plugin, required)?;
            if required == Permission::NetworkHttps {
                let url = payload
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or("network:https operations require a \"url\"")?;
                validate_https_url(url, &plugin.manifest.allowed_urls)?;
            }
            check_rate_limit(shared, plugin_id)?;
            shared
                .shell
                .plugin_host_call(plugin_id, operation, payload)
                .await
        }
    }
}

// ---------------------------------------------------------------------------
// Permission prompts
// ---------------------------------------------------------------------------

/// Resolve a worker `permission-request`: already-held permissions are
/// confirmed without a prompt; undeclared ones are denied without a prompt;
/// otherwise the user decides, the grant is persisted through the shell,
/// and the in-memory record is updated so subsequent checks see it.
pub(crate) async fn handle_permission_request(
    shared: &HostShared,
    plugin_id: &str,
    permission: &str,
) -> bool {
    let Some(perm) = Permission::parse(permission) else {
        return false;
    };
    let Some(plugin) = shared.installed_plugin(plugin_id) else {
        return false;
    };
    if plugin.holds(perm) {
        return true;
    }
    if !plugin.manifest.optional_permissions.contains(&perm) {
        return false;
    }

    if !shared.shell.prompt_permission(plugin_id, perm).await {
        return false;
    }

    let mut grants = plugin.granted_permissions.clone();
    if !grants.contains(&perm) {
        grants.push(perm);
    }
    match shared
        .shell
        .plugin_update_permissions(plugin_id, &grants)
        .await
    {
        Ok(updated) => {
            shared.set_granted_permissions(plugin_id, updated.granted_permissions);
            shared.registry.notify();
            true
        }
        Err(e) => {
            tracing::warn!(plugin = plugin_id, "Failed to persist permission grant: {e}");
            false
        }
    }
}

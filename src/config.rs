//! Host configuration.
//!
//! All knobs default to the protocol's bounds; the editor shell may
//! override them at construction (tests shorten the timeouts).

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Per-invocation timeout for sandbox calls.
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,

    /// How long activation waits for the worker's `ready` message.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Crashes before the plugin is auto-disabled via the OS shell.
    #[serde(default = "default_crash_disable_threshold")]
    pub crash_disable_threshold: u32,

    /// Serialized size cap for the per-plugin blob (256 KiB).
    #[serde(default = "default_plugin_data_cap_bytes")]
    pub plugin_data_cap_bytes: usize,

    /// Items kept per inline-annotation provider per evaluation.
    #[serde(default = "default_annotation_cap")]
    pub annotation_cap: usize,

    /// Native host calls allowed per plugin per minute.
    #[serde(default = "default_host_call_rate_limit")]
    pub host_call_rate_limit: usize,

    /// Operation budget for a plugin script before it is terminated.
    #[serde(default = "default_max_script_operations")]
    pub max_script_operations: u64,
}

fn default_invoke_timeout_ms() -> u64 {
    8_000
}

fn default_ready_timeout_ms() -> u64 {
    8_000
}

fn default_crash_disable_threshold() -> u32 {
    3
}

fn default_plugin_data_cap_bytes() -> usize {
    256 * 1024
}

fn default_annotation_cap() -> usize {
    500
}

fn default_host_call_rate_limit() -> usize {
    120
}

fn default_max_script_operations() -> u64 {
    5_000_000
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: default_invoke_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            crash_disable_threshold: default_crash_disable_threshold(),
            plugin_data_cap_bytes: default_plugin_data_cap_bytes(),
            annotation_cap: default_annotation_cap(),
            host_call_rate_limit: default_host_call_rate_limit(),
            max_script_operations: default_max_script_operations(),
        }
    }
}

impl HostConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_bounds() {
        let config = HostConfig::default();
        assert_eq!(config.invoke_timeout_ms, 8_000);
        assert_eq!(config.ready_timeout_ms, 8_000);
        assert_eq!(config.crash_disable_threshold, 3);
        assert_eq!(config.plugin_data_cap_bytes, 262_144);
        assert_eq!(config.annotation_cap, 500);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: HostConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.invoke_timeout_ms, 8_000);
        assert_eq!(config.host_call_rate_limit, 120);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: HostConfig = serde_json::from_str(r#"{"invokeTimeoutMs": 250}"#).unwrap();
        assert_eq!(config.invoke_timeout_ms, 250);
        assert_eq!(config.ready_timeout_ms, 8_000);
    }
}

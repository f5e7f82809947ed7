//! Boundaries to the two external collaborators.
//!
//! The **OS shell** owns the install store, the lock file, file dialogs and
//! every privileged native operation; the core talks to it through
//! [`HostShell`], whose method names are the fixed shell command names. The
//! **editor shell** owns the document tree, the caret and the selection;
//! the core talks to it through [`EditorShell`]. Neither trait is
//! implemented in this crate outside of tests.

use crate::manifest::{InstallSource, InstalledPlugin};
use crate::permissions::Permission;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single entry in the remote plugin registry index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub author: String,
    pub latest_version: String,
    /// Minimum editor version required to run this plugin.
    #[serde(default)]
    pub min_app_version: String,
    /// Core permissions the plugin will require.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Direct HTTPS download URL for the plugin package.
    pub download_url: String,
}

/// One row of the shell's install lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub plugin_id: String,
    pub version: String,
    /// Content hash of the installed package.
    #[serde(default)]
    pub integrity: String,
    #[serde(default)]
    pub source: InstallSource,
    pub installed_at: DateTime<Utc>,
}

/// The OS-shell command surface consumed by the core. Every method maps to
/// one fixed shell command; payloads and results are JSON.
#[async_trait]
pub trait HostShell: Send + Sync {
    async fn plugin_list_installed(&self) -> Result<Vec<InstalledPlugin>, String>;

    async fn plugin_install_from_file(&self, path: &str) -> Result<InstalledPlugin, String>;

    async fn plugin_fetch_registry_index(
        &self,
        registry_url: &str,
    ) -> Result<Vec<RegistryEntry>, String>;

    async fn plugin_install_from_registry(
        &self,
        registry_url: &str,
        plugin_id: &str,
        version: Option<&str>,
    ) -> Result<InstalledPlugin, String>;

    async fn plugin_uninstall(&self, plugin_id: &str) -> Result<(), String>;

    async fn plugin_enable_disable(
        &self,
        plugin_id: &str,
        enabled: bool,
    ) -> Result<InstalledPlugin, String>;

    async fn plugin_update_permissions(
        &self,
        plugin_id: &str,
        permissions: &[Permission],
    ) -> Result<InstalledPlugin, String>;

    async fn plugin_get_lock_records(&self) -> Result<Vec<LockRecord>, String>;

    /// Opaque native passthrough: the shell interprets `operation`.
    async fn plugin_host_call(
        &self,
        plugin_id: &str,
        operation: &str,
        payload: Value,
    ) -> Result<Value, String>;

    /// Ask the user whether to grant an optional permission.
    async fn prompt_permission(&self, plugin_id: &str, permission: Permission) -> bool;
}

/// The editor-shell adapter consumed by the core. All methods are
/// synchronous: the editor lives in-process and its state is memory-only.
pub trait EditorShell: Send + Sync {
    fn current_element_type(&self) -> String;
    fn previous_element_type(&self) -> Option<String>;
    fn is_current_element_empty(&self) -> bool;
    /// Current selection as `(from, to)`, or `None` for a bare caret.
    fn selection_range(&self) -> Option<(u64, u64)>;

    fn set_element_type(&self, element_type: &str);
    fn jump_to_position(&self, position: f64, offset_top: Option<f64>);
    fn cycle_element(&self, direction: i64);
    fn escape_to_action(&self);

    /// Snapshot of the document tree.
    fn get_document(&self) -> Value;
    /// Atomic replacement; the editor preserves undo semantics.
    fn replace_document(&self, document: Value) -> Result<(), String>;

    fn get_plugin_data(&self, plugin_id: &str) -> Option<Value>;
    fn set_plugin_data(&self, plugin_id: &str, value: Option<Value>) -> Result<(), String>;
}

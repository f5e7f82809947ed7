//! Shared fixtures for host tests: a scriptable mock OS shell, an
//! in-memory editor, and builders for installed-plugin records.

use crate::lifecycle::PluginHost;
use crate::manifest::{InstalledPlugin, PluginManifest, TrustState};
use crate::permissions::Permission;
use crate::shell::{EditorShell, HostShell, LockRecord, RegistryEntry};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Mock OS shell
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockShell {
    pub installed: Mutex<Vec<InstalledPlugin>>,
    /// Scripted answers for permission prompts, popped front first.
    pub prompt_answers: Mutex<VecDeque<bool>>,
    pub enable_disable_calls: Mutex<Vec<(String, bool)>>,
    pub permission_updates: Mutex<Vec<(String, Vec<Permission>)>>,
    pub host_calls: Mutex<Vec<(String, String, Value)>>,
    pub host_call_result: Mutex<Value>,
    pub lock_records: Mutex<Vec<LockRecord>>,
    pub registry_entries: Mutex<Vec<RegistryEntry>>,
}

#[async_trait]
impl HostShell for MockShell {
    async fn plugin_list_installed(&self) -> Result<Vec<InstalledPlugin>, String> {
        Ok(self.installed.lock().clone())
    }

    async fn plugin_install_from_file(&self, path: &str) -> Result<InstalledPlugin, String> {
        Err(format!("No plugin package at \"{path}\""))
    }

    async fn plugin_fetch_registry_index(
        &self,
        _registry_url: &str,
    ) -> Result<Vec<RegistryEntry>, String> {
        Ok(self.registry_entries.lock().clone())
    }

    async fn plugin_install_from_registry(
        &self,
        _registry_url: &str,
        plugin_id: &str,
        _version: Option<&str>,
    ) -> Result<InstalledPlugin, String> {
        Err(format!("Plugin \"{plugin_id}\" is not in the registry"))
    }

    async fn plugin_uninstall(&self, plugin_id: &str) -> Result<(), String> {
        self.installed.lock().retain(|p| p.id() != plugin_id);
        Ok(())
    }

    async fn plugin_enable_disable(
        &self,
        plugin_id: &str,
        enabled: bool,
    ) -> Result<InstalledPlugin, String> {
        self.enable_disable_calls
            .lock()
            .push((plugin_id.to_string(), enabled));
        let mut installed = self.installed.lock();
        let plugin = installed
            .iter_mut()
            .find(|p| p.id() == plugin_id)
            .ok_or_else(|| format!("Unknown plugin: \"{plugin_id}\""))?;
        plugin.enabled = enabled;
        Ok(plugin.clone())
    }

    async fn plugin_update_permissions(
        &self,
        plugin_id: &str,
        permissions: &[Permission],
    ) -> Result<InstalledPlugin, String> {
        self.permission_updates
            .lock()
            .push((plugin_id.to_string(), permissions.to_vec()));
        let mut installed = self.installed.lock();
        let plugin = installed
            .iter_mut()
            .find(|p| p.id() == plugin_id)
            .ok_or_else(|| format!("Unknown plugin: \"{plugin_id}\""))?;
        plugin.granted_permissions = permissions.to_vec();
        Ok(plugin.clone())
    }

    async fn plugin_get_lock_records(&self) -> Result<Vec<LockRecord>, String> {
        Ok(self.lock_records.lock().clone())
    }

    async fn plugin_host_call(
        &self,
        plugin_id: &str,
        operation: &str,
        payload: Value,
    ) -> Result<Value, String> {
        self.host_calls
            .lock()
            .push((plugin_id.to_string(), operation.to_string(), payload));
        Ok(self.host_call_result.lock().clone())
    }

    async fn prompt_permission(&self, _plugin_id: &str, _permission: Permission) -> bool {
        self.prompt_answers.lock().pop_front().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// In-memory editor
// ---------------------------------------------------------------------------

pub(crate) struct MemoryEditor {
    pub document: Mutex<Value>,
    pub plugin_data: Mutex<HashMap<String, Value>>,
    pub current_element: Mutex<String>,
    pub previous_element: Mutex<Option<String>>,
    pub current_empty: AtomicBool,
    pub selection: Mutex<Option<(u64, u64)>>,
    pub element_sets: Mutex<Vec<String>>,
    pub jumps: Mutex<Vec<(f64, Option<f64>)>>,
    pub cycles: Mutex<Vec<i64>>,
}

/// A document whose content size is 50.
pub(crate) fn sample_document() -> Value {
    json!({
        "type": "doc",
        "content": [
            { "type": "action", "content": [{ "type": "text", "text": "INT. OFFICE - NIGHT t" }] },
            { "type": "dialogue", "content": [{ "type": "text", "text": "He stares at the page. Ah" }] },
        ]
    })
}

impl Default for MemoryEditor {
    fn default() -> Self {
        Self {
            document: Mutex::new(sample_document()),
            plugin_data: Mutex::new(HashMap::new()),
            current_element: Mutex::new("action".to_string()),
            previous_element: Mutex::new(None),
            current_empty: AtomicBool::new(false),
            selection: Mutex::new(None),
            element_sets: Mutex::new(Vec::new()),
            jumps: Mutex::new(Vec::new()),
            cycles: Mutex::new(Vec::new()),
        }
    }
}

impl EditorShell for MemoryEditor {
    fn current_element_type(&self) -> String {
        self.current_element.lock().clone()
    }

    fn previous_element_type(&self) -> Option<String> {
        self.previous_element.lock().clone()
    }

    fn is_current_element_empty(&self) -> bool {
        self.current_empty.load(Ordering::Relaxed)
    }

    fn selection_range(&self) -> Option<(u64, u64)> {
        *self.selection.lock()
    }

    fn set_element_type(&self, element_type: &str) {
        self.element_sets.lock().push(element_type.to_string());
        *self.current_element.lock() = element_type.to_string();
    }

    fn jump_to_position(&self, position: f64, offset_top: Option<f64>) {
        self.jumps.lock().push((position, offset_top));
    }

    fn cycle_element(&self, direction: i64) {
        self.cycles.lock().push(direction);
    }

    fn escape_to_action(&self) {
        self.set_element_type("action");
    }

    fn get_document(&self) -> Value {
        self.document.lock().clone()
    }

    fn replace_document(&self, document: Value) -> Result<(), String> {
        *self.document.lock() = document;
        Ok(())
    }

    fn get_plugin_data(&self, plugin_id: &str) -> Option<Value> {
        self.plugin_data.lock().get(plugin_id).cloned()
    }

    fn set_plugin_data(&self, plugin_id: &str, value: Option<Value>) -> Result<(), String> {
        let mut data = self.plugin_data.lock();
        match value {
            Some(value) => {
                data.insert(plugin_id.to_string(), value);
            }
            None => {
                data.remove(plugin_id);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub(crate) fn test_manifest(id: &str, contributes: Value) -> PluginManifest {
    serde_json::from_value(json!({
        "id": id,
        "name": "Test Plugin",
        "version": "1.0.0",
        "entry": "main.rhai",
        "engines": { "app": ">=0.9", "api": "1" },
        "permissions": ["document:read", "document:write"],
        "contributes": contributes,
    }))
    .unwrap()
}

pub(crate) fn installed_with_source(manifest: PluginManifest, source: &str) -> InstalledPlugin {
    InstalledPlugin {
        manifest,
        trust: TrustState::Unverified,
        source: Default::default(),
        installed_at: Utc::now(),
        updated_at: Utc::now(),
        entry_source: Some(source.to_string()),
        enabled: true,
        crash_count: 0,
        granted_permissions: vec![],
    }
}

pub(crate) fn test_host(
    plugins: Vec<InstalledPlugin>,
) -> (PluginHost, Arc<MockShell>, Arc<MemoryEditor>) {
    let shell = Arc::new(MockShell {
        installed: Mutex::new(plugins),
        ..Default::default()
    });
    let editor = Arc::new(MemoryEditor::default());
    let host = PluginHost::new(shell.clone(), editor.clone());
    (host, shell, editor)
}

//! Plugin lifecycle.
//!
//! Owns the installed-plugin index, the activation state machine, and the
//! crash policy. `reload` is the only way back from `failed`: it disposes
//! every session, re-fetches the canonical installed list from the OS
//! shell, rebuilds the registry, and re-activates `onStartup` declarers.

use crate::config::HostConfig;
use crate::error::{ActivationError, HostError, InvokeError};
use crate::manifest::{validate_installed, InstalledPlugin};
use crate::panel_state::PanelFormState;
use crate::permissions::Permission;
use crate::registry::ContributionRegistry;
use crate::session::{spawn_session, SessionHandle};
use crate::shell::{EditorShell, HostShell, LockRecord, RegistryEntry};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, watch};

/// Per-plugin activation state. `failed` is terminal until reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationState {
    #[default]
    Inactive,
    Activating,
    Active,
    Failed,
}

type ActivationFuture = Shared<BoxFuture<'static, Result<(), ActivationError>>>;

/// State shared between the host object, session pumps, and dispatchers.
pub(crate) struct HostShared {
    pub config: HostConfig,
    pub shell: Arc<dyn HostShell>,
    pub editor: Arc<dyn EditorShell>,
    pub registry: ContributionRegistry,
    pub installed: RwLock<HashMap<String, InstalledPlugin>>,
    pub sessions: DashMap<String, Arc<SessionHandle>>,
    activation: DashMap<String, ActivationState>,
    /// Memoised in-flight activations, so concurrent `ensure_activated`
    /// callers await one future.
    in_flight: Mutex<HashMap<String, ActivationFuture>>,
    /// Crash counters, surviving reload so repeated crash/reload cycles
    /// still reach the auto-disable threshold. Cleared on re-enable.
    crash_counts: DashMap<String, u32>,
    /// Sliding windows for the native host-call rate limit.
    pub host_call_windows: DashMap<String, parking_lot::Mutex<VecDeque<Instant>>>,
    /// Form state per open panel, keyed by composite panel id.
    pub panel_forms: DashMap<String, Mutex<PanelFormState>>,
}

impl HostShared {
    pub(crate) fn installed_plugin(&self, plugin_id: &str) -> Option<InstalledPlugin> {
        self.installed.read().get(plugin_id).cloned()
    }

    pub(crate) fn set_granted_permissions(&self, plugin_id: &str, grants: Vec<Permission>) {
        if let Some(plugin) = self.installed.write().get_mut(plugin_id) {
            plugin.granted_permissions = grants;
        }
    }

    pub(crate) fn activation_state(&self, plugin_id: &str) -> ActivationState {
        self.activation
            .get(plugin_id)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    pub(crate) fn session(&self, plugin_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(plugin_id).map(|s| s.value().clone())
    }

    /// Dispose everything, re-fetch the installed list, rebuild the index,
    /// and start `onStartup` activations concurrently.
    pub(crate) async fn reload(self: &Arc<Self>) -> Result<(), String> {
        let old_sessions: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();
        for session in old_sessions {
            session.shutdown();
        }
        self.activation.clear();
        self.in_flight.lock().clear();
        self.panel_forms.clear();

        let list = self.shell.plugin_list_installed().await?;
        let mut index: HashMap<String, InstalledPlugin> = HashMap::new();
        for mut plugin in list {
            if let Err(e) = validate_installed(&plugin) {
                tracing::warn!(
                    plugin = plugin.id(),
                    "Skipping plugin with invalid record: {e}"
                );
                continue;
            }
            if index.contains_key(plugin.id()) {
                tracing::warn!(plugin = plugin.id(), "Skipping duplicate plugin id");
                continue;
            }
            if let Some(count) = self.crash_counts.get(plugin.id()) {
                plugin.crash_count = plugin.crash_count.max(*count.value());
            }
            index.insert(plugin.id().to_string(), plugin);
        }

        let plugins: Vec<InstalledPlugin> = index.values().cloned().collect();
        *self.installed.write() = index;
        self.registry.reload(&plugins);

        let mut startups = Vec::new();
        for plugin in plugins.iter().filter(|p| p.enabled) {
            self.activation
                .insert(plugin.id().to_string(), ActivationState::Inactive);
            if plugin
                .manifest
                .activation_events
                .iter()
                .any(|e| e == "onStartup")
            {
                startups.push(plugin.id().to_string());
            }
        }

        let activations = startups.into_iter().map(|id| {
            let shared = self.clone();
            async move {
                if let Err(e) = shared.ensure_activated(&id, "onStartup").await {
                    tracing::warn!(plugin = %id, "Startup activation failed: {e}");
                }
            }
        });
        futures_util::future::join_all(activations).await;
        Ok(())
    }

    /// Activate a plugin for `event` if it is not active yet. Idempotent
    /// under concurrent callers; validates the event against the manifest.
    pub(crate) async fn ensure_activated(
        self: &Arc<Self>,
        plugin_id: &str,
        event: &str,
    ) -> Result<(), ActivationError> {
        let Some(plugin) = self.installed_plugin(plugin_id) else {
            return Err(ActivationError::NotInstalled(plugin_id.to_string()));
        };
        if !plugin.enabled {
            return Err(ActivationError::Disabled(plugin_id.to_string()));
        }
        if !plugin.declares_event(event) {
            return Err(ActivationError::EventNotDeclared {
                plugin_id: plugin_id.to_string(),
                event: event.to_string(),
            });
        }

        match self.activation_state(plugin_id) {
            ActivationState::Active => return Ok(()),
            ActivationState::Failed => {
                return Err(ActivationError::PreviouslyFailed(plugin_id.to_string()))
            }
            ActivationState::Inactive | ActivationState::Activating => {}
        }

        let fut = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(plugin_id) {
                Some(fut) => fut.clone(),
                None => {
                    let fut: ActivationFuture =
                        activate(self.clone(), plugin_id.to_string()).boxed().shared();
                    in_flight.insert(plugin_id.to_string(), fut.clone());
                    fut
                }
            }
        };
        let result = fut.await;
        self.in_flight.lock().remove(plugin_id);
        result
    }

    /// The crash policy: terminate the worker, reject its pending
    /// requests, mark the plugin failed, count the crash, and auto-disable
    /// at the threshold.
    pub(crate) async fn report_crash(self: &Arc<Self>, session: &Arc<SessionHandle>, message: String) {
        let plugin_id = session.plugin_id.clone();
        tracing::error!(plugin = %plugin_id, "Plugin session crashed: {message}");

        session.terminate();
        session.resolve_ready(Err(message.clone()));
        session.reject_all_pending(InvokeError::Crashed(message.clone()));
        self.sessions
            .remove_if(&plugin_id, |_, s| Arc::ptr_eq(s, session));
        self.activation
            .insert(plugin_id.clone(), ActivationState::Failed);

        let crash_count = {
            let mut entry = self.crash_counts.entry(plugin_id.clone()).or_insert(0);
            *entry.value_mut() += 1;
            *entry.value()
        };
        if let Some(plugin) = self.installed.write().get_mut(&plugin_id) {
            plugin.crash_count = crash_count;
        }

        if crash_count >= self.config.crash_disable_threshold {
            tracing::warn!(plugin = %plugin_id, "Auto-disabling after {crash_count} crashes");
            if let Err(e) = self.shell.plugin_enable_disable(&plugin_id, false).await {
                tracing::warn!(plugin = %plugin_id, "Failed to disable plugin: {e}");
            }
            if let Err(e) = self.reload().await {
                tracing::warn!("Reload after auto-disable failed: {e}");
            }
        }
    }
}

async fn activate(shared: Arc<HostShared>, plugin_id: String) -> Result<(), ActivationError> {
    let Some(plugin) = shared.installed_plugin(&plugin_id) else {
        return Err(ActivationError::NotInstalled(plugin_id));
    };
    if plugin.entry_source.is_none() {
        shared
            .activation
            .insert(plugin_id.clone(), ActivationState::Failed);
        return Err(ActivationError::EntrySourceMissing(plugin_id));
    }

    shared
        .activation
        .insert(plugin_id.clone(), ActivationState::Activating);
    let (ready_tx, ready_rx) = oneshot::channel();
    let session = spawn_session(shared.clone(), &plugin, ready_tx);
    shared.sessions.insert(plugin_id.clone(), session.clone());

    let timeout = shared.config.ready_timeout();
    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => {
            shared
                .activation
                .insert(plugin_id, ActivationState::Active);
            Ok(())
        }
        Ok(Ok(Err(message))) => {
            shared
                .sessions
                .remove_if(&plugin_id, |_, s| Arc::ptr_eq(s, &session));
            shared
                .activation
                .insert(plugin_id.clone(), ActivationState::Failed);
            Err(ActivationError::Crashed { plugin_id, message })
        }
        Ok(Err(_)) => {
            shared
                .sessions
                .remove_if(&plugin_id, |_, s| Arc::ptr_eq(s, &session));
            shared
                .activation
                .insert(plugin_id.clone(), ActivationState::Failed);
            Err(ActivationError::Crashed {
                plugin_id,
                message: "Worker exited during activation".into(),
            })
        }
        Err(_) => {
            session.terminate();
            shared
                .sessions
                .remove_if(&plugin_id, |_, s| Arc::ptr_eq(s, &session));
            shared
                .activation
                .insert(plugin_id.clone(), ActivationState::Failed);
            Err(ActivationError::ReadyTimeout {
                plugin_id,
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Host object
// ---------------------------------------------------------------------------

/// The in-process plugin host. One instance per editor window.
pub struct PluginHost {
    pub(crate) shared: Arc<HostShared>,
}

impl PluginHost {
    pub fn new(shell: Arc<dyn HostShell>, editor: Arc<dyn EditorShell>) -> Self {
        Self::with_config(HostConfig::default(), shell, editor)
    }

    pub fn with_config(
        config: HostConfig,
        shell: Arc<dyn HostShell>,
        editor: Arc<dyn EditorShell>,
    ) -> Self {
        Self {
            shared: Arc::new(HostShared {
                config,
                shell,
                editor,
                registry: ContributionRegistry::new(),
                installed: RwLock::new(HashMap::new()),
                sessions: DashMap::new(),
                activation: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                crash_counts: DashMap::new(),
                host_call_windows: DashMap::new(),
                panel_forms: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ContributionRegistry {
        &self.shared.registry
    }

    /// Registry change notifications, as a monotonically advancing version.
    pub fn subscribe_registry(&self) -> watch::Receiver<u64> {
        self.shared.registry.subscribe()
    }

    pub fn installed_plugins(&self) -> Vec<InstalledPlugin> {
        let mut plugins: Vec<_> = self.shared.installed.read().values().cloned().collect();
        plugins.sort_by(|a, b| a.id().cmp(b.id()));
        plugins
    }

    pub fn installed_plugin(&self, plugin_id: &str) -> Option<InstalledPlugin> {
        self.shared.installed_plugin(plugin_id)
    }

    pub fn activation_state(&self, plugin_id: &str) -> ActivationState {
        self.shared.activation_state(plugin_id)
    }

    pub async fn reload(&self) -> Result<(), HostError> {
        self.shared.reload().await.map_err(HostError::Shell)
    }

    pub async fn ensure_activated(&self, plugin_id: &str, event: &str) -> Result<(), HostError> {
        self.shared
            .ensure_activated(plugin_id, event)
            .await
            .map_err(HostError::from)
    }

    // -- management surface --

    pub async fn install_from_file(&self, path: &str) -> Result<InstalledPlugin, HostError> {
        let plugin = self
            .shared
            .shell
            .plugin_install_from_file(path)
            .await
            .map_err(HostError::Shell)?;
        self.reload().await?;
        Ok(plugin)
    }

    pub async fn install_from_registry(
        &self,
        registry_url: &str,
        plugin_id: &str,
        version: Option<&str>,
    ) -> Result<InstalledPlugin, HostError> {
        let plugin = self
            .shared
            .shell
            .plugin_install_from_registry(registry_url, plugin_id, version)
            .await
            .map_err(HostError::Shell)?;
        self.reload().await?;
        Ok(plugin)
    }

    pub async fn uninstall(&self, plugin_id: &str) -> Result<(), HostError> {
        self.shared
            .shell
            .plugin_uninstall(plugin_id)
            .await
            .map_err(HostError::Shell)?;
        self.reload().await
    }

    pub async fn set_enabled(
        &self,
        plugin_id: &str,
        enabled: bool,
    ) -> Result<InstalledPlugin, HostError> {
        let plugin = self
            .shared
            .shell
            .plugin_enable_disable(plugin_id, enabled)
            .await
            .map_err(HostError::Shell)?;
        if enabled {
            // A manual re-enable starts the crash budget over.
            self.shared.crash_counts.remove(plugin_id);
        }
        self.reload().await?;
        Ok(plugin)
    }

    /// Replace a plugin's grant set. Applied atomically: persisted through
    /// the shell first, then the in-memory record, then one notification.
    pub async fn update_permissions(
        &self,
        plugin_id: &str,
        permissions: Vec<Permission>,
    ) -> Result<InstalledPlugin, HostError> {
        let updated = self
            .shared
            .shell
            .plugin_update_permissions(plugin_id, &permissions)
            .await
            .map_err(HostError::Shell)?;
        self.shared
            .set_granted_permissions(plugin_id, updated.granted_permissions.clone());
        self.shared.registry.notify();
        Ok(updated)
    }

    pub async fn registry_index(&self, registry_url: &str) -> Result<Vec<RegistryEntry>, HostError> {
        self.shared
            .shell
            .plugin_fetch_registry_index(registry_url)
            .await
            .map_err(HostError::Shell)
    }

    pub async fn lock_records(&self) -> Result<Vec<LockRecord>, HostError> {
        self.shared
            .shell
            .plugin_get_lock_records()
            .await
            .map_err(HostError::Shell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{installed_with_source, test_host, test_manifest};
    use serde_json::json;
    use std::time::Duration;

    const NOOP_PLUGIN: &str = "fn setup(api) {}";
    const CRASHY_PLUGIN: &str = r#"fn setup(api) { throw "boom"; }"#;

    /// A manifest whose only activation event is `onCommand:format`, so
    /// reload never auto-activates it.
    fn on_command_manifest(id: &str) -> crate::manifest::PluginManifest {
        let mut manifest = test_manifest(id, json!({ "commands": [{ "id": "format" }] }));
        manifest.activation_events.push("onCommand:format".into());
        manifest
    }

    #[tokio::test]
    async fn reload_indexes_installed_plugins() {
        let plugin = installed_with_source(test_manifest("com.acme.notes", json!({})), NOOP_PLUGIN);
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();
        assert_eq!(host.installed_plugins().len(), 1);
        assert_eq!(
            host.activation_state("com.acme.notes"),
            ActivationState::Inactive
        );
    }

    #[tokio::test]
    async fn invalid_records_are_skipped_not_fatal() {
        let good = installed_with_source(test_manifest("com.good", json!({})), NOOP_PLUGIN);
        let mut bad = installed_with_source(test_manifest("com.bad", json!({})), NOOP_PLUGIN);
        bad.entry_source = None; // enabled without source
        let (host, _shell, _editor) = test_host(vec![good, bad]);
        host.reload().await.unwrap();
        let ids: Vec<_> = host
            .installed_plugins()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["com.good"]);
    }

    #[tokio::test]
    async fn on_startup_declarers_activate_during_reload() {
        let mut manifest = test_manifest("com.acme.notes", json!({}));
        manifest.activation_events.push("onStartup".into());
        let plugin = installed_with_source(manifest, NOOP_PLUGIN);
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();
        assert_eq!(
            host.activation_state("com.acme.notes"),
            ActivationState::Active
        );
    }

    #[tokio::test]
    async fn activation_requires_a_declared_event() {
        let manifest = test_manifest(
            "com.acme.notes",
            json!({ "commands": [{ "id": "format" }] }),
        );
        let plugin = installed_with_source(manifest, NOOP_PLUGIN);
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();

        let result = host
            .ensure_activated("com.acme.notes", "onCommand:format")
            .await;
        assert!(matches!(
            result,
            Err(HostError::Activation(ActivationError::EventNotDeclared { .. }))
        ));
        assert_eq!(
            host.activation_state("com.acme.notes"),
            ActivationState::Inactive
        );
        assert!(host.shared.sessions.is_empty());
    }

    #[tokio::test]
    async fn unknown_plugin_cannot_activate() {
        let (host, _shell, _editor) = test_host(vec![]);
        host.reload().await.unwrap();
        let result = host.ensure_activated("com.ghost", "onStartup").await;
        assert!(matches!(
            result,
            Err(HostError::Activation(ActivationError::NotInstalled(_)))
        ));
    }

    #[tokio::test]
    async fn activation_is_idempotent_under_concurrency() {
        let plugin = installed_with_source(on_command_manifest("com.acme.notes"), NOOP_PLUGIN);
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();

        let (a, b, c) = tokio::join!(
            host.ensure_activated("com.acme.notes", "onCommand:format"),
            host.ensure_activated("com.acme.notes", "onCommand:format"),
            host.ensure_activated("com.acme.notes", "onCommand:format"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(host.shared.sessions.len(), 1);
        assert_eq!(
            host.activation_state("com.acme.notes"),
            ActivationState::Active
        );
        let session = host.shared.session("com.acme.notes").unwrap();
        assert!(session.ready.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn setup_crash_marks_failed_and_blocks_reactivation() {
        let plugin = installed_with_source(on_command_manifest("com.crashy"), CRASHY_PLUGIN);
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();

        let result = host.ensure_activated("com.crashy", "onCommand:format").await;
        assert!(matches!(
            result,
            Err(HostError::Activation(ActivationError::Crashed { .. }))
        ));
        assert_eq!(host.activation_state("com.crashy"), ActivationState::Failed);
        assert!(host.shared.sessions.is_empty());

        // A second attempt is refused without starting a session.
        let result = host.ensure_activated("com.crashy", "onCommand:format").await;
        assert!(matches!(
            result,
            Err(HostError::Activation(ActivationError::PreviouslyFailed(_)))
        ));
        assert!(host.shared.sessions.is_empty());
    }

    #[tokio::test]
    async fn reload_clears_the_failed_state() {
        let plugin = installed_with_source(on_command_manifest("com.crashy"), CRASHY_PLUGIN);
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();
        let _ = host.ensure_activated("com.crashy", "onCommand:format").await;
        assert_eq!(host.activation_state("com.crashy"), ActivationState::Failed);

        host.reload().await.unwrap();
        assert_eq!(host.activation_state("com.crashy"), ActivationState::Inactive);
    }

    #[tokio::test]
    async fn three_crashes_auto_disable_via_the_shell() {
        let plugin = installed_with_source(on_command_manifest("com.crashy"), CRASHY_PLUGIN);
        let (host, shell, _editor) = test_host(vec![plugin]);

        for _ in 0..3 {
            host.reload().await.unwrap();
            let _ = host.ensure_activated("com.crashy", "onCommand:format").await;
            // Let the crash handler finish its bookkeeping.
            tokio::time::sleep(Duration::from_millis(80)).await;
        }

        let calls = shell.enable_disable_calls.lock().clone();
        assert!(
            calls.contains(&("com.crashy".to_string(), false)),
            "expected an auto-disable call, got {calls:?}"
        );
        // The shell flipped the flag; after the follow-up reload no new
        // session may start.
        let result = host.ensure_activated("com.crashy", "onCommand:format").await;
        assert!(matches!(
            result,
            Err(HostError::Activation(ActivationError::Disabled(_)))
        ));
    }

    #[tokio::test]
    async fn undeclared_runtime_registration_crashes_the_session() {
        let mut manifest = test_manifest("com.sneaky", json!({}));
        manifest.activation_events.push("onStartup".into());
        let plugin = installed_with_source(
            manifest,
            r#"
            fn setup(api) {
                api.register_command(#{ id: "sneaky", title: "Sneaky", handler: |ctx| 0 });
            }
            "#,
        );
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(host.activation_state("com.sneaky"), ActivationState::Failed);
        assert!(host.registry().command("com.sneaky:sneaky").is_none());
    }

    #[tokio::test]
    async fn crash_in_one_session_leaves_others_untouched() {
        let stable = installed_with_source(on_command_manifest("com.stable"), NOOP_PLUGIN);
        let crashy = installed_with_source(on_command_manifest("com.crashy"), CRASHY_PLUGIN);

        let (host, _shell, _editor) = test_host(vec![stable, crashy]);
        host.reload().await.unwrap();

        let (a, b) = tokio::join!(
            host.ensure_activated("com.stable", "onCommand:format"),
            host.ensure_activated("com.crashy", "onCommand:format"),
        );
        assert!(a.is_ok());
        assert!(b.is_err());
        assert_eq!(host.activation_state("com.stable"), ActivationState::Active);
        assert_eq!(host.activation_state("com.crashy"), ActivationState::Failed);
        assert!(host.shared.session("com.stable").is_some());
    }

    #[tokio::test]
    async fn disabled_plugins_never_get_sessions() {
        let mut manifest = test_manifest("com.off", json!({}));
        manifest.activation_events.push("onStartup".into());
        let mut plugin = installed_with_source(manifest, NOOP_PLUGIN);
        plugin.enabled = false;
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();
        assert!(host.shared.sessions.is_empty());
        let result = host.ensure_activated("com.off", "onStartup").await;
        assert!(matches!(
            result,
            Err(HostError::Activation(ActivationError::Disabled(_)))
        ));
    }

    #[tokio::test]
    async fn update_permissions_notifies_the_registry() {
        let mut manifest = test_manifest("com.acme.notes", json!({}));
        manifest.optional_permissions = vec![Permission::EditorAnnotations];
        let plugin = installed_with_source(manifest, NOOP_PLUGIN);
        let (host, _shell, _editor) = test_host(vec![plugin]);
        host.reload().await.unwrap();

        let before = host.registry().version();
        host.update_permissions("com.acme.notes", vec![Permission::EditorAnnotations])
            .await
            .unwrap();
        assert!(host.registry().version() > before);
        let plugin = host.installed_plugin("com.acme.notes").unwrap();
        assert!(plugin.holds(Permission::EditorAnnotations));
    }
}

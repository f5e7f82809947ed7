//! The contribution registry.
//!
//! One table per contribution kind, keyed by composite id. Entries come
//! from two sources: manifest-derived rows built at reload, and runtime
//! rows from worker `register-<kind>` messages. The manifest is the
//! authority — a runtime registration whose local id was never declared is
//! rejected, which the caller treats as a session-fatal validation error.
//!
//! Observers subscribe to a single watch channel carrying a monotonically
//! advancing version number; they may see several notifications without an
//! intervening observable change.

use crate::contributions::{
    composite_id, validate_annotation_provider, validate_command, validate_exporter,
    validate_importer, validate_status_badge, validate_transform, validate_ui_control,
    validate_ui_panel, AnnotationProviderDescriptor, CommandDescriptor, ContributionKind,
    ExporterDescriptor, ImporterDescriptor, StatusBadgeDescriptor, TransformDescriptor,
    TransformHook, UiControlDescriptor, UiPanelDescriptor,
};
use crate::element_loop::ElementLoopProvider;
use crate::manifest::InstalledPlugin;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// A registry row: the descriptor plus its owner.
#[derive(Debug, Clone)]
pub struct Registered<T> {
    pub composite_id: String,
    pub plugin_id: String,
    pub descriptor: T,
}

/// What a runtime `register-<kind>` message targets. Element-loop providers
/// have no manifest section, so they skip the declaration check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistrationKind {
    Command,
    Transform,
    Exporter,
    Importer,
    StatusBadge,
    InlineAnnotations,
    UiControl,
    UiPanel,
    ElementLoop,
}

#[derive(Default)]
struct Tables {
    commands: BTreeMap<String, Registered<CommandDescriptor>>,
    transforms: BTreeMap<String, Registered<TransformDescriptor>>,
    exporters: BTreeMap<String, Registered<ExporterDescriptor>>,
    importers: BTreeMap<String, Registered<ImporterDescriptor>>,
    status_badges: BTreeMap<String, Registered<StatusBadgeDescriptor>>,
    annotation_providers: BTreeMap<String, Registered<AnnotationProviderDescriptor>>,
    ui_controls: BTreeMap<String, Registered<UiControlDescriptor>>,
    ui_panels: BTreeMap<String, Registered<UiPanelDescriptor>>,
    element_loops: BTreeMap<String, Registered<ElementLoopProvider>>,
}

pub struct ContributionRegistry {
    tables: RwLock<Tables>,
    version: watch::Sender<u64>,
}

impl Default for ContributionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn insert<T>(
    map: &mut BTreeMap<String, Registered<T>>,
    plugin_id: &str,
    local_id: &str,
    descriptor: T,
) {
    let id = composite_id(plugin_id, local_id);
    map.insert(
        id.clone(),
        Registered {
            composite_id: id,
            plugin_id: plugin_id.to_string(),
            descriptor,
        },
    );
}

/// Priority descending, ties broken by composite id ascending. The input
/// map already iterates id-ascending, so a stable sort on priority alone
/// preserves the tiebreak.
fn sorted_by_priority<T: Clone>(
    map: &BTreeMap<String, Registered<T>>,
    priority: impl Fn(&T) -> i64,
) -> Vec<Registered<T>> {
    let mut rows: Vec<_> = map.values().cloned().collect();
    rows.sort_by_key(|row| std::cmp::Reverse(priority(&row.descriptor)));
    rows
}

impl ContributionRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            version,
        }
    }

    /// Current registry version. Advances on every successful register,
    /// reload, or permission change.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub(crate) fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Rebuild every table from the installed list's manifests. Disabled
    /// plugins contribute nothing.
    pub(crate) fn reload(&self, plugins: &[InstalledPlugin]) {
        let mut tables = Tables::default();
        for plugin in plugins.iter().filter(|p| p.enabled) {
            let id = plugin.id();
            let c = &plugin.manifest.contributes;
            for d in &c.commands {
                insert(&mut tables.commands, id, &d.id, d.clone());
            }
            for d in &c.transforms {
                insert(&mut tables.transforms, id, &d.id, d.clone());
            }
            for d in &c.exporters {
                insert(&mut tables.exporters, id, &d.id, d.clone());
            }
            for d in &c.importers {
                insert(&mut tables.importers, id, &d.id, d.clone());
            }
            for d in &c.status_badges {
                insert(&mut tables.status_badges, id, &d.id, d.clone());
            }
            for d in &c.inline_annotations {
                insert(&mut tables.annotation_providers, id, &d.id, d.clone());
            }
            for d in &c.ui_controls {
                insert(&mut tables.ui_controls, id, &d.id, d.clone());
            }
            for d in &c.ui_panels {
                insert(&mut tables.ui_panels, id, &d.id, d.clone());
            }
        }
        *self.tables.write() = tables;
        self.notify();
    }

    /// Apply one runtime registration. Upserts by composite id; the id must
    /// be declared in the owning plugin's manifest.
    pub(crate) fn apply_registration(
        &self,
        plugin: &InstalledPlugin,
        kind: RegistrationKind,
        descriptor: Value,
    ) -> Result<(), String> {
        let plugin_id = plugin.id();
        {
            let mut tables = self.tables.write();
            match kind {
                RegistrationKind::Command => {
                    let d: CommandDescriptor = parse(descriptor, "command")?;
                    validate_command(&d)?;
                    self.ensure_declared(plugin, ContributionKind::Command, &d.id)?;
                    insert(&mut tables.commands, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::Transform => {
                    let d: TransformDescriptor = parse(descriptor, "transform")?;
                    validate_transform(&d)?;
                    self.ensure_declared(plugin, ContributionKind::Transform, &d.id)?;
                    insert(&mut tables.transforms, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::Exporter => {
                    let d: ExporterDescriptor = parse(descriptor, "exporter")?;
                    validate_exporter(&d)?;
                    self.ensure_declared(plugin, ContributionKind::Exporter, &d.id)?;
                    insert(&mut tables.exporters, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::Importer => {
                    let d: ImporterDescriptor = parse(descriptor, "importer")?;
                    validate_importer(&d)?;
                    self.ensure_declared(plugin, ContributionKind::Importer, &d.id)?;
                    insert(&mut tables.importers, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::StatusBadge => {
                    let d: StatusBadgeDescriptor = parse(descriptor, "status badge")?;
                    validate_status_badge(&d)?;
                    self.ensure_declared(plugin, ContributionKind::StatusBadge, &d.id)?;
                    insert(&mut tables.status_badges, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::InlineAnnotations => {
                    let d: AnnotationProviderDescriptor =
                        parse(descriptor, "annotation provider")?;
                    validate_annotation_provider(&d)?;
                    self.ensure_declared(plugin, ContributionKind::InlineAnnotations, &d.id)?;
                    insert(&mut tables.annotation_providers, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::UiControl => {
                    let d: UiControlDescriptor = parse(descriptor, "ui control")?;
                    validate_ui_control(&d)?;
                    self.ensure_declared(plugin, ContributionKind::UiControl, &d.id)?;
                    insert(&mut tables.ui_controls, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::UiPanel => {
                    let d: UiPanelDescriptor = parse(descriptor, "ui panel")?;
                    validate_ui_panel(&d)?;
                    self.ensure_declared(plugin, ContributionKind::UiPanel, &d.id)?;
                    insert(&mut tables.ui_panels, plugin_id, &d.id.clone(), d);
                }
                RegistrationKind::ElementLoop => {
                    let d: ElementLoopProvider = parse(descriptor, "element-loop provider")?;
                    if !crate::contributions::is_valid_local_id(&d.id) {
                        return Err(format!("Invalid element-loop provider id: \"{}\"", d.id));
                    }
                    insert(&mut tables.element_loops, plugin_id, &d.id.clone(), d);
                }
            }
        }
        self.notify();
        Ok(())
    }

    fn ensure_declared(
        &self,
        plugin: &InstalledPlugin,
        kind: ContributionKind,
        local_id: &str,
    ) -> Result<(), String> {
        if plugin.manifest.contributes.declares(kind, local_id) {
            Ok(())
        } else {
            Err(format!(
                "Plugin \"{}\" registered undeclared {} id \"{local_id}\"",
                plugin.id(),
                kind.as_str()
            ))
        }
    }

    // -- lookups --

    pub fn command(&self, composite: &str) -> Option<Registered<CommandDescriptor>> {
        self.tables.read().commands.get(composite).cloned()
    }

    pub fn exporter(&self, composite: &str) -> Option<Registered<ExporterDescriptor>> {
        self.tables.read().exporters.get(composite).cloned()
    }

    pub fn importer(&self, composite: &str) -> Option<Registered<ImporterDescriptor>> {
        self.tables.read().importers.get(composite).cloned()
    }

    pub fn ui_control(&self, composite: &str) -> Option<Registered<UiControlDescriptor>> {
        self.tables.read().ui_controls.get(composite).cloned()
    }

    pub fn ui_panel(&self, composite: &str) -> Option<Registered<UiPanelDescriptor>> {
        self.tables.read().ui_panels.get(composite).cloned()
    }

    // -- ordered listings --

    /// All commands, composite id ascending.
    pub fn commands(&self) -> Vec<Registered<CommandDescriptor>> {
        self.tables.read().commands.values().cloned().collect()
    }

    pub fn transforms_for_hook(&self, hook: TransformHook) -> Vec<Registered<TransformDescriptor>> {
        let tables = self.tables.read();
        let matching: BTreeMap<_, _> = tables
            .transforms
            .iter()
            .filter(|(_, row)| row.descriptor.hook == hook)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        sorted_by_priority(&matching, |d| d.priority)
    }

    pub fn status_badges(&self) -> Vec<Registered<StatusBadgeDescriptor>> {
        sorted_by_priority(&self.tables.read().status_badges, |d| d.priority)
    }

    pub fn annotation_providers(&self) -> Vec<Registered<AnnotationProviderDescriptor>> {
        sorted_by_priority(&self.tables.read().annotation_providers, |d| d.priority)
    }

    pub fn ui_controls(&self) -> Vec<Registered<UiControlDescriptor>> {
        sorted_by_priority(&self.tables.read().ui_controls, |d| d.priority)
    }

    pub fn ui_panels(&self) -> Vec<Registered<UiPanelDescriptor>> {
        sorted_by_priority(&self.tables.read().ui_panels, |d| d.priority)
    }

    pub fn element_loop_providers(&self) -> Vec<Registered<ElementLoopProvider>> {
        sorted_by_priority(&self.tables.read().element_loops, |d| d.priority)
    }
}

fn parse<T: serde::de::DeserializeOwned>(descriptor: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(descriptor).map_err(|e| format!("Malformed {what} registration: {e}"))
}

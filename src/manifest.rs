//! Plugin manifests and installed-plugin records.
//!
//! The manifest is the authority for what a plugin may do: its permissions,
//! its activation events, and the full set of contributions it is allowed
//! to register at runtime. Validation here is strict — an installed record
//! that fails it is skipped at reload and never gets a session.

use crate::contributions::{
    is_valid_local_id, validate_annotation_provider, validate_command, validate_exporter,
    validate_importer, validate_status_badge, validate_transform, validate_ui_control,
    validate_ui_panel, AnnotationProviderDescriptor, CommandDescriptor, ContributionKind,
    ExporterDescriptor, ImporterDescriptor, StatusBadgeDescriptor, TransformDescriptor,
    UiControlDescriptor, UiPanelDescriptor,
};
use crate::permissions::Permission;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};

lazy_static::lazy_static! {
    static ref PLUGIN_ID_RE: regex::Regex =
        regex::Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$").unwrap();
}

/// Reverse-DNS-style plugin identifier, e.g. `com.acme.notes`. Never
/// contains `:`, which keeps composite ids unambiguous.
pub fn is_valid_plugin_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 128 && PLUGIN_ID_RE.is_match(id)
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Engine-compatibility pair: the editor version range and the plugin API
/// version the entry script was written against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineCompat {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub api: String,
}

/// Every contribution a plugin declares, one list per kind. Runtime
/// registrations must hit an id listed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestContributions {
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,
    #[serde(default)]
    pub transforms: Vec<TransformDescriptor>,
    #[serde(default)]
    pub exporters: Vec<ExporterDescriptor>,
    #[serde(default)]
    pub importers: Vec<ImporterDescriptor>,
    #[serde(default)]
    pub status_badges: Vec<StatusBadgeDescriptor>,
    #[serde(default)]
    pub inline_annotations: Vec<AnnotationProviderDescriptor>,
    #[serde(default)]
    pub ui_controls: Vec<UiControlDescriptor>,
    #[serde(default)]
    pub ui_panels: Vec<UiPanelDescriptor>,
}

impl ManifestContributions {
    /// Declared local ids for one contribution kind.
    pub fn ids_of(&self, kind: ContributionKind) -> Vec<&str> {
        match kind {
            ContributionKind::Command => self.commands.iter().map(|c| c.id.as_str()).collect(),
            ContributionKind::Transform => self.transforms.iter().map(|c| c.id.as_str()).collect(),
            ContributionKind::Exporter => self.exporters.iter().map(|c| c.id.as_str()).collect(),
            ContributionKind::Importer => self.importers.iter().map(|c| c.id.as_str()).collect(),
            ContributionKind::StatusBadge => {
                self.status_badges.iter().map(|c| c.id.as_str()).collect()
            }
            ContributionKind::InlineAnnotations => self
                .inline_annotations
                .iter()
                .map(|c| c.id.as_str())
                .collect(),
            ContributionKind::UiControl => {
                self.ui_controls.iter().map(|c| c.id.as_str()).collect()
            }
            ContributionKind::UiPanel => self.ui_panels.iter().map(|c| c.id.as_str()).collect(),
        }
    }

    pub fn declares(&self, kind: ContributionKind, local_id: &str) -> bool {
        self.ids_of(kind).contains(&local_id)
    }
}

/// Plugin manifest (v1, signed or unsigned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Path of the entry script inside the plugin package.
    pub entry: String,
    #[serde(default)]
    pub engines: EngineCompat,
    /// Core permissions, always required.
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Optional permissions, granted per user decision.
    #[serde(default)]
    pub optional_permissions: Vec<Permission>,
    /// HTTPS URL patterns the plugin may reach through `network:https`.
    #[serde(default)]
    pub allowed_urls: Vec<String>,
    #[serde(default)]
    pub activation_events: Vec<String>,
    #[serde(default)]
    pub contributes: ManifestContributions,
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// Returns true if a relative path attempts to escape its root via `..`,
/// absolute components, or other shenanigans.
fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);
    if path.is_absolute() {
        return true;
    }
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return true,
            _ => {}
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Parse and shape-check one activation event against the manifest.
/// `onStartup` is always valid; `on<Kind>:<arg>` must target a declared
/// contribution (or a known hook for `onTransform`).
pub fn validate_activation_event(manifest: &PluginManifest, event: &str) -> Result<(), String> {
    if event == "onStartup" {
        return Ok(());
    }
    let Some((prefix, arg)) = event.split_once(':') else {
        return Err(format!("Malformed activation event: \"{event}\""));
    };
    if prefix == "onTransform" {
        return match arg {
            "post-open" | "pre-save" | "pre-export" => Ok(()),
            _ => Err(format!("Unknown transform hook in activation event: \"{event}\"")),
        };
    }
    let kind = match prefix {
        "onCommand" => ContributionKind::Command,
        "onExporter" => ContributionKind::Exporter,
        "onImporter" => ContributionKind::Importer,
        "onStatusBadge" => ContributionKind::StatusBadge,
        "onInlineAnnotations" => ContributionKind::InlineAnnotations,
        "onUIControl" => ContributionKind::UiControl,
        "onUIPanel" => ContributionKind::UiPanel,
        _ => return Err(format!("Unknown activation event: \"{event}\"")),
    };
    if !is_valid_local_id(arg) {
        return Err(format!("Invalid local id in activation event: \"{event}\""));
    }
    if !manifest.contributes.declares(kind, arg) {
        return Err(format!(
            "Activation event \"{event}\" targets an undeclared {} id",
            kind.as_str()
        ));
    }
    Ok(())
}

/// Validate a parsed manifest for required fields and sanity.
pub fn validate_manifest(manifest: &PluginManifest) -> Result<(), String> {
    if !is_valid_plugin_id(&manifest.id) {
        return Err(format!("Invalid plugin id: \"{}\"", manifest.id));
    }
    if manifest.name.is_empty() {
        return Err("name is empty".into());
    }
    if manifest.version.is_empty() {
        return Err("version is empty".into());
    }
    if manifest.entry.is_empty() {
        return Err("entry is empty".into());
    }
    if is_path_escape(&manifest.entry) {
        return Err(format!(
            "entry \"{}\" attempts path traversal",
            manifest.entry
        ));
    }

    for perm in &manifest.permissions {
        if !perm.is_core() {
            return Err(format!("\"{perm}\" is not a core permission"));
        }
    }
    for perm in &manifest.optional_permissions {
        if !perm.is_optional() {
            return Err(format!("\"{perm}\" is not an optional permission"));
        }
    }

    // One namespace per plugin: no two contributions share a local id,
    // regardless of kind.
    let mut seen: HashSet<&str> = HashSet::new();
    for kind in [
        ContributionKind::Command,
        ContributionKind::Transform,
        ContributionKind::Exporter,
        ContributionKind::Importer,
        ContributionKind::StatusBadge,
        ContributionKind::InlineAnnotations,
        ContributionKind::UiControl,
        ContributionKind::UiPanel,
    ] {
        for id in manifest.contributes.ids_of(kind) {
            if !seen.insert(id) {
                return Err(format!("Duplicate contribution id: \"{id}\""));
            }
        }
    }

    for c in &manifest.contributes.commands {
        validate_command(c)?;
    }
    for c in &manifest.contributes.transforms {
        validate_transform(c)?;
    }
    for c in &manifest.contributes.exporters {
        validate_exporter(c)?;
    }
    for c in &manifest.contributes.importers {
        validate_importer(c)?;
    }
    for c in &manifest.contributes.status_badges {
        validate_status_badge(c)?;
    }
    for c in &manifest.contributes.inline_annotations {
        validate_annotation_provider(c)?;
    }
    for c in &manifest.contributes.ui_controls {
        validate_ui_control(c)?;
    }
    for c in &manifest.contributes.ui_panels {
        validate_ui_panel(c)?;
    }

    for event in &manifest.activation_events {
        validate_activation_event(manifest, event)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Installed plugins
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustState {
    #[serde(rename = "verified")]
    Verified,
    #[default]
    #[serde(rename = "unverified")]
    Unverified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallSource {
    #[default]
    #[serde(rename = "sideload")]
    Sideload,
    #[serde(rename = "registry")]
    Registry,
}

/// One row of the OS shell's install store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub manifest: PluginManifest,
    #[serde(default)]
    pub trust: TrustState,
    #[serde(default)]
    pub source: InstallSource,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Raw entry script text. Present for every enabled plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_source: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub crash_count: u32,
    #[serde(default)]
    pub granted_permissions: Vec<Permission>,
}

impl InstalledPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// The permission gate: required permissions always hold, optional
    /// ones only while the grant record marks them granted.
    pub fn holds(&self, perm: Permission) -> bool {
        self.manifest.permissions.contains(&perm)
            || (self.manifest.optional_permissions.contains(&perm)
                && self.granted_permissions.contains(&perm))
    }

    /// Whether `event` may activate this plugin. `onStartup` is an
    /// implicit wildcard.
    pub fn declares_event(&self, event: &str) -> bool {
        event == "onStartup" || self.manifest.activation_events.iter().any(|e| e == event)
    }
}

/// Validate an installed record before it enters the live index.
pub fn validate_installed(plugin: &InstalledPlugin) -> Result<(), String> {
    validate_manifest(&plugin.manifest)?;
    if plugin.enabled && plugin.entry_source.is_none() {
        return Err("enabled plugin has no entry source".into());
    }
    for perm in &plugin.granted_permissions {
        if !plugin.manifest.optional_permissions.contains(perm) {
            return Err(format!("granted permission \"{perm}\" was never declared optional"));
        }
    }
    Ok(())
}

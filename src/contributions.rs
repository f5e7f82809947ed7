//! Contribution descriptors and their validation.
//!
//! Everything a plugin can extend into the editor — commands, transforms,
//! exporters, importers, status badges, inline-annotation providers, UI
//! controls and UI panels — is described by one of the structs here. The
//! same types serve manifest declarations and runtime `register-<kind>`
//! messages; the validator bounds-checks both.

use serde::{Deserialize, Serialize};

/// Maximum blocks in one panel content list.
pub const MAX_PANEL_BLOCKS: usize = 256;

/// Maximum buttons in one `actions` block.
pub const MAX_ACTIONS_PER_BLOCK: usize = 64;

/// Maximum length of a local identifier.
pub const MAX_LOCAL_ID_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

lazy_static::lazy_static! {
    static ref LOCAL_ID_RE: regex::Regex = regex::Regex::new(r"^[A-Za-z0-9._-]+$").unwrap();
}

/// A local identifier: `[A-Za-z0-9._-]+`, at most 64 characters. The
/// pattern excludes `:`, which keeps composite ids unambiguous.
pub fn is_valid_local_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_LOCAL_ID_LEN && LOCAL_ID_RE.is_match(id)
}

/// Build the host-side canonical id for a contribution.
pub fn composite_id(plugin_id: &str, local_id: &str) -> String {
    format!("{plugin_id}:{local_id}")
}

/// Split a composite id back into `(plugin_id, local_id)`. Neither half may
/// contain `:`, so the first separator is the only one.
pub fn split_composite_id(id: &str) -> Option<(&str, &str)> {
    let (plugin_id, local_id) = id.split_once(':')?;
    if plugin_id.is_empty() || local_id.is_empty() {
        return None;
    }
    Some((plugin_id, local_id))
}

/// A local id, or a composite id whose local half is valid.
fn is_valid_id_ref(id: &str) -> bool {
    match split_composite_id(id) {
        Some((_, local_id)) => is_valid_local_id(local_id),
        None => is_valid_local_id(id),
    }
}

// ---------------------------------------------------------------------------
// Contribution kinds
// ---------------------------------------------------------------------------

/// The closed set of contribution kinds a manifest can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContributionKind {
    Command,
    Transform,
    Exporter,
    Importer,
    StatusBadge,
    InlineAnnotations,
    UiControl,
    UiPanel,
}

impl ContributionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionKind::Command => "command",
            ContributionKind::Transform => "transform",
            ContributionKind::Exporter => "exporter",
            ContributionKind::Importer => "importer",
            ContributionKind::StatusBadge => "status-badge",
            ContributionKind::InlineAnnotations => "inline-annotations",
            ContributionKind::UiControl => "ui-control",
            ContributionKind::UiPanel => "ui-panel",
        }
    }

    /// Prefix of the activation event that targets this kind,
    /// e.g. `onCommand` for `onCommand:<local-id>`.
    pub fn activation_prefix(&self) -> &'static str {
        match self {
            ContributionKind::Command => "onCommand",
            ContributionKind::Transform => "onTransform",
            ContributionKind::Exporter => "onExporter",
            ContributionKind::Importer => "onImporter",
            ContributionKind::StatusBadge => "onStatusBadge",
            ContributionKind::InlineAnnotations => "onInlineAnnotations",
            ContributionKind::UiControl => "onUIControl",
            ContributionKind::UiPanel => "onUIPanel",
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDescriptor {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformHook {
    #[serde(rename = "post-open")]
    PostOpen,
    #[serde(rename = "pre-save")]
    PreSave,
    #[serde(rename = "pre-export")]
    PreExport,
}

impl TransformHook {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformHook::PostOpen => "post-open",
            TransformHook::PreSave => "pre-save",
            TransformHook::PreExport => "pre-export",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformDescriptor {
    pub id: String,
    pub hook: TransformHook,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterDescriptor {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImporterDescriptor {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBadgeDescriptor {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationProviderDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiMount {
    #[serde(rename = "top-bar")]
    TopBar,
    #[serde(rename = "bottom-bar")]
    BottomBar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiControlKind {
    Button,
    Toggle,
    Dropdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiControlDescriptor {
    pub id: String,
    pub mount: UiMount,
    pub kind: UiControlKind,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Default action, overridable by the trigger handler's return value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<UiAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiPanelDescriptor {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub priority: i64,
    /// Declared default content, used when the plugin does not render.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<PanelBlock>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

// ---------------------------------------------------------------------------
// Panel content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PanelBlock {
    #[serde(rename = "heading")]
    Heading { text: String },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "divider")]
    Divider,

    #[serde(rename = "input", rename_all = "camelCase")]
    Input {
        field_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default)]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },

    #[serde(rename = "textarea", rename_all = "camelCase")]
    Textarea {
        field_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default)]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u32>,
    },

    #[serde(rename = "actions")]
    Actions { actions: Vec<PanelActionItem> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelActionItem {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<UiAction>,
}

// ---------------------------------------------------------------------------
// UI actions
// ---------------------------------------------------------------------------

/// What a control trigger or panel action asks the editor to do. The
/// discriminant set is closed; serde rejects anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiAction {
    #[serde(rename = "command", rename_all = "camelCase")]
    Command { command_id: String },

    #[serde(rename = "panel:open", rename_all = "camelCase")]
    PanelOpen { panel_id: String },

    #[serde(rename = "panel:close", rename_all = "camelCase")]
    PanelClose { panel_id: String },

    #[serde(rename = "panel:toggle", rename_all = "camelCase")]
    PanelToggle { panel_id: String },

    #[serde(rename = "editor:set-element", rename_all = "camelCase")]
    SetElement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element_type: Option<String>,
    },

    #[serde(rename = "editor:cycle-element", rename_all = "camelCase")]
    CycleElement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<i64>,
    },

    #[serde(rename = "editor:escape-to-action")]
    EscapeToAction,

    #[serde(rename = "editor:jump-to", rename_all = "camelCase")]
    JumpTo {
        position: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset_top: Option<f64>,
    },
}

impl UiAction {
    /// Rewrite local `commandId` / `panelId` references to composite ids.
    /// References that already carry a plugin prefix are left alone.
    pub fn normalized(self, plugin_id: &str) -> UiAction {
        let qualify = |id: String| {
            if id.contains(':') {
                id
            } else {
                composite_id(plugin_id, &id)
            }
        };
        match self {
            UiAction::Command { command_id } => UiAction::Command {
                command_id: qualify(command_id),
            },
            UiAction::PanelOpen { panel_id } => UiAction::PanelOpen {
                panel_id: qualify(panel_id),
            },
            UiAction::PanelClose { panel_id } => UiAction::PanelClose {
                panel_id: qualify(panel_id),
            },
            UiAction::PanelToggle { panel_id } => UiAction::PanelToggle {
                panel_id: qualify(panel_id),
            },
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_local_id(id: &str, what: &str) -> Result<(), String> {
    if is_valid_local_id(id) {
        Ok(())
    } else {
        Err(format!("Invalid {what} id: \"{id}\""))
    }
}

pub fn validate_action(action: &UiAction) -> Result<(), String> {
    match action {
        UiAction::Command { command_id } => {
            if !is_valid_id_ref(command_id) {
                return Err(format!("Action references invalid command id: \"{command_id}\""));
            }
        }
        UiAction::PanelOpen { panel_id }
        | UiAction::PanelClose { panel_id }
        | UiAction::PanelToggle { panel_id } => {
            if !is_valid_id_ref(panel_id) {
                return Err(format!("Action references invalid panel id: \"{panel_id}\""));
            }
        }
        UiAction::JumpTo { position, .. } => {
            if !position.is_finite() {
                return Err("editor:jump-to requires a finite position".into());
            }
        }
        UiAction::SetElement { .. } | UiAction::CycleElement { .. } | UiAction::EscapeToAction => {}
    }
    Ok(())
}

pub fn validate_panel_content(blocks: &[PanelBlock]) -> Result<(), String> {
    if blocks.len() > MAX_PANEL_BLOCKS {
        return Err(format!(
            "Panel content has {} blocks (maximum {MAX_PANEL_BLOCKS})",
            blocks.len()
        ));
    }
    for block in blocks {
        match block {
            PanelBlock::Input { field_id, .. } | PanelBlock::Textarea { field_id, .. } => {
                check_local_id(field_id, "field")?;
            }
            PanelBlock::Actions { actions } => {
                if actions.len() > MAX_ACTIONS_PER_BLOCK {
                    return Err(format!(
                        "Actions block has {} actions (maximum {MAX_ACTIONS_PER_BLOCK})",
                        actions.len()
                    ));
                }
                for item in actions {
                    check_local_id(&item.id, "action")?;
                    if let Some(action) = &item.action {
                        validate_action(action)?;
                    }
                }
            }
            PanelBlock::Heading { .. } | PanelBlock::Text { .. } | PanelBlock::Divider => {}
        }
    }
    Ok(())
}

pub fn validate_command(descriptor: &CommandDescriptor) -> Result<(), String> {
    check_local_id(&descriptor.id, "command")
}

pub fn validate_transform(descriptor: &TransformDescriptor) -> Result<(), String> {
    check_local_id(&descriptor.id, "transform")
}

pub fn validate_exporter(descriptor: &ExporterDescriptor) -> Result<(), String> {
    check_local_id(&descriptor.id, "exporter")
}

pub fn validate_importer(descriptor: &ImporterDescriptor) -> Result<(), String> {
    check_local_id(&descriptor.id, "importer")
}

pub fn validate_status_badge(descriptor: &StatusBadgeDescriptor) -> Result<(), String> {
    check_local_id(&descriptor.id, "status badge")
}

pub fn validate_annotation_provider(
    descriptor: &AnnotationProviderDescriptor,
) -> Result<(), String> {
    check_local_id(&descriptor.id, "annotation provider")
}

pub fn validate_ui_control(descriptor: &UiControlDescriptor) -> Result<(), String> {
    check_local_id(&descriptor.id, "control")?;
    if let Some(action) = &descriptor.action {
        validate_action(action)?;
    }
    Ok(())
}

pub fn validate_ui_panel(descriptor: &UiPanelDescriptor) -> Result<(), String> {
    check_local_id(&descriptor.id, "panel")?;
    if let Some(content) = &descriptor.content {
        validate_panel_content(content)?;
    }
    Ok(())
}

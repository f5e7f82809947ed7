//! Dispatchers: the host-side entry points the editor shell calls.
//!
//! Every dispatcher follows the same shape — resolve the composite id, gate
//! on the owning plugin's permissions, make sure the plugin is activated
//! for the triggering event, send one invocation into the sandbox, and
//! post-process the result. Status badges, inline annotations, and
//! transforms swallow per-plugin failures so one faulty plugin cannot block
//! unrelated UI or a save.

use crate::contributions::{
    composite_id, split_composite_id, validate_action, validate_panel_content, PanelBlock,
    TransformHook, UiAction,
};
use crate::document::{self, InlineAnnotation, RenderedAnnotation};
use crate::element_loop::{self, ElementLoopInput, LoopEvent};
use crate::error::{HostError, InvokeError};
use crate::lifecycle::{ActivationState, PluginHost};
use crate::panel_state::PanelFormState;
use crate::permissions::Permission;
use crate::rpc::InvokeMethod;
use crate::shortcuts::{normalize_shortcut, KeyChord};
use crate::when_clause::{self, WhenContext};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// A rendered status-bar badge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedBadge {
    pub id: String,
    pub plugin_id: String,
    pub text: String,
}

fn default_true() -> bool {
    true
}

/// Evaluated state of one UI control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiControlState {
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Default for UiControlState {
    fn default() -> Self {
        Self {
            visible: true,
            disabled: false,
            active: false,
            text: None,
        }
    }
}

/// Composite-id-keyed result of one UI evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct UiStateSnapshot {
    pub controls: HashMap<String, UiControlState>,
    pub panels: HashMap<String, Vec<PanelBlock>>,
}

/// Panel operations are applied by the editor shell, not the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelOp {
    Open(String),
    Close(String),
    Toggle(String),
}

#[derive(Debug, Clone, Default)]
pub struct PanelActionOutcome {
    pub content: Option<Vec<PanelBlock>>,
    pub action: Option<UiAction>,
}

fn parse_panel_content(raw: Value) -> Option<Vec<PanelBlock>> {
    let blocks = match raw {
        Value::Array(blocks) => Value::Array(blocks),
        Value::Object(mut content) => content.remove("blocks")?,
        _ => return None,
    };
    serde_json::from_value(blocks).ok()
}

impl PluginHost {
    // -- shared plumbing --

    fn metadata(&self) -> Value {
        let editor = &self.shared.editor;
        json!({
            "currentElementType": editor.current_element_type(),
            "previousElementType": editor.previous_element_type(),
            "isCurrentElementEmpty": editor.is_current_element_empty(),
            "selection": editor
                .selection_range()
                .map(|(from, to)| json!({ "from": from, "to": to })),
        })
    }

    /// Core-contributed when-clause context for one plugin.
    fn when_context(&self, plugin_id: &str) -> WhenContext {
        let editor = &self.shared.editor;
        let mut ctx = WhenContext::new();
        ctx.set("editor.hasSelection", editor.selection_range().is_some());
        ctx.set("editor.isCurrentEmpty", editor.is_current_element_empty());
        ctx.set(
            format!("editor.element.{}", editor.current_element_type()),
            true,
        );
        let enabled = self
            .shared
            .installed_plugin(plugin_id)
            .map(|p| p.enabled)
            .unwrap_or(false);
        ctx.set("plugin.enabled", enabled);
        ctx
    }

    fn split_id<'a>(&self, composite: &'a str) -> Result<(&'a str, &'a str), HostError> {
        split_composite_id(composite)
            .ok_or_else(|| HostError::UnknownContribution(composite.to_string()))
    }

    async fn invoke_plugin(
        &self,
        plugin_id: &str,
        method: InvokeMethod,
        target: &str,
        payload: Value,
    ) -> Result<Value, HostError> {
        let Some(session) = self.shared.session(plugin_id) else {
            return Err(InvokeError::SessionGone(plugin_id.to_string()).into());
        };
        session
            .invoke(method, target, payload, self.shared.config.invoke_timeout())
            .await
            .map_err(HostError::from)
    }

    fn require_permission(&self, plugin_id: &str, perm: Permission) -> Result<(), HostError> {
        let holds = self
            .shared
            .installed_plugin(plugin_id)
            .map(|p| p.holds(perm))
            .unwrap_or(false);
        if holds {
            Ok(())
        } else {
            Err(HostError::PermissionDenied(perm.to_string()))
        }
    }

    // -- commands --

    /// Execute a command by composite id.
    pub async fn execute_command(&self, composite: &str) -> Result<Value, HostError> {
        let (plugin_id, local_id) = self.split_id(composite)?;
        if self.shared.registry.command(composite).is_none() {
            return Err(HostError::UnknownContribution(composite.to_string()));
        }
        self.require_permission(plugin_id, Permission::DocumentRead)?;
        self.shared
            .ensure_activated(plugin_id, &format!("onCommand:{local_id}"))
            .await?;
        let payload = json!({
            "document": self.shared.editor.get_document(),
            "metadata": self.metadata(),
        });
        self.invoke_plugin(plugin_id, InvokeMethod::Command, local_id, payload)
            .await
    }

    /// Route a keyboard event to the first command whose declared shortcut
    /// matches. `Ok(Some(_))` means the event was consumed.
    pub async fn dispatch_shortcut(&self, chord: &KeyChord) -> Result<Option<Value>, HostError> {
        let Some(canonical) = chord.canonical() else {
            return Ok(None);
        };
        let hit = self.shared.registry.commands().into_iter().find(|row| {
            row.descriptor
                .shortcut
                .as_deref()
                .and_then(normalize_shortcut)
                .as_deref()
                == Some(canonical.as_str())
        });
        match hit {
            Some(row) => self.execute_command(&row.composite_id).await.map(Some),
            None => Ok(None),
        }
    }

    // -- transforms --

    /// Fold the document through every transform registered for `hook`,
    /// priority descending. A transform failure is logged and skipped; the
    /// pipeline never fails the surrounding save or export.
    pub async fn run_transforms(&self, hook: TransformHook, document: Value) -> Value {
        let mut current = document;
        let event = format!("onTransform:{}", hook.as_str());
        for row in self.shared.registry.transforms_for_hook(hook) {
            let Some((plugin_id, local_id)) = split_composite_id(&row.composite_id) else {
                continue;
            };
            if let Err(e) = self.shared.ensure_activated(plugin_id, &event).await {
                tracing::warn!(plugin = plugin_id, transform = local_id, "Skipping transform: {e}");
                continue;
            }
            let payload = json!({
                "hook": hook.as_str(),
                "document": current.clone(),
                "metadata": self.metadata(),
            });
            match self
                .invoke_plugin(plugin_id, InvokeMethod::Transform, local_id, payload)
                .await
            {
                Ok(result) if document::is_document_tree(&result) => current = result,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(plugin = plugin_id, transform = local_id, "Transform failed: {e}");
                }
            }
        }
        current
    }

    // -- exporters / importers --

    /// Run an exporter and return the produced bytes. Text returns are
    /// UTF-8 encoded; numeric arrays are converted byte by byte.
    pub async fn run_exporter(&self, composite: &str) -> Result<Vec<u8>, HostError> {
        let (plugin_id, local_id) = self.split_id(composite)?;
        if self.shared.registry.exporter(composite).is_none() {
            return Err(HostError::UnknownContribution(composite.to_string()));
        }
        self.shared
            .ensure_activated(plugin_id, &format!("onExporter:{local_id}"))
            .await?;
        let payload = json!({
            "document": self.shared.editor.get_document(),
            "metadata": self.metadata(),
        });
        let result = self
            .invoke_plugin(plugin_id, InvokeMethod::Exporter, local_id, payload)
            .await?;
        match result {
            Value::String(text) => Ok(text.into_bytes()),
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    item.as_u64()
                        .filter(|n| *n <= 255)
                        .map(|n| n as u8)
                        .ok_or_else(|| {
                            HostError::Validation("Exporter returned a non-byte value".into())
                        })
                })
                .collect(),
            _ => Err(HostError::Validation(
                "Exporter must return text or bytes".into(),
            )),
        }
    }

    /// Run an importer over file text; the returned tree replaces the
    /// document.
    pub async fn run_importer(&self, composite: &str, text: &str) -> Result<(), HostError> {
        let (plugin_id, local_id) = self.split_id(composite)?;
        if self.shared.registry.importer(composite).is_none() {
            return Err(HostError::UnknownContribution(composite.to_string()));
        }
        self.shared
            .ensure_activated(plugin_id, &format!("onImporter:{local_id}"))
            .await?;
        let payload = json!({ "text": text, "metadata": self.metadata() });
        let result = self
            .invoke_plugin(plugin_id, InvokeMethod::Importer, local_id, payload)
            .await?;
        if !document::is_document_tree(&result) {
            return Err(HostError::Validation(
                "Importer must return a document tree".into(),
            ));
        }
        self.shared
            .editor
            .replace_document(result)
            .map_err(HostError::Shell)
    }

    // -- status badges --

    /// Evaluate every status badge in priority order. Empty and failing
    /// badges are discarded.
    pub async fn status_badges(&self) -> Vec<RenderedBadge> {
        let document = self.shared.editor.get_document();
        let metadata = self.metadata();
        let mut badges = Vec::new();
        for row in self.shared.registry.status_badges() {
            let Some((plugin_id, local_id)) = split_composite_id(&row.composite_id) else {
                continue;
            };
            let event = format!("onStatusBadge:{local_id}");
            if let Err(e) = self.shared.ensure_activated(plugin_id, &event).await {
                tracing::debug!(plugin = plugin_id, badge = local_id, "Skipping badge: {e}");
                continue;
            }
            let payload = json!({ "document": document.clone(), "metadata": metadata.clone() });
            match self
                .invoke_plugin(plugin_id, InvokeMethod::Status, local_id, payload)
                .await
            {
                Ok(Value::String(text)) => {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        badges.push(RenderedBadge {
                            id: row.composite_id.clone(),
                            plugin_id: plugin_id.to_string(),
                            text,
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(plugin = plugin_id, badge = local_id, "Badge failed: {e}");
                }
            }
        }
        badges
    }

    // -- inline annotations --

    /// Collect annotations from every provider holding both
    /// `document:read` and `editor:annotations`, concurrently. Results are
    /// clamped to the document and capped per provider.
    pub async fn inline_annotations(&self) -> Vec<RenderedAnnotation> {
        let document = self.shared.editor.get_document();
        let doc_size = document::content_size(&document);
        let metadata = self.metadata();
        let cap = self.shared.config.annotation_cap;

        let providers: Vec<_> = self
            .shared
            .registry
            .annotation_providers()
            .into_iter()
            .filter(|row| {
                self.shared
                    .installed_plugin(&row.plugin_id)
                    .map(|p| {
                        p.holds(Permission::DocumentRead) && p.holds(Permission::EditorAnnotations)
                    })
                    .unwrap_or(false)
            })
            .collect();

        let tasks = providers.iter().map(|row| {
            let document = document.clone();
            let metadata = metadata.clone();
            async move {
                let (plugin_id, local_id) = split_composite_id(&row.composite_id)?;
                let event = format!("onInlineAnnotations:{local_id}");
                if self.shared.ensure_activated(plugin_id, &event).await.is_err() {
                    return None;
                }
                let payload = json!({ "document": document, "metadata": metadata });
                match self
                    .invoke_plugin(plugin_id, InvokeMethod::InlineAnnotations, local_id, payload)
                    .await
                {
                    Ok(Value::Array(items)) => {
                        let parsed: Vec<InlineAnnotation> = items
                            .into_iter()
                            .filter_map(|item| serde_json::from_value(item).ok())
                            .collect();
                        Some(document::clamp_annotations(
                            plugin_id,
                            row.descriptor.priority,
                            parsed,
                            doc_size,
                            cap,
                        ))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(plugin = plugin_id, "Annotation provider failed: {e}");
                        None
                    }
                }
            }
        });

        futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .flatten()
            .collect()
    }

    // -- UI state --

    /// Evaluate the requested controls and panels, one `ui-evaluate` batch
    /// per plugin with an active session. Inactive plugins render default
    /// control state and manifest-declared panel content; `when` clauses
    /// gate visibility either way.
    pub async fn evaluate_ui_state(
        &self,
        control_ids: &[String],
        panel_ids: &[String],
    ) -> UiStateSnapshot {
        let mut by_plugin: HashMap<String, (Vec<String>, Vec<String>)> = HashMap::new();
        for id in control_ids {
            if let Some((plugin_id, local_id)) = split_composite_id(id) {
                by_plugin
                    .entry(plugin_id.to_string())
                    .or_default()
                    .0
                    .push(local_id.to_string());
            }
        }
        for id in panel_ids {
            if let Some((plugin_id, local_id)) = split_composite_id(id) {
                by_plugin
                    .entry(plugin_id.to_string())
                    .or_default()
                    .1
                    .push(local_id.to_string());
            }
        }

        let editor = &self.shared.editor;
        let context = json!({
            "hasSelection": editor.selection_range().is_some(),
            "isCurrentEmpty": editor.is_current_element_empty(),
            "currentElementType": editor.current_element_type(),
        });

        let tasks = by_plugin.into_iter().map(|(plugin_id, (controls, panels))| {
            let context = context.clone();
            async move {
                if self.shared.activation_state(&plugin_id) != ActivationState::Active {
                    return (plugin_id, None, controls, panels);
                }
                let payload = json!({
                    "controlIds": controls,
                    "panelIds": panels,
                    "context": context,
                });
                let result = self
                    .invoke_plugin(&plugin_id, InvokeMethod::UiEvaluate, "", payload)
                    .await
                    .ok();
                (plugin_id, result, controls, panels)
            }
        });
        let results = futures_util::future::join_all(tasks).await;

        let mut snapshot = UiStateSnapshot::default();
        for (plugin_id, result, controls, panels) in results {
            let ctx = self.when_context(&plugin_id);

            for local_id in controls {
                let composite = composite_id(&plugin_id, &local_id);
                let mut state = result
                    .as_ref()
                    .and_then(|r| r.get("controls"))
                    .and_then(|c| c.get(&local_id))
                    .cloned()
                    .and_then(|raw| serde_json::from_value::<UiControlState>(raw).ok())
                    .unwrap_or_default();
                if let Some(row) = self.shared.registry.ui_control(&composite) {
                    if let Some(when) = &row.descriptor.when {
                        if !when_clause::evaluate(when, &ctx) {
                            state.visible = false;
                        }
                    }
                }
                snapshot.controls.insert(composite, state);
            }

            for local_id in panels {
                let composite = composite_id(&plugin_id, &local_id);
                let rendered = result
                    .as_ref()
                    .and_then(|r| r.get("panels"))
                    .and_then(|p| p.get(&local_id))
                    .cloned()
                    .and_then(parse_panel_content);
                let content = match rendered {
                    Some(blocks) => Some(blocks),
                    None => self
                        .shared
                        .registry
                        .ui_panel(&composite)
                        .and_then(|row| row.descriptor.content.clone()),
                };
                if let Some(mut blocks) = content {
                    if validate_panel_content(&blocks).is_ok() {
                        self.reconcile_panel(&composite, &mut blocks);
                        snapshot.panels.insert(composite, blocks);
                    }
                }
            }
        }
        snapshot
    }

    // -- UI trigger --

    /// Trigger a toolbar control. The handler's returned action (or the
    /// declared default) comes back normalised and validated; the caller
    /// applies it.
    pub async fn trigger_ui_control(&self, composite: &str) -> Result<Option<UiAction>, HostError> {
        let (plugin_id, local_id) = self.split_id(composite)?;
        let Some(row) = self.shared.registry.ui_control(composite) else {
            return Err(HostError::UnknownContribution(composite.to_string()));
        };
        self.require_permission(plugin_id, Permission::UiMount)?;
        self.shared
            .ensure_activated(plugin_id, &format!("onUIControl:{local_id}"))
            .await?;
        let payload = json!({
            "document": self.shared.editor.get_document(),
            "metadata": self.metadata(),
        });
        let result = self
            .invoke_plugin(plugin_id, InvokeMethod::UiControl, local_id, payload)
            .await?;

        let action = match result.get("action") {
            Some(raw) if !raw.is_null() => Some(
                serde_json::from_value::<UiAction>(raw.clone())
                    .map_err(|e| HostError::Validation(format!("Malformed action: {e}")))?,
            ),
            _ => row.descriptor.action.clone(),
        };
        match action {
            None => Ok(None),
            Some(action) => {
                let action = action.normalized(plugin_id);
                validate_action(&action).map_err(HostError::Validation)?;
                Ok(Some(action))
            }
        }
    }

    // -- panel actions --

    /// Run a panel action. New content is sanitised and reconciled against
    /// the user's in-flight form edits before it is returned.
    pub async fn panel_action(
        &self,
        composite: &str,
        action_id: &str,
        form_values: HashMap<String, String>,
    ) -> Result<PanelActionOutcome, HostError> {
        let (plugin_id, local_id) = self.split_id(composite)?;
        if self.shared.registry.ui_panel(composite).is_none() {
            return Err(HostError::UnknownContribution(composite.to_string()));
        }
        self.require_permission(plugin_id, Permission::UiMount)?;
        self.shared
            .ensure_activated(plugin_id, &format!("onUIPanel:{local_id}"))
            .await?;

        // Record the submitted values as the user's current ones before
        // any reconciliation runs.
        {
            let entry = self
                .shared
                .panel_forms
                .entry(composite.to_string())
                .or_insert_with(|| Mutex::new(PanelFormState::new()));
            let mut state = entry.lock();
            for (field_id, value) in &form_values {
                state.set_value(field_id.clone(), value.clone());
            }
        }

        let editor = &self.shared.editor;
        let payload = json!({
            "document": editor.get_document(),
            "currentElementType": editor.current_element_type(),
            "selection": editor
                .selection_range()
                .map(|(from, to)| json!({ "from": from, "to": to })),
            "metadata": self.metadata(),
            "actionId": action_id,
            "formValues": form_values,
        });
        let result = self
            .invoke_plugin(plugin_id, InvokeMethod::UiPanelAction, local_id, payload)
            .await?;

        let mut outcome = PanelActionOutcome::default();
        if let Some(raw) = result.get("content") {
            if !raw.is_null() {
                let mut blocks = parse_panel_content(raw.clone())
                    .ok_or_else(|| HostError::Validation("Malformed panel content".into()))?;
                validate_panel_content(&blocks).map_err(HostError::Validation)?;
                self.reconcile_panel(composite, &mut blocks);
                outcome.content = Some(blocks);
            }
        }
        if let Some(raw) = result.get("action") {
            if !raw.is_null() {
                let action = serde_json::from_value::<UiAction>(raw.clone())
                    .map_err(|e| HostError::Validation(format!("Malformed action: {e}")))?
                    .normalized(plugin_id);
                validate_action(&action).map_err(HostError::Validation)?;
                outcome.action = Some(action);
            }
        }
        Ok(outcome)
    }

    fn reconcile_panel(&self, composite: &str, blocks: &mut [PanelBlock]) {
        let entry = self
            .shared
            .panel_forms
            .entry(composite.to_string())
            .or_insert_with(|| Mutex::new(PanelFormState::new()));
        let mut state = entry.lock();
        state.reconcile(blocks);
    }

    /// Record a user edit in a panel field.
    pub fn set_panel_form_value(&self, panel_composite: &str, field_id: &str, value: &str) {
        let entry = self
            .shared
            .panel_forms
            .entry(panel_composite.to_string())
            .or_insert_with(|| Mutex::new(PanelFormState::new()));
        entry.lock().set_value(field_id, value);
    }

    /// Current form values for a panel, as submitted with actions.
    pub fn panel_form_values(&self, panel_composite: &str) -> HashMap<String, String> {
        self.shared
            .panel_forms
            .get(panel_composite)
            .map(|entry| entry.lock().form_values())
            .unwrap_or_default()
    }

    /// Drop form state when the editor closes a panel.
    pub fn close_panel(&self, panel_composite: &str) {
        self.shared.panel_forms.remove(panel_composite);
    }

    // -- action application --

    /// Apply a normalised action: commands route back through command
    /// execution, `editor:*` actions go straight to the editor shell, and
    /// `panel:*` operations are returned for the caller to apply.
    pub async fn apply_ui_action(&self, action: UiAction) -> Result<Option<PanelOp>, HostError> {
        let editor = &self.shared.editor;
        match action {
            UiAction::Command { command_id } => {
                self.execute_command(&command_id).await?;
                Ok(None)
            }
            UiAction::PanelOpen { panel_id } => Ok(Some(PanelOp::Open(panel_id))),
            UiAction::PanelClose { panel_id } => Ok(Some(PanelOp::Close(panel_id))),
            UiAction::PanelToggle { panel_id } => Ok(Some(PanelOp::Toggle(panel_id))),
            UiAction::SetElement { element_type } => {
                if let Some(element_type) = element_type {
                    editor.set_element_type(&element_type);
                }
                Ok(None)
            }
            UiAction::CycleElement { direction } => {
                editor.cycle_element(direction.unwrap_or(1));
                Ok(None)
            }
            UiAction::EscapeToAction => {
                editor.escape_to_action();
                Ok(None)
            }
            UiAction::JumpTo {
                position,
                offset_top,
            } => {
                editor.jump_to_position(position, offset_top);
                Ok(None)
            }
        }
    }

    // -- element loop --

    /// Resolve an element-loop event against registered providers; `None`
    /// lets the editor apply its default cycle.
    pub fn resolve_element_loop(&self, input: &ElementLoopInput) -> Option<String> {
        let providers = self.shared.registry.element_loop_providers();
        element_loop::resolve(providers.iter().map(|row| &row.descriptor), input)
            .map(String::from)
    }

    /// Convenience wrapper building the input from current editor state.
    pub fn element_loop_event(&self, event: LoopEvent) -> Option<String> {
        let editor = &self.shared.editor;
        let input = ElementLoopInput {
            event,
            current_type: editor.current_element_type(),
            previous_type: editor.previous_element_type(),
            is_current_empty: editor.is_current_element_empty(),
        };
        self.resolve_element_loop(&input)
    }
}

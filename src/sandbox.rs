//! Worker side of a sandbox session.
//!
//! Each enabled plugin runs on its own thread with an embedded rhai engine.
//! The engine has no ambient authority — no filesystem, no process, no
//! network surface — and hard resource limits; everything a plugin can do
//! it does through the `api` value handed to its `setup(api)` entry point,
//! which turns into message passing over the session channels.
//!
//! While the script blocks inside a host request (`get_document`, a
//! permission prompt), interleaved `invoke` messages are deferred and
//! replayed after the current call completes, preserving FIFO order.

use crate::rpc::{self, HostMessage, InvokeMethod};
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Map as RhaiMap, Position, Scope, AST};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Everything the worker thread needs from its spawner.
pub(crate) struct WorkerChannels {
    /// Host → worker messages.
    pub rx: Receiver<Value>,
    /// Worker → host messages.
    pub tx: UnboundedSender<Value>,
    /// Set by the host to abort a running script.
    pub cancel: Arc<AtomicBool>,
    /// Script operation budget.
    pub max_operations: u64,
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HandlerTables {
    commands: HashMap<String, FnPtr>,
    transforms: HashMap<String, FnPtr>,
    exporters: HashMap<String, FnPtr>,
    importers: HashMap<String, FnPtr>,
    status_badges: HashMap<String, FnPtr>,
    annotation_providers: HashMap<String, FnPtr>,
    control_triggers: HashMap<String, FnPtr>,
    control_visible: HashMap<String, FnPtr>,
    control_disabled: HashMap<String, FnPtr>,
    control_active: HashMap<String, FnPtr>,
    control_text: HashMap<String, FnPtr>,
    panel_actions: HashMap<String, FnPtr>,
    panel_renders: HashMap<String, FnPtr>,
}

struct WorkerShared {
    rx: Receiver<Value>,
    tx: UnboundedSender<Value>,
    tables: RefCell<HandlerTables>,
    /// Invokes that arrived while a host request was outstanding.
    deferred: RefCell<VecDeque<Value>>,
    shutting_down: Cell<bool>,
}

impl WorkerShared {
    fn send(&self, msg: Value) {
        let _ = self.tx.send(msg);
    }

    fn send_error(&self, message: impl Into<String>) {
        self.send(json!({ "type": "error", "message": message.into() }));
    }

    fn next_message(&self) -> Option<Value> {
        if let Some(raw) = self.deferred.borrow_mut().pop_front() {
            return Some(raw);
        }
        self.rx.recv().ok()
    }

    /// Issue a host request and block until its response arrives. Invokes
    /// that interleave are deferred for the main loop.
    fn host_request(&self, operation: &str, payload: Value) -> Result<Value, String> {
        if self.shutting_down.get() {
            return Err("Session is shutting down".into());
        }
        let request_id = rpc::next_request_id("worker");
        self.send(json!({
            "type": "host-request",
            "requestId": request_id,
            "operation": operation,
            "payload": payload,
        }));
        self.await_response(&request_id)
    }

    fn permission_request(&self, permission: &str) -> Result<bool, String> {
        if self.shutting_down.get() {
            return Err("Session is shutting down".into());
        }
        let request_id = rpc::next_request_id("worker");
        self.send(json!({
            "type": "permission-request",
            "requestId": request_id,
            "permission": permission,
        }));
        Ok(self.await_response(&request_id)?.as_bool().unwrap_or(false))
    }

    fn await_response(&self, request_id: &str) -> Result<Value, String> {
        loop {
            let raw = self
                .rx
                .recv()
                .map_err(|_| "Host channel closed".to_string())?;
            match rpc::parse_host_message(&raw) {
                Ok(HostMessage::Response {
                    request_id: id,
                    ok,
                    result,
                    error,
                }) if id == request_id => {
                    return if ok {
                        Ok(result)
                    } else {
                        Err(error.unwrap_or_else(|| "Unknown host error".into()))
                    };
                }
                // A response for a request whose caller already gave up.
                Ok(HostMessage::Response { .. }) => {}
                Ok(HostMessage::Invoke { .. }) => self.deferred.borrow_mut().push_back(raw),
                Ok(HostMessage::Shutdown) => {
                    self.shutting_down.set(true);
                    return Err("Session is shutting down".into());
                }
                Ok(HostMessage::Init { .. }) => {}
                // The main loop owns the decode-failure path.
                Err(_) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin API
// ---------------------------------------------------------------------------

/// The `api` value passed to `setup(api)`.
#[derive(Clone)]
pub(crate) struct PluginApi {
    shared: Rc<WorkerShared>,
}

fn api_err(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        message.into().into(),
        Position::NONE,
    ))
}

fn required_string(registration: &RhaiMap, key: &str) -> Result<String, Box<EvalAltResult>> {
    registration.get(key)
        .cloned()
        .and_then(|d| d.into_string().ok())
        .ok_or_else(|| api_err(format!("Registration requires a string \"{key}\"")))
}

fn required_fn(registration: &RhaiMap, key: &str) -> Result<FnPtr, Box<EvalAltResult>> {
    registration.get(key)
        .cloned()
        .and_then(|d| d.try_cast::<FnPtr>())
        .ok_or_else(|| api_err(format!("Registration requires a function \"{key}\"")))
}

fn optional_fn(registration: &RhaiMap, key: &str) -> Option<FnPtr> {
    registration.get(key).cloned().and_then(|d| d.try_cast::<FnPtr>())
}

/// The declarative part of a registration map: everything except the
/// callbacks, converted to JSON for the host.
fn descriptor_value(registration: &RhaiMap, callback_keys: &[&str]) -> Result<Value, Box<EvalAltResult>> {
    let mut clean = registration.clone();
    for key in callback_keys {
        clean.remove(*key);
    }
    from_dynamic::<Value>(&Dynamic::from_map(clean))
        .map_err(|e| api_err(format!("Registration is not serializable: {e}")))
}

fn dynamic_to_value(value: &Dynamic) -> Result<Value, String> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Some(blob) = value.read_lock::<rhai::Blob>() {
        return Ok(Value::Array(blob.iter().map(|b| Value::from(*b)).collect()));
    }
    from_dynamic::<Value>(value).map_err(|e| e.to_string())
}

impl PluginApi {
    fn register(
        &mut self,
        registration: &RhaiMap,
        message_type: &str,
        callbacks: &[&str],
        store: impl FnOnce(&mut HandlerTables, String),
    ) -> Result<(), Box<EvalAltResult>> {
        let id = required_string(registration, "id")?;
        let descriptor = descriptor_value(registration, callbacks)?;
        {
            let mut tables = self.shared.tables.borrow_mut();
            store(&mut *tables, id);
        }
        self.shared
            .send(json!({ "type": message_type, "descriptor": descriptor }));
        Ok(())
    }

    pub fn register_command(&mut self, registration: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let handler = required_fn(&registration, "handler")?;
        self.register(&registration, "register-command", &["handler"], |tables, id| {
            tables.commands.insert(id, handler);
        })
    }

    pub fn register_document_transform(&mut self, registration: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let handler = required_fn(&registration, "handler")?;
        self.register(&registration, "register-transform", &["handler"], |tables, id| {
            tables.transforms.insert(id, handler);
        })
    }

    pub fn register_exporter(&mut self, registration: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let handler = required_fn(&registration, "handler")?;
        self.register(&registration, "register-exporter", &["handler"], |tables, id| {
            tables.exporters.insert(id, handler);
        })
    }

    pub fn register_importer(&mut self, registration: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let handler = required_fn(&registration, "handler")?;
        self.register(&registration, "register-importer", &["handler"], |tables, id| {
            tables.importers.insert(id, handler);
        })
    }

    pub fn register_status_badge(&mut self, registration: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let handler = required_fn(&registration, "handler")?;
        self.register(&registration, "register-status-badge", &["handler"], |tables, id| {
            tables.status_badges.insert(id, handler);
        })
    }

    pub fn register_inline_annotation_provider(
        &mut self,
        registration: RhaiMap,
    ) -> Result<(), Box<EvalAltResult>> {
        let handler = required_fn(&registration, "handler")?;
        self.register(
            &registration,
            "register-inline-annotations",
            &["handler"],
            |tables, id| {
                tables.annotation_providers.insert(id, handler);
            },
        )
    }

    pub fn register_ui_control(&mut self, registration: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let on_trigger = optional_fn(&registration, "onTrigger");
        let is_visible = optional_fn(&registration, "isVisible");
        let is_disabled = optional_fn(&registration, "isDisabled");
        let is_active = optional_fn(&registration, "isActive");
        let get_text = optional_fn(&registration, "getText");
        self.register(
            &registration,
            "register-ui-control",
            &["onTrigger", "isVisible", "isDisabled", "isActive", "getText"],
            |tables, id| {
                if let Some(fp) = on_trigger {
                    tables.control_triggers.insert(id.clone(), fp);
                }
                if let Some(fp) = is_visible {
                    tables.control_visible.insert(id.clone(), fp);
                }
                if let Some(fp) = is_disabled {
                    tables.control_disabled.insert(id.clone(), fp);
                }
                if let Some(fp) = is_active {
                    tables.control_active.insert(id.clone(), fp);
                }
                if let Some(fp) = get_text {
                    tables.control_text.insert(id, fp);
                }
            },
        )
    }

    pub fn register_ui_panel(&mut self, registration: RhaiMap) -> Result<(), Box<EvalAltResult>> {
        let on_action = optional_fn(&registration, "onAction");
        let on_render = optional_fn(&registration, "onRender");
        self.register(
            &registration,
            "register-ui-panel",
            &["onAction", "onRender"],
            |tables, id| {
                if let Some(fp) = on_action {
                    tables.panel_actions.insert(id.clone(), fp);
                }
                if let Some(fp) = on_render {
                    tables.panel_renders.insert(id, fp);
                }
            },
        )
    }

    pub fn register_element_loop_provider(
        &mut self,
        registration: RhaiMap,
    ) -> Result<(), Box<EvalAltResult>> {
        self.register(&registration, "register-element-loop", &[], |_, _| {})
    }

    pub fn get_document(&mut self) -> Result<Dynamic, Box<EvalAltResult>> {
        let doc = self
            .shared
            .host_request("document:get", Value::Null)
            .map_err(api_err)?;
        to_dynamic(&doc)
    }

    pub fn replace_document(&mut self, document: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let value = dynamic_to_value(&document).map_err(api_err)?;
        self.shared
            .host_request("document:replace", value)
            .map_err(api_err)?;
        Ok(())
    }

    pub fn get_plugin_data(&mut self) -> Result<Dynamic, Box<EvalAltResult>> {
        let value = self
            .shared
            .host_request("document:get-plugin-data", Value::Null)
            .map_err(api_err)?;
        to_dynamic(&value)
    }

    pub fn set_plugin_data(&mut self, value: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let value = dynamic_to_value(&value).map_err(api_err)?;
        self.shared
            .host_request("document:set-plugin-data", value)
            .map_err(api_err)?;
        Ok(())
    }

    pub fn request_permission(&mut self, permission: &str) -> Result<bool, Box<EvalAltResult>> {
        self.shared.permission_request(permission).map_err(api_err)
    }

    pub fn host_call(
        &mut self,
        operation: &str,
        payload: Dynamic,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let payload = dynamic_to_value(&payload).map_err(api_err)?;
        let result = self
            .shared
            .host_request(operation, payload)
            .map_err(api_err)?;
        to_dynamic(&result)
    }
}

// ---------------------------------------------------------------------------
// Engine construction
// ---------------------------------------------------------------------------

fn build_engine(cancel: Arc<AtomicBool>, max_operations: u64) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(1024 * 1024);
    engine.set_max_array_size(64 * 1024);
    engine.set_max_map_size(64 * 1024);
    engine.on_progress(move |_| {
        if cancel.load(Ordering::Relaxed) {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
    engine
}

fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<PluginApi>("PluginApi");
    engine.register_fn("register_command", PluginApi::register_command);
    engine.register_fn(
        "register_document_transform",
        PluginApi::register_document_transform,
    );
    engine.register_fn("register_exporter", PluginApi::register_exporter);
    engine.register_fn("register_importer", PluginApi::register_importer);
    engine.register_fn("register_status_badge", PluginApi::register_status_badge);
    engine.register_fn(
        "register_inline_annotation_provider",
        PluginApi::register_inline_annotation_provider,
    );
    engine.register_fn("register_ui_control", PluginApi::register_ui_control);
    engine.register_fn("register_ui_panel", PluginApi::register_ui_panel);
    engine.register_fn(
        "register_element_loop_provider",
        PluginApi::register_element_loop_provider,
    );
    engine.register_fn("get_document", PluginApi::get_document);
    engine.register_fn("replace_document", PluginApi::replace_document);
    engine.register_fn("get_plugin_data", PluginApi::get_plugin_data);
    engine.register_fn("set_plugin_data", PluginApi::set_plugin_data);
    engine.register_fn("request_permission", PluginApi::request_permission);
    engine.register_fn("host_call", PluginApi::host_call);
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Thread body of one sandbox session. Returns when the host shuts the
/// session down, the channel closes, or the plugin faults fatally.
pub(crate) fn run_worker(channels: WorkerChannels) {
    let WorkerChannels {
        rx,
        tx,
        cancel,
        max_operations,
    } = channels;

    let shared = Rc::new(WorkerShared {
        rx,
        tx,
        tables: RefCell::new(HandlerTables::default()),
        deferred: RefCell::new(VecDeque::new()),
        shutting_down: Cell::new(false),
    });

    // The first message must be `init`.
    let raw = match shared.rx.recv() {
        Ok(raw) => raw,
        Err(_) => return,
    };
    let entry_source = match rpc::parse_host_message(&raw) {
        Ok(HostMessage::Init { entry_source, .. }) => entry_source,
        Ok(_) => {
            shared.send_error("Expected init as the first message");
            return;
        }
        Err(e) => {
            shared.send_error(e);
            return;
        }
    };

    let mut engine = build_engine(cancel, max_operations);
    register_api(&mut engine);

    let ast = match engine.compile(&entry_source) {
        Ok(ast) => ast,
        Err(e) => {
            shared.send_error(format!("Failed to compile plugin entry: {e}"));
            return;
        }
    };

    let api = PluginApi {
        shared: shared.clone(),
    };
    let mut scope = Scope::new();
    if let Err(e) = engine.call_fn::<Dynamic>(&mut scope, &ast, "setup", (api,)) {
        if !shared.shutting_down.get() {
            shared.send_error(format!("Plugin setup failed: {e}"));
        }
        return;
    }
    if shared.shutting_down.get() {
        return;
    }
    shared.send(json!({ "type": "ready" }));

    while let Some(raw) = shared.next_message() {
        match rpc::parse_host_message(&raw) {
            Err(e) => {
                shared.send_error(e);
                return;
            }
            Ok(HostMessage::Invoke {
                request_id,
                method,
                target,
                payload,
            }) => {
                handle_invoke(&engine, &ast, &shared, request_id, method, &target, payload);
            }
            Ok(HostMessage::Shutdown) => break,
            Ok(HostMessage::Init { .. }) | Ok(HostMessage::Response { .. }) => {}
        }
        if shared.shutting_down.get() {
            break;
        }
    }

    let options = rhai::CallFnOptions::new().eval_ast(false);
    if ast
        .iter_functions()
        .any(|f| f.name == "dispose" && f.params.is_empty())
    {
        let _ = engine.call_fn_with_options::<Dynamic>(options, &mut scope, &ast, "dispose", ());
    }
    *shared.tables.borrow_mut() = HandlerTables::default();
}

// ---------------------------------------------------------------------------
// Invocation dispatch
// ---------------------------------------------------------------------------

fn lookup(
    shared: &WorkerShared,
    pick: impl Fn(&HandlerTables) -> &HashMap<String, FnPtr>,
    target: &str,
) -> Option<FnPtr> {
    let tables = shared.tables.borrow();
    pick(&*tables).get(target).cloned()
}

fn call_handler(engine: &Engine, ast: &AST, fp: &FnPtr, arg: Dynamic) -> Result<Value, String> {
    let result: Dynamic = fp.call(engine, ast, (arg,)).map_err(|e| e.to_string())?;
    dynamic_to_value(&result)
}

fn handle_invoke(
    engine: &Engine,
    ast: &AST,
    shared: &Rc<WorkerShared>,
    request_id: String,
    method: InvokeMethod,
    target: &str,
    payload: Value,
) {
    let msg = match dispatch_invoke(engine, ast, shared, method, target, payload) {
        Ok(result) => json!({
            "type": "response", "requestId": request_id, "ok": true, "result": result,
        }),
        Err(error) => json!({
            "type": "response", "requestId": request_id, "ok": false, "error": error,
        }),
    };
    shared.send(msg);
}

fn dispatch_invoke(
    engine: &Engine,
    ast: &AST,
    shared: &Rc<WorkerShared>,
    method: InvokeMethod,
    target: &str,
    payload: Value,
) -> Result<Value, String> {
    let table: fn(&HandlerTables) -> &HashMap<String, FnPtr> = match method {
        InvokeMethod::Command => |t| &t.commands,
        InvokeMethod::Transform => |t| &t.transforms,
        InvokeMethod::Exporter => |t| &t.exporters,
        InvokeMethod::Importer => |t| &t.importers,
        InvokeMethod::Status => |t| &t.status_badges,
        InvokeMethod::InlineAnnotations => |t| &t.annotation_providers,
        InvokeMethod::UiControl => |t| &t.control_triggers,
        InvokeMethod::UiPanelAction => |t| &t.panel_actions,
        InvokeMethod::UiEvaluate => return ui_evaluate(engine, ast, shared, payload),
    };

    let Some(fp) = lookup(shared, table, target) else {
        // Triggers and panel actions fall back to declared behaviour.
        if matches!(method, InvokeMethod::UiControl | InvokeMethod::UiPanelAction) {
            return Ok(Value::Null);
        }
        return Err(format!("Unknown target: \"{target}\""));
    };

    let arg = to_dynamic(&payload).map_err(|e| e.to_string())?;
    call_handler(engine, ast, &fp, arg)
}

fn call_bool(
    engine: &Engine,
    ast: &AST,
    shared: &WorkerShared,
    pick: impl Fn(&HandlerTables) -> &HashMap<String, FnPtr>,
    target: &str,
    ctx: &Dynamic,
    default: bool,
) -> bool {
    match lookup(shared, pick, target) {
        Some(fp) => fp
            .call::<Dynamic>(engine, ast, (ctx.clone(),))
            .ok()
            .and_then(|d| d.as_bool().ok())
            .unwrap_or(default),
        None => default,
    }
}

/// One round trip refreshing all of a plugin's UI state: every requested
/// control's `{visible, disabled, active, text?}` and every requested
/// panel's rendered content.
fn ui_evaluate(
    engine: &Engine,
    ast: &AST,
    shared: &Rc<WorkerShared>,
    payload: Value,
) -> Result<Value, String> {
    let ids = |key: &str| -> Vec<String> {
        payload
            .get(key)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };
    let control_ids = ids("controlIds");
    let panel_ids = ids("panelIds");
    let context = payload.get("context").cloned().unwrap_or(Value::Null);
    let ctx = to_dynamic(&context).map_err(|e| e.to_string())?;

    let mut controls = serde_json::Map::new();
    for id in control_ids {
        let mut state = serde_json::Map::new();
        state.insert(
            "visible".into(),
            call_bool(engine, ast, shared, |t| &t.control_visible, &id, &ctx, true).into(),
        );
        state.insert(
            "disabled".into(),
            call_bool(engine, ast, shared, |t| &t.control_disabled, &id, &ctx, false).into(),
        );
        state.insert(
            "active".into(),
            call_bool(engine, ast, shared, |t| &t.control_active, &id, &ctx, false).into(),
        );
        if let Some(fp) = lookup(shared, |t| &t.control_text, &id) {
            if let Ok(Value::String(text)) = call_handler(engine, ast, &fp, ctx.clone()) {
                state.insert("text".into(), text.into());
            }
        }
        controls.insert(id, state.into());
    }

    let mut panels = serde_json::Map::new();
    for id in panel_ids {
        let Some(fp) = lookup(shared, |t| &t.panel_renders, &id) else {
            continue;
        };
        match call_handler(engine, ast, &fp, ctx.clone()) {
            Ok(Value::Array(blocks)) => {
                panels.insert(id, json!({ "blocks": blocks }));
            }
            Ok(content @ Value::Object(_)) => {
                panels.insert(id, content);
            }
            // A render failure yields no content; the host falls back to
            // the manifest-declared blocks.
            Ok(_) | Err(_) => {}
        }
    }

    Ok(json!({ "controls": controls, "panels": panels }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Run a worker to completion on the current thread with a scripted
    /// message sequence, returning everything it sent.
    fn run_scripted(entry_source: &str, messages: Vec<Value>) -> Vec<Value> {
        let (host_tx, worker_rx) = std::sync::mpsc::channel::<Value>();
        let (worker_tx, mut host_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();

        host_tx
            .send(json!({
                "type": "init",
                "pluginId": "com.test",
                "manifest": {
                    "id": "com.test", "name": "Test", "version": "1.0.0", "entry": "main.rhai"
                },
                "entrySource": entry_source,
            }))
            .unwrap();
        for msg in messages {
            host_tx.send(msg).unwrap();
        }
        host_tx.send(json!({ "type": "shutdown" })).unwrap();

        run_worker(WorkerChannels {
            rx: worker_rx,
            tx: worker_tx,
            cancel: Arc::new(AtomicBool::new(false)),
            max_operations: 1_000_000,
        });

        let mut out = Vec::new();
        while let Ok(msg) = host_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn invoke(id: &str, method: &str, target: &str, payload: Value) -> Value {
        json!({
            "type": "invoke", "requestId": id, "method": method,
            "target": target, "payload": payload,
        })
    }

    fn response_for<'a>(out: &'a [Value], id: &str) -> &'a Value {
        out.iter()
            .find(|m| m["type"] == "response" && m["requestId"] == id)
            .unwrap_or_else(|| panic!("no response for {id} in {out:?}"))
    }

    // -- startup --

    #[test]
    fn setup_registers_and_becomes_ready() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_command(#{
                    id: "format", title: "Format", shortcut: "Mod+Shift+K",
                    handler: |ctx| "done",
                });
            }
            "#,
            vec![],
        );
        assert_eq!(out[0]["type"], "register-command");
        assert_eq!(out[0]["descriptor"]["id"], "format");
        assert_eq!(out[0]["descriptor"]["shortcut"], "Mod+Shift+K");
        assert!(out[0]["descriptor"].get("handler").is_none());
        assert_eq!(out[1]["type"], "ready");
    }

    #[test]
    fn compile_failure_reports_error() {
        let out = run_scripted("fn setup(api) { this is not rhai", vec![]);
        assert_eq!(out[0]["type"], "error");
        assert!(out[0]["message"]
            .as_str()
            .unwrap()
            .contains("Failed to compile"));
    }

    #[test]
    fn setup_throw_reports_error_and_never_ready() {
        let out = run_scripted(r#"fn setup(api) { throw "boom"; }"#, vec![]);
        assert_eq!(out[0]["type"], "error");
        assert!(!out.iter().any(|m| m["type"] == "ready"));
    }

    #[test]
    fn missing_setup_reports_error() {
        let out = run_scripted("fn not_setup(api) {}", vec![]);
        assert_eq!(out[0]["type"], "error");
    }

    // -- invocation --

    #[test]
    fn command_handler_receives_payload_and_returns_value() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_command(#{
                    id: "echo", title: "Echo",
                    handler: |ctx| ctx.document.type,
                });
            }
            "#,
            vec![invoke(
                "host-echo",
                "command",
                "echo",
                json!({ "document": { "type": "doc", "content": [] }, "metadata": {} }),
            )],
        );
        let response = response_for(&out, "host-echo");
        assert_eq!(response["ok"], true);
        assert_eq!(response["result"], "doc");
    }

    #[test]
    fn handler_throw_becomes_ok_false() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_command(#{ id: "bad", title: "Bad", handler: |ctx| { throw "nope"; } });
            }
            "#,
            vec![invoke("host-bad", "command", "bad", json!({}))],
        );
        let response = response_for(&out, "host-bad");
        assert_eq!(response["ok"], false);
        assert!(response["error"].as_str().unwrap().contains("nope"));
    }

    #[test]
    fn unknown_target_is_an_invocation_error() {
        let out = run_scripted(
            "fn setup(api) {}",
            vec![invoke("host-x", "command", "missing", json!({}))],
        );
        let response = response_for(&out, "host-x");
        assert_eq!(response["ok"], false);
        assert!(response["error"].as_str().unwrap().contains("missing"));
    }

    #[test]
    fn exporter_may_return_a_blob() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_exporter(#{
                    id: "pdf", title: "PDF", extension: "pdf",
                    handler: |ctx| {
                        let b = blob(3);
                        b[0] = 80; b[1] = 68; b[2] = 70;
                        b
                    },
                });
            }
            "#,
            vec![invoke("host-exp", "exporter", "pdf", json!({}))],
        );
        let response = response_for(&out, "host-exp");
        assert_eq!(response["ok"], true);
        assert_eq!(response["result"], json!([80, 68, 70]));
    }

    // -- ui-evaluate --

    #[test]
    fn ui_evaluate_defaults_when_no_handlers_registered() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_ui_control(#{
                    id: "zoom", mount: "top-bar", kind: "button", label: "Zoom",
                });
            }
            "#,
            vec![invoke(
                "host-eval",
                "ui-evaluate",
                "",
                json!({ "controlIds": ["zoom"], "panelIds": [], "context": {} }),
            )],
        );
        let response = response_for(&out, "host-eval");
        let state = &response["result"]["controls"]["zoom"];
        assert_eq!(state["visible"], true);
        assert_eq!(state["disabled"], false);
        assert_eq!(state["active"], false);
        assert!(state.get("text").is_none());
    }

    #[test]
    fn ui_evaluate_batches_controls_and_panels() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_ui_control(#{
                    id: "zoom", mount: "top-bar", kind: "toggle", label: "Zoom",
                    isVisible: |ctx| ctx.hasSelection,
                    isActive: |ctx| true,
                });
                api.register_ui_panel(#{
                    id: "outline", title: "Outline",
                    onRender: |ctx| [ #{ type: "heading", text: "Scenes" } ],
                });
            }
            "#,
            vec![invoke(
                "host-eval",
                "ui-evaluate",
                "",
                json!({
                    "controlIds": ["zoom"],
                    "panelIds": ["outline"],
                    "context": { "hasSelection": false },
                }),
            )],
        );
        let response = response_for(&out, "host-eval");
        let state = &response["result"]["controls"]["zoom"];
        assert_eq!(state["visible"], false);
        assert_eq!(state["active"], true);
        let content = &response["result"]["panels"]["outline"];
        assert_eq!(content["blocks"][0]["type"], "heading");
    }

    #[test]
    fn panel_without_renderer_is_omitted_from_evaluate() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_ui_panel(#{ id: "outline", title: "Outline" });
            }
            "#,
            vec![invoke(
                "host-eval",
                "ui-evaluate",
                "",
                json!({ "controlIds": [], "panelIds": ["outline"], "context": {} }),
            )],
        );
        let response = response_for(&out, "host-eval");
        assert!(response["result"]["panels"].get("outline").is_none());
    }

    // -- trigger fallback --

    #[test]
    fn trigger_without_handler_returns_null() {
        let out = run_scripted(
            r#"
            fn setup(api) {
                api.register_ui_control(#{
                    id: "zoom", mount: "top-bar", kind: "button", label: "Zoom",
                    action: #{ type: "panel:toggle", panelId: "outline" },
                });
            }
            "#,
            vec![invoke("host-trig", "ui-control", "zoom", json!({}))],
        );
        let response = response_for(&out, "host-trig");
        assert_eq!(response["ok"], true);
        assert!(response["result"].is_null());
    }

    // -- shutdown --

    #[test]
    fn dispose_runs_on_shutdown() {
        // dispose() exists and must not break the orderly exit.
        let out = run_scripted(
            r#"
            fn setup(api) {}
            fn dispose() {}
            "#,
            vec![],
        );
        assert_eq!(out.last().unwrap()["type"], "ready");
    }

    #[test]
    fn undecodable_host_message_reports_error_and_exits() {
        let out = run_scripted(
            "fn setup(api) {}",
            vec![json!({ "type": "self-destruct" })],
        );
        assert_eq!(out.last().unwrap()["type"], "error");
    }
}

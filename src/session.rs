//! Host side of a sandbox session.
//!
//! A [`SessionHandle`] owns the channel into one worker thread, the pending
//! request table, and the ready/shutdown flags. A tokio pump task drains
//! the worker's outbound messages: registrations go to the registry, host
//! requests to the host adapter, responses to their pending slots. Any
//! undecodable message or worker `error` invokes the crash policy.

use crate::error::InvokeError;
use crate::host_ops;
use crate::lifecycle::HostShared;
use crate::manifest::InstalledPlugin;
use crate::registry::RegistrationKind;
use crate::rpc::{self, HostMessage, InvokeMethod, WorkerMessage};
use crate::sandbox::{self, WorkerChannels};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub(crate) struct SessionHandle {
    pub plugin_id: String,
    /// Host → worker channel. The worker blocks on the other end.
    tx: std::sync::mpsc::Sender<Value>,
    /// In-flight host → worker invocations, keyed by request id.
    pending: DashMap<String, oneshot::Sender<Result<Value, InvokeError>>>,
    pub ready: AtomicBool,
    pub shutting_down: AtomicBool,
    /// Aborts the worker's running script.
    cancel: Arc<AtomicBool>,
    /// Resolved once, by `ready` or by the crash path.
    ready_tx: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
}

impl SessionHandle {
    fn send_raw(&self, msg: &HostMessage) -> Result<(), InvokeError> {
        let raw = serde_json::to_value(msg)
            .map_err(|e| InvokeError::Handler(format!("Unencodable host message: {e}")))?;
        self.tx
            .send(raw)
            .map_err(|_| InvokeError::SessionGone(self.plugin_id.clone()))
    }

    /// Dispatch one invocation and await its response. On timeout the
    /// pending slot is removed and a late result is discarded on arrival;
    /// the worker is not terminated.
    pub(crate) async fn invoke(
        &self,
        method: InvokeMethod,
        target: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(InvokeError::SessionGone(self.plugin_id.clone()));
        }
        let request_id = rpc::next_request_id("host");
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        if let Err(e) = self.send_raw(&HostMessage::Invoke {
            request_id: request_id.clone(),
            method,
            target: target.to_string(),
            payload,
        }) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.remove(&request_id);
                Err(InvokeError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(InvokeError::Crashed("Session closed".into())),
            Ok(Ok(outcome)) => outcome,
        }
    }

    pub(crate) fn respond_to_worker(&self, request_id: &str, result: Result<Value, String>) {
        let msg = match result {
            Ok(result) => HostMessage::Response {
                request_id: request_id.to_string(),
                ok: true,
                result,
                error: None,
            },
            Err(error) => HostMessage::Response {
                request_id: request_id.to_string(),
                ok: false,
                result: Value::Null,
                error: Some(error),
            },
        };
        let _ = self.send_raw(&msg);
    }

    pub(crate) fn resolve_pending(&self, request_id: &str, result: Result<Value, InvokeError>) {
        match self.pending.remove(request_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => {
                tracing::debug!(
                    plugin = %self.plugin_id,
                    request = request_id,
                    "Discarding late response"
                );
            }
        }
    }

    pub(crate) fn reject_all_pending(&self, error: InvokeError) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    pub(crate) fn resolve_ready(&self, result: Result<(), String>) {
        if let Some(tx) = self.ready_tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    /// Hard stop: abort the running script and mark the session dead.
    pub(crate) fn terminate(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Orderly stop: earlier invokes still settle, then the worker runs
    /// `dispose()` and exits.
    pub(crate) fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.send_raw(&HostMessage::Shutdown).is_err() {
            self.reject_all_pending(InvokeError::SessionGone(self.plugin_id.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Start a worker thread and its pump task for one plugin. The returned
/// handle is live immediately; `ready_tx` resolves when the worker finishes
/// loading (or fails to).
pub(crate) fn spawn_session(
    shared: Arc<HostShared>,
    plugin: &InstalledPlugin,
    ready_tx: oneshot::Sender<Result<(), String>>,
) -> Arc<SessionHandle> {
    let (host_tx, worker_rx) = std::sync::mpsc::channel::<Value>();
    let (worker_tx, pump_rx) = mpsc::unbounded_channel::<Value>();
    let cancel = Arc::new(AtomicBool::new(false));

    let session = Arc::new(SessionHandle {
        plugin_id: plugin.id().to_string(),
        tx: host_tx,
        pending: DashMap::new(),
        ready: AtomicBool::new(false),
        shutting_down: AtomicBool::new(false),
        cancel: cancel.clone(),
        ready_tx: Mutex::new(Some(ready_tx)),
    });

    let _ = session.send_raw(&HostMessage::Init {
        plugin_id: plugin.id().to_string(),
        manifest: plugin.manifest.clone(),
        entry_source: plugin.entry_source.clone().unwrap_or_default(),
    });

    let max_operations = shared.config.max_script_operations;
    let spawned = std::thread::Builder::new()
        .name(format!("plugin-{}", plugin.id()))
        .spawn(move || {
            sandbox::run_worker(WorkerChannels {
                rx: worker_rx,
                tx: worker_tx,
                cancel,
                max_operations,
            })
        });
    if let Err(e) = spawned {
        session.resolve_ready(Err(format!("Failed to spawn worker thread: {e}")));
        return session;
    }

    tokio::spawn(pump(shared, session.clone(), pump_rx));
    session
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

fn registration_kind(msg: &WorkerMessage) -> Option<RegistrationKind> {
    match msg {
        WorkerMessage::RegisterCommand { .. } => Some(RegistrationKind::Command),
        WorkerMessage::RegisterTransform { .. } => Some(RegistrationKind::Transform),
        WorkerMessage::RegisterExporter { .. } => Some(RegistrationKind::Exporter),
        WorkerMessage::RegisterImporter { .. } => Some(RegistrationKind::Importer),
        WorkerMessage::RegisterStatusBadge { .. } => Some(RegistrationKind::StatusBadge),
        WorkerMessage::RegisterInlineAnnotations { .. } => Some(RegistrationKind::InlineAnnotations),
        WorkerMessage::RegisterUiControl { .. } => Some(RegistrationKind::UiControl),
        WorkerMessage::RegisterUiPanel { .. } => Some(RegistrationKind::UiPanel),
        WorkerMessage::RegisterElementLoop { .. } => Some(RegistrationKind::ElementLoop),
        _ => None,
    }
}

fn registration_descriptor(msg: WorkerMessage) -> Value {
    match msg {
        WorkerMessage::RegisterCommand { descriptor }
        | WorkerMessage::RegisterTransform { descriptor }
        | WorkerMessage::RegisterExporter { descriptor }
        | WorkerMessage::RegisterImporter { descriptor }
        | WorkerMessage::RegisterStatusBadge { descriptor }
        | WorkerMessage::RegisterInlineAnnotations { descriptor }
        | WorkerMessage::RegisterUiControl { descriptor }
        | WorkerMessage::RegisterUiPanel { descriptor }
        | WorkerMessage::RegisterElementLoop { descriptor } => descriptor,
        _ => Value::Null,
    }
}

/// Drain one session's worker → host messages until the channel closes or
/// the session crashes.
async fn pump(
    shared: Arc<HostShared>,
    session: Arc<SessionHandle>,
    mut rx: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(raw) = rx.recv().await {
        let orderly = session.shutting_down.load(Ordering::SeqCst);
        let msg = match rpc::parse_worker_message(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                // Nothing arriving after an orderly shutdown counts as a
                // crash; responses still settle above this point.
                if orderly {
                    return;
                }
                shared.report_crash(&session, e).await;
                return;
            }
        };

        if let Some(kind) = registration_kind(&msg) {
            let descriptor = registration_descriptor(msg);
            let outcome = match shared.installed_plugin(&session.plugin_id) {
                Some(plugin) => shared.registry.apply_registration(&plugin, kind, descriptor),
                None => Err(format!("Unknown plugin: \"{}\"", session.plugin_id)),
            };
            if let Err(e) = outcome {
                shared
                    .report_crash(&session, format!("Validation error: {e}"))
                    .await;
                return;
            }
            continue;
        }

        match msg {
            WorkerMessage::Ready => {
                session.ready.store(true, Ordering::SeqCst);
                session.resolve_ready(Ok(()));
            }
            WorkerMessage::Error { message } => {
                if orderly {
                    return;
                }
                shared.report_crash(&session, message).await;
                return;
            }
            WorkerMessage::HostRequest {
                request_id,
                operation,
                payload,
            } => {
                let result =
                    host_ops::handle_host_request(&shared, &session.plugin_id, &operation, payload)
                        .await;
                session.respond_to_worker(&request_id, result);
            }
            WorkerMessage::PermissionRequest {
                request_id,
                permission,
            } => {
                let granted =
                    host_ops::handle_permission_request(&shared, &session.plugin_id, &permission)
                        .await;
                session.respond_to_worker(&request_id, Ok(Value::Bool(granted)));
            }
            WorkerMessage::Response {
                request_id,
                ok,
                result,
                error,
            } => {
                let outcome = if ok {
                    Ok(result)
                } else {
                    Err(InvokeError::Handler(
                        error.unwrap_or_else(|| "Unknown error".into()),
                    ))
                };
                session.resolve_pending(&request_id, outcome);
            }
            // Registrations were handled above.
            _ => {}
        }
    }

    // Channel closed. An orderly shutdown set the flag first; anything else
    // means the worker died without a word.
    if !session.shutting_down.load(Ordering::SeqCst) {
        shared
            .report_crash(&session, "Worker exited unexpectedly".into())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_session() -> (Arc<SessionHandle>, std::sync::mpsc::Receiver<Value>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let session = Arc::new(SessionHandle {
            plugin_id: "com.test".into(),
            tx,
            pending: DashMap::new(),
            ready: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
            ready_tx: Mutex::new(None),
        });
        (session, rx)
    }

    #[tokio::test]
    async fn invoke_times_out_without_killing_the_session() {
        let (session, _rx) = detached_session();
        let result = session
            .invoke(
                InvokeMethod::Command,
                "noop",
                Value::Null,
                Duration::from_millis(30),
            )
            .await;
        assert!(matches!(result, Err(InvokeError::Timeout { .. })));
        assert!(!session.shutting_down.load(Ordering::SeqCst));
        assert!(session.pending.is_empty());
    }

    #[tokio::test]
    async fn late_response_is_discarded_silently() {
        let (session, _rx) = detached_session();
        let _ = session
            .invoke(
                InvokeMethod::Command,
                "noop",
                Value::Null,
                Duration::from_millis(10),
            )
            .await;
        // The slot is gone; resolving again must be a no-op.
        session.resolve_pending("host-unknown", Ok(Value::Null));
    }

    #[tokio::test]
    async fn crash_rejects_every_pending_request() {
        let (session, _rx) = detached_session();
        let s = session.clone();
        let fut = tokio::spawn(async move {
            s.invoke(
                InvokeMethod::Command,
                "noop",
                Value::Null,
                Duration::from_secs(5),
            )
            .await
        });
        // Give the invoke a moment to park in the pending table.
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.reject_all_pending(InvokeError::Crashed("boom".into()));
        let result = fut.await.unwrap();
        assert!(matches!(result, Err(InvokeError::Crashed(_))));
    }

    #[tokio::test]
    async fn invoke_after_shutdown_fails_fast() {
        let (session, _rx) = detached_session();
        session.shutdown();
        let result = session
            .invoke(
                InvokeMethod::Command,
                "noop",
                Value::Null,
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(InvokeError::SessionGone(_))));
    }
}

//! Scriptline plugin host.
//!
//! An in-process host for third-party screenplay-editor plugins. Each
//! enabled plugin runs in its own sandbox (an embedded script engine on a
//! dedicated thread, no ambient authority), declares everything it
//! contributes in a manifest, and talks to the editor exclusively through
//! typed messages mediated by a capability model.
//!
//! The two external collaborators — the OS shell (install store, dialogs,
//! native calls) and the rich-text editor (document tree, selection) — are
//! consumed through the [`shell::HostShell`] and [`shell::EditorShell`]
//! traits and never implemented here.

pub mod config;
pub mod contributions;
pub mod dispatch;
pub mod document;
pub mod element_loop;
pub mod error;
pub mod lifecycle;
pub mod manifest;
pub mod panel_state;
pub mod permissions;
pub mod registry;
pub mod rpc;
pub mod shell;
pub mod shortcuts;
pub mod when_clause;

mod host_ops;
mod sandbox;
mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::HostConfig;
pub use contributions::{
    ContributionKind, PanelBlock, TransformHook, UiAction, UiControlKind, UiMount,
};
pub use dispatch::{PanelActionOutcome, PanelOp, RenderedBadge, UiControlState, UiStateSnapshot};
pub use document::{AnnotationKind, InlineAnnotation, RenderedAnnotation};
pub use element_loop::{ElementLoopInput, ElementLoopProvider, ElementLoopRule, LoopEvent};
pub use error::{ActivationError, HostError, InvokeError};
pub use lifecycle::{ActivationState, PluginHost};
pub use manifest::{InstallSource, InstalledPlugin, PluginManifest, TrustState};
pub use permissions::Permission;
pub use shell::{EditorShell, HostShell, LockRecord, RegistryEntry};
pub use shortcuts::KeyChord;
pub use when_clause::WhenContext;

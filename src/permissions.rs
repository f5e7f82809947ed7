//! The capability model.
//!
//! Two closed permission sets: **core** permissions a manifest always
//! requires, and **optional** permissions the user grants at runtime.
//! Anything outside these sets is rejected at manifest validation, the same
//! way unknown capability strings are.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A capability a plugin can hold. The wire names are the canonical
/// `<area>:<action>` strings used in manifests and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "document:read")]
    DocumentRead,
    #[serde(rename = "document:write")]
    DocumentWrite,
    #[serde(rename = "editor:commands")]
    EditorCommands,
    #[serde(rename = "export:register")]
    ExportRegister,
    #[serde(rename = "fs:pick-read")]
    FsPickRead,
    #[serde(rename = "fs:pick-write")]
    FsPickWrite,
    #[serde(rename = "network:https")]
    NetworkHttps,
    #[serde(rename = "ui:mount")]
    UiMount,
    #[serde(rename = "editor:annotations")]
    EditorAnnotations,
}

/// Permissions a manifest may list under `permissions` (always required).
pub const CORE_PERMISSIONS: &[Permission] = &[
    Permission::DocumentRead,
    Permission::DocumentWrite,
    Permission::EditorCommands,
    Permission::ExportRegister,
];

/// Permissions a manifest may list under `optionalPermissions`
/// (user-granted, revocable).
pub const OPTIONAL_PERMISSIONS: &[Permission] = &[
    Permission::FsPickRead,
    Permission::FsPickWrite,
    Permission::NetworkHttps,
    Permission::UiMount,
    Permission::EditorAnnotations,
];

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::DocumentRead => "document:read",
            Permission::DocumentWrite => "document:write",
            Permission::EditorCommands => "editor:commands",
            Permission::ExportRegister => "export:register",
            Permission::FsPickRead => "fs:pick-read",
            Permission::FsPickWrite => "fs:pick-write",
            Permission::NetworkHttps => "network:https",
            Permission::UiMount => "ui:mount",
            Permission::EditorAnnotations => "editor:annotations",
        }
    }

    /// Parse a canonical permission string. Returns `None` for anything off
    /// the closed list.
    pub fn parse(s: &str) -> Option<Permission> {
        match s {
            "document:read" => Some(Permission::DocumentRead),
            "document:write" => Some(Permission::DocumentWrite),
            "editor:commands" => Some(Permission::EditorCommands),
            "export:register" => Some(Permission::ExportRegister),
            "fs:pick-read" => Some(Permission::FsPickRead),
            "fs:pick-write" => Some(Permission::FsPickWrite),
            "network:https" => Some(Permission::NetworkHttps),
            "ui:mount" => Some(Permission::UiMount),
            "editor:annotations" => Some(Permission::EditorAnnotations),
            _ => None,
        }
    }

    pub fn is_core(&self) -> bool {
        CORE_PERMISSIONS.contains(self)
    }

    pub fn is_optional(&self) -> bool {
        OPTIONAL_PERMISSIONS.contains(self)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

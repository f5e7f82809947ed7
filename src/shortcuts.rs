//! Keyboard shortcut canonicalisation.
//!
//! Declared shortcut strings and live keyboard events are both reduced to
//! one canonical form so comparison is a string equality: modifiers sorted
//! alphabetically (`alt`, `mod`, `shift`), then the lowercased key, joined
//! with `+`. Meta and Control both collapse to `mod`, so a plugin declaring
//! `Meta+K` fires on Ctrl+K as well.

/// A keyboard event as reported by the editor shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyChord {
    pub key: String,
    pub meta: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

impl KeyChord {
    /// Canonical form of this event, or `None` for bare-modifier keydowns.
    pub fn canonical(&self) -> Option<String> {
        let key = self.key.trim();
        if key.is_empty() || is_modifier_name(key) {
            return None;
        }
        Some(join(
            self.alt,
            self.meta || self.ctrl,
            self.shift,
            &key.to_lowercase(),
        ))
    }
}

/// Canonicalise a declared shortcut string such as `"Mod+Shift+K"`.
///
/// Returns `None` when the string has no key, more than one key, or an
/// empty segment — a malformed shortcut simply never matches.
pub fn normalize_shortcut(shortcut: &str) -> Option<String> {
    let mut alt = false;
    let mut modifier = false;
    let mut shift = false;
    let mut key: Option<String> = None;

    for part in shortcut.split('+') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        match part.to_lowercase().as_str() {
            "mod" | "cmd" | "command" | "meta" | "super" | "win" | "ctrl" | "control" => {
                modifier = true;
            }
            "alt" | "option" | "opt" => alt = true,
            "shift" => shift = true,
            other => {
                if key.is_some() {
                    return None;
                }
                key = Some(other.to_string());
            }
        }
    }

    key.map(|k| join(alt, modifier, shift, &k))
}

fn is_modifier_name(key: &str) -> bool {
    matches!(
        key.to_lowercase().as_str(),
        "meta" | "control" | "ctrl" | "alt" | "shift" | "os"
    )
}

fn join(alt: bool, modifier: bool, shift: bool, key: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(4);
    if alt {
        parts.push("alt");
    }
    if modifier {
        parts.push("mod");
    }
    if shift {
        parts.push("shift");
    }
    parts.push(key);
    parts.join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- declared shortcuts --

    #[test]
    fn modifier_order_and_case_are_normalised() {
        assert_eq!(
            normalize_shortcut("Cmd+Shift+K"),
            Some("mod+shift+k".to_string())
        );
        assert_eq!(
            normalize_shortcut("shift+mod+k"),
            Some("mod+shift+k".to_string())
        );
        assert_eq!(normalize_shortcut("Cmd+Shift+K"), normalize_shortcut("shift+mod+k"));
    }

    #[test]
    fn meta_and_control_collapse_to_mod() {
        assert_eq!(normalize_shortcut("Meta+K"), normalize_shortcut("Ctrl+K"));
        assert_eq!(normalize_shortcut("Control+K"), Some("mod+k".to_string()));
    }

    #[test]
    fn alt_sorts_before_mod_and_shift() {
        assert_eq!(
            normalize_shortcut("shift+alt+mod+p"),
            Some("alt+mod+shift+p".to_string())
        );
    }

    #[test]
    fn named_keys_are_lowercased() {
        assert_eq!(normalize_shortcut("Mod+Enter"), Some("mod+enter".to_string()));
        assert_eq!(normalize_shortcut("Escape"), Some("escape".to_string()));
    }

    #[test]
    fn malformed_shortcuts_never_match() {
        assert_eq!(normalize_shortcut(""), None);
        assert_eq!(normalize_shortcut("Mod+"), None);
        assert_eq!(normalize_shortcut("Mod+Shift"), None);
        assert_eq!(normalize_shortcut("K+J"), None);
    }

    // -- key events --

    #[test]
    fn chord_matches_declared_form() {
        let chord = KeyChord {
            key: "K".into(),
            meta: true,
            ctrl: false,
            alt: false,
            shift: true,
        };
        assert_eq!(chord.canonical(), normalize_shortcut("Mod+Shift+K"));
    }

    #[test]
    fn ctrl_chord_matches_meta_declaration() {
        let chord = KeyChord {
            key: "k".into(),
            ctrl: true,
            ..Default::default()
        };
        assert_eq!(chord.canonical(), normalize_shortcut("Meta+K"));
    }

    #[test]
    fn bare_modifier_keydown_has_no_canonical_form() {
        let chord = KeyChord {
            key: "Shift".into(),
            shift: true,
            ..Default::default()
        };
        assert_eq!(chord.canonical(), None);
    }
}

//! Panel form-value reconciliation.
//!
//! A side panel's content is server-driven: the plugin may re-render it at
//! any time while the user is typing into its fields. The rule that keeps
//! both sides sane: a field whose value still equals its last-rendered
//! value adopts the incoming default; a field the user has edited since the
//! last render keeps the user's value.
//!
//! Two maps per open panel: `values` (current, updated on user edits) and
//! `defaults` (what the last render put on screen). After every reconcile
//! the two are equal; user edits make them diverge until the next render.

use crate::contributions::PanelBlock;
use std::collections::HashMap;

/// Sanitised default length for `input` fields.
pub const DEFAULT_INPUT_MAX_LEN: usize = 200;

/// Sanitised default length for `textarea` fields.
pub const DEFAULT_TEXTAREA_MAX_LEN: usize = 4000;

pub const MIN_TEXTAREA_ROWS: u32 = 2;
pub const MAX_TEXTAREA_ROWS: u32 = 16;
const DEFAULT_TEXTAREA_ROWS: u32 = 4;

/// Strip NUL characters and truncate to `max_len` characters.
pub fn sanitize_field_value(raw: &str, max_len: usize) -> String {
    raw.chars().filter(|&c| c != '\0').take(max_len).collect()
}

/// Form state for one open panel.
#[derive(Debug, Clone, Default)]
pub struct PanelFormState {
    values: HashMap<String, String>,
    defaults: HashMap<String, String>,
}

impl PanelFormState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user edit. Called by the editor shell on every field change.
    pub fn set_value(&mut self, field_id: impl Into<String>, value: impl Into<String>) {
        self.values.insert(field_id.into(), value.into());
    }

    pub fn value(&self, field_id: &str) -> Option<&str> {
        self.values.get(field_id).map(String::as_str)
    }

    /// Current form values, as submitted with a panel action.
    pub fn form_values(&self) -> HashMap<String, String> {
        self.values.clone()
    }

    /// Fold freshly rendered content into this state. Field blocks are
    /// rewritten in place: rows clamped, defaults sanitised, and each
    /// `value` replaced by the effective value per the reconciliation rule.
    /// Fields absent from the new content are forgotten.
    pub fn reconcile(&mut self, blocks: &mut [PanelBlock]) {
        let mut next_values = HashMap::new();
        let mut next_defaults = HashMap::new();

        for block in blocks.iter_mut() {
            let (field_id, value, max_len) = match block {
                PanelBlock::Input {
                    field_id,
                    value,
                    max_length,
                    ..
                } => (
                    field_id.clone(),
                    value,
                    max_length.unwrap_or(DEFAULT_INPUT_MAX_LEN),
                ),
                PanelBlock::Textarea {
                    field_id,
                    value,
                    max_length,
                    rows,
                    ..
                } => {
                    *rows = Some(
                        rows.unwrap_or(DEFAULT_TEXTAREA_ROWS)
                            .clamp(MIN_TEXTAREA_ROWS, MAX_TEXTAREA_ROWS),
                    );
                    (
                        field_id.clone(),
                        value,
                        max_length.unwrap_or(DEFAULT_TEXTAREA_MAX_LEN),
                    )
                }
                _ => continue,
            };

            let incoming = sanitize_field_value(value, max_len);
            let previous_default = self.defaults.get(&field_id);
            let previous_value = self
                .values
                .get(&field_id)
                .map(|v| sanitize_field_value(v, max_len));

            let effective = match (previous_value, previous_default) {
                // Untouched since the last render (or never rendered):
                // the server's new default wins.
                (Some(v), Some(d)) if v == *d => incoming,
                (None, _) | (Some(_), None) => incoming,
                // Edited away from the last-rendered value: preserve it.
                (Some(v), Some(_)) => v,
            };

            *value = effective.clone();
            next_defaults.insert(field_id.clone(), effective.clone());
            next_values.insert(field_id, effective);
        }

        self.values = next_values;
        self.defaults = next_defaults;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(field_id: &str, value: &str) -> PanelBlock {
        PanelBlock::Input {
            field_id: field_id.into(),
            label: None,
            value: value.into(),
            placeholder: None,
            max_length: None,
        }
    }

    fn textarea(field_id: &str, value: &str, rows: Option<u32>) -> PanelBlock {
        PanelBlock::Textarea {
            field_id: field_id.into(),
            label: None,
            value: value.into(),
            placeholder: None,
            max_length: None,
            rows,
        }
    }

    fn block_value(block: &PanelBlock) -> &str {
        match block {
            PanelBlock::Input { value, .. } | PanelBlock::Textarea { value, .. } => value,
            _ => panic!("not a field block"),
        }
    }

    // -- sanitisation --

    #[test]
    fn sanitize_strips_nuls_and_truncates() {
        assert_eq!(sanitize_field_value("a\0b\0c", 10), "abc");
        assert_eq!(sanitize_field_value("abcdef", 3), "abc");
        assert_eq!(sanitize_field_value("héllo", 4), "héll");
    }

    #[test]
    fn rows_are_clamped() {
        let mut state = PanelFormState::new();
        let mut blocks = vec![
            textarea("a", "", Some(1)),
            textarea("b", "", Some(40)),
            textarea("c", "", None),
        ];
        state.reconcile(&mut blocks);
        let rows: Vec<_> = blocks
            .iter()
            .map(|b| match b {
                PanelBlock::Textarea { rows, .. } => rows.unwrap(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(rows, vec![2, 16, 4]);
    }

    // -- reconciliation --

    #[test]
    fn untouched_field_adopts_new_default() {
        let mut state = PanelFormState::new();
        let mut blocks = vec![input("q", "hello")];
        state.reconcile(&mut blocks);
        assert_eq!(state.value("q"), Some("hello"));

        let mut blocks = vec![input("q", "prompt")];
        state.reconcile(&mut blocks);
        assert_eq!(block_value(&blocks[0]), "prompt");
        assert_eq!(state.value("q"), Some("prompt"));
    }

    #[test]
    fn edited_field_survives_a_rerender() {
        let mut state = PanelFormState::new();
        let mut blocks = vec![input("q", "hello")];
        state.reconcile(&mut blocks);

        state.set_value("q", "world");

        let mut blocks = vec![input("q", "hello")];
        state.reconcile(&mut blocks);
        assert_eq!(block_value(&blocks[0]), "world");
        assert_eq!(state.value("q"), Some("world"));
    }

    #[test]
    fn rendered_value_becomes_the_new_baseline() {
        // An edit survives the first server echo; the kept value then
        // equals its last-rendered form, so the next changed default
        // replaces it.
        let mut state = PanelFormState::new();
        let mut blocks = vec![input("q", "hello")];
        state.reconcile(&mut blocks);

        state.set_value("q", "world");

        let mut blocks = vec![input("q", "hello")];
        state.reconcile(&mut blocks);
        assert_eq!(block_value(&blocks[0]), "world");

        let mut blocks = vec![input("q", "prompt")];
        state.reconcile(&mut blocks);
        assert_eq!(block_value(&blocks[0]), "prompt");
        assert_eq!(state.value("q"), Some("prompt"));
    }

    #[test]
    fn comparison_applies_the_same_sanitisation() {
        let mut state = PanelFormState::new();
        let mut blocks = vec![input("q", "hello")];
        state.reconcile(&mut blocks);

        // NULs in the user value are insignificant after sanitisation, so
        // this still counts as untouched.
        state.set_value("q", "hel\0lo");

        let mut blocks = vec![input("q", "fresh")];
        state.reconcile(&mut blocks);
        assert_eq!(block_value(&blocks[0]), "fresh");
    }

    #[test]
    fn fields_absent_from_new_content_are_forgotten() {
        let mut state = PanelFormState::new();
        let mut blocks = vec![input("a", "1"), input("b", "2")];
        state.reconcile(&mut blocks);
        state.set_value("a", "edited");

        let mut blocks = vec![input("b", "2")];
        state.reconcile(&mut blocks);
        assert_eq!(state.value("a"), None);

        // When "a" reappears it is a fresh field and takes the default.
        let mut blocks = vec![input("a", "fresh")];
        state.reconcile(&mut blocks);
        assert_eq!(block_value(&blocks[0]), "fresh");
    }

    #[test]
    fn defaults_are_truncated_to_max_length() {
        let mut state = PanelFormState::new();
        let long = "x".repeat(300);
        let mut blocks = vec![PanelBlock::Input {
            field_id: "q".into(),
            label: None,
            value: long,
            placeholder: None,
            max_length: None,
        }];
        state.reconcile(&mut blocks);
        assert_eq!(block_value(&blocks[0]).len(), DEFAULT_INPUT_MAX_LEN);
    }

    #[test]
    fn non_field_blocks_are_ignored() {
        let mut state = PanelFormState::new();
        let mut blocks = vec![
            PanelBlock::Heading {
                text: "Search".into(),
            },
            PanelBlock::Divider,
            input("q", "hello"),
        ];
        state.reconcile(&mut blocks);
        assert_eq!(state.value("q"), Some("hello"));
    }
}

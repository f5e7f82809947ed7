//! Element-loop resolution.
//!
//! Plugins can override the editor's default Tab / Shift-Tab / Enter /
//! Escape block-type transitions with declarative rules. Providers are
//! consulted in priority order; the first matching rule wins and lower
//! priority rules never observe the event. A `None` result lets the editor
//! apply its built-in cycle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopEvent {
    Tab,
    ShiftTab,
    Enter,
    Escape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementLoopRule {
    pub event: LoopEvent,
    /// Current block types the rule applies to; absent means any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_types: Option<Vec<String>>,
    /// Previous block types the rule applies to; absent means any. An
    /// absent previous element is matched as `""`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_current_empty: Option<bool>,
    pub next_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementLoopProvider {
    pub id: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub rules: Vec<ElementLoopRule>,
}

/// One keyboard event against the current block context.
#[derive(Debug, Clone)]
pub struct ElementLoopInput {
    pub event: LoopEvent,
    pub current_type: String,
    pub previous_type: Option<String>,
    pub is_current_empty: bool,
}

fn rule_matches(rule: &ElementLoopRule, input: &ElementLoopInput) -> bool {
    if rule.event != input.event {
        return false;
    }
    if let Some(types) = &rule.current_types {
        if !types.iter().any(|t| t == &input.current_type) {
            return false;
        }
    }
    if let Some(types) = &rule.previous_types {
        let previous = input.previous_type.as_deref().unwrap_or("");
        if !types.iter().any(|t| t == previous) {
            return false;
        }
    }
    if let Some(empty) = rule.is_current_empty {
        if empty != input.is_current_empty {
            return false;
        }
    }
    true
}

/// Resolve against providers already sorted by priority descending. Within
/// one provider, rules apply in declaration order.
pub fn resolve<'a, I>(providers: I, input: &ElementLoopInput) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a ElementLoopProvider>,
{
    for provider in providers {
        for rule in &provider.rules {
            if rule_matches(rule, input) {
                return Some(&rule.next_type);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(event: LoopEvent, next: &str) -> ElementLoopRule {
        ElementLoopRule {
            event,
            current_types: None,
            previous_types: None,
            is_current_empty: None,
            next_type: next.into(),
        }
    }

    fn provider(id: &str, priority: i64, rules: Vec<ElementLoopRule>) -> ElementLoopProvider {
        ElementLoopProvider {
            id: id.into(),
            priority,
            rules,
        }
    }

    fn input(event: LoopEvent, current: &str) -> ElementLoopInput {
        ElementLoopInput {
            event,
            current_type: current.into(),
            previous_type: None,
            is_current_empty: false,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let high = provider("a", 10, vec![rule(LoopEvent::Tab, "character")]);
        let low = provider("b", 5, vec![rule(LoopEvent::Tab, "transition")]);
        let result = resolve([&high, &low], &input(LoopEvent::Tab, "action"));
        assert_eq!(result, Some("character"));
    }

    #[test]
    fn declaration_order_breaks_ties_within_a_provider() {
        let p = provider(
            "a",
            0,
            vec![
                rule(LoopEvent::Enter, "dialogue"),
                rule(LoopEvent::Enter, "action"),
            ],
        );
        assert_eq!(resolve([&p], &input(LoopEvent::Enter, "character")), Some("dialogue"));
    }

    #[test]
    fn no_match_returns_none() {
        let p = provider("a", 0, vec![rule(LoopEvent::Tab, "character")]);
        assert_eq!(resolve([&p], &input(LoopEvent::Enter, "action")), None);
        let no_providers = std::iter::empty::<&ElementLoopProvider>();
        assert_eq!(resolve(no_providers, &input(LoopEvent::Tab, "action")), None);
    }

    #[test]
    fn current_type_filter() {
        let mut r = rule(LoopEvent::Tab, "parenthetical");
        r.current_types = Some(vec!["dialogue".into(), "character".into()]);
        let p = provider("a", 0, vec![r]);
        assert_eq!(resolve([&p], &input(LoopEvent::Tab, "dialogue")), Some("parenthetical"));
        assert_eq!(resolve([&p], &input(LoopEvent::Tab, "action")), None);
    }

    #[test]
    fn absent_previous_matches_empty_string() {
        let mut r = rule(LoopEvent::Enter, "scene-heading");
        r.previous_types = Some(vec!["".into()]);
        let p = provider("a", 0, vec![r]);

        let mut i = input(LoopEvent::Enter, "action");
        assert_eq!(resolve([&p], &i), Some("scene-heading"));

        i.previous_type = Some("dialogue".into());
        assert_eq!(resolve([&p], &i), None);
    }

    #[test]
    fn empty_flag_must_match_when_given() {
        let mut r = rule(LoopEvent::Escape, "action");
        r.is_current_empty = Some(true);
        let p = provider("a", 0, vec![r]);

        let mut i = input(LoopEvent::Escape, "character");
        assert_eq!(resolve([&p], &i), None);
        i.is_current_empty = true;
        assert_eq!(resolve([&p], &i), Some("action"));
    }
}

//! Helpers over the opaque screenplay document tree.
//!
//! The editor owns the document; plugins see it as JSON. The host never
//! interprets node semantics beyond what the protocol requires: recognising
//! a value as a document tree, measuring content size for annotation
//! clamping, and validating annotation spans.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A value counts as a document tree when it is an object with a string
/// `type` field. Transforms and importers returning anything else leave the
/// current document untouched.
pub fn is_document_tree(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .map(Value::is_string)
        .unwrap_or(false)
}

/// Size of one node: a text node counts its characters, any other node
/// counts 2 (open and close tokens) plus its children.
pub fn node_size(node: &Value) -> u64 {
    if let Some(text) = node.get("text").and_then(Value::as_str) {
        return text.chars().count() as u64;
    }
    let children = node
        .get("content")
        .and_then(Value::as_array)
        .map(|c| c.iter().map(node_size).sum::<u64>())
        .unwrap_or(0);
    2 + children
}

/// Content size of the whole document: the sum of its children's sizes.
/// Annotation positions are valid in `[1, content_size]`.
pub fn content_size(doc: &Value) -> u64 {
    doc.get("content")
        .and_then(Value::as_array)
        .map(|c| c.iter().map(node_size).sum::<u64>())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Inline annotations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationKind {
    #[serde(rename = "note")]
    Note,
    #[serde(rename = "note-active")]
    NoteActive,
}

/// One annotation as returned by a provider, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct InlineAnnotation {
    pub id: String,
    pub from: i64,
    pub to: i64,
    pub kind: AnnotationKind,
}

/// A validated annotation ready for the editor to decorate.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderedAnnotation {
    /// Composite id `"<pluginId>:<annotationId>"`.
    pub id: String,
    pub plugin_id: String,
    pub from: u64,
    pub to: u64,
    pub kind: AnnotationKind,
    pub priority: i64,
}

/// Clamp provider output against the document: positions are forced into
/// `[1, doc_size]`, non-positive spans are dropped, and at most `cap` items
/// are taken from the provider.
pub fn clamp_annotations(
    plugin_id: &str,
    priority: i64,
    items: Vec<InlineAnnotation>,
    doc_size: u64,
    cap: usize,
) -> Vec<RenderedAnnotation> {
    if doc_size == 0 {
        return Vec::new();
    }

    items
        .into_iter()
        .take(cap)
        .filter_map(|item| {
            let from = item.from.clamp(1, doc_size as i64) as u64;
            let to = item.to.clamp(1, doc_size as i64) as u64;
            if to <= from {
                return None;
            }
            Some(RenderedAnnotation {
                id: format!("{}:{}", plugin_id, item.id),
                plugin_id: plugin_id.to_string(),
                from,
                to,
                kind: item.kind,
                priority,
            })
        })
        .collect()
}

//! Extraction of the text a tool added to a document.
//!
//! Ranges reported by the tool are authoritative. Without them the added text
//! is inferred from common prefix/suffix, which can mis-attribute a
//! replacement whose new text shares characters with the deleted text at its
//! boundaries.

use inkflow_core::tools::{AppliedOp, OpKind, TextRange};

/// Text present in `new` that the edit introduced. Offsets are in characters.
pub fn extract_added(old: &str, new: &str, applied_ops: &[AppliedOp], op_ranges: &[TextRange]) -> String {
    let ranges: Vec<TextRange> = if op_ranges.is_empty() {
        applied_ops
            .iter()
            .filter(|op| matches!(op.kind, OpKind::Insert | OpKind::Replace))
            .filter_map(|op| op.range_after)
            .collect()
    } else {
        op_ranges.to_vec()
    };

    if !ranges.is_empty() {
        return slice_ranges(new, &ranges);
    }
    if !applied_ops.is_empty() && applied_ops.iter().all(|op| op.kind == OpKind::Delete) {
        return String::new();
    }
    infer_added(old, new)
}

fn slice_ranges(text: &str, ranges: &[TextRange]) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    for range in ranges {
        let start = range.start.min(chars.len());
        let end = range.end.min(chars.len());
        if start >= end {
            continue;
        }
        out.extend(&chars[start..end]);
    }
    out
}

fn infer_added(old: &str, new: &str) -> String {
    if let Some(rest) = new.strip_prefix(old) {
        return rest.to_string();
    }
    if let Some(rest) = new.strip_suffix(old) {
        return rest.to_string();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let max_common = old_chars.len().min(new_chars.len());

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_common - prefix)
        .take_while(|(a, b)| a == b)
        .count();

    new_chars[prefix..new_chars.len() - suffix].iter().collect()
}

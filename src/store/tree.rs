// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Assembly of flat span lists into trace trees.

use std::collections::HashMap;

use crate::span::Span;
use crate::types::{SpanId, TraceId};

use super::types::{SpanNode, TraceTree};

/// Build a [`TraceTree`] from the flat set of spans sharing `trace_id`.
///
/// Parent links resolve within the set; spans whose parent is absent
/// (dropped under backpressure, or still unexported) become synthetic
/// roots so a partial trace still renders. Roots and children are ordered
/// by start time.
pub fn assemble_tree(trace_id: TraceId, spans: Vec<Span>) -> TraceTree {
    let known: std::collections::HashSet<SpanId> =
        spans.iter().map(|s| s.span_id).collect();

    let mut roots: Vec<Span> = Vec::new();
    let mut children_of: HashMap<SpanId, Vec<Span>> = HashMap::new();

    for span in spans {
        match span.parent_span_id {
            Some(parent) if known.contains(&parent) && parent != span.span_id => {
                children_of.entry(parent).or_default().push(span);
            }
            // No parent, or a parent that was never recorded: root either way.
            _ => roots.push(span),
        }
    }

    let mut root_nodes: Vec<SpanNode> = roots
        .into_iter()
        .map(|span| build_node(span, &mut children_of))
        .collect();

    // Anything left in the map is unreachable from a root (parent cycles);
    // surface it rather than dropping it.
    let mut leftover_parents: Vec<SpanId> = children_of.keys().copied().collect();
    leftover_parents.sort();
    for parent in leftover_parents {
        if let Some(orphans) = children_of.remove(&parent) {
            for span in orphans {
                root_nodes.push(build_node(span, &mut children_of));
            }
        }
    }

    root_nodes.sort_by_key(|n| n.span.start_time);
    TraceTree {
        trace_id,
        roots: root_nodes,
    }
}

fn build_node(span: Span, children_of: &mut HashMap<SpanId, Vec<Span>>) -> SpanNode {
    let mut children: Vec<SpanNode> = children_of
        .remove(&span.span_id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| build_node(child, children_of))
        .collect();
    children.sort_by_key(|n| n.span.start_time);
    SpanNode { span, children }
}

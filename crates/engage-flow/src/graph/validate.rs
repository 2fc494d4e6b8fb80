use std::collections::{HashMap, HashSet};

use engage_core::error::{EngageError, Result};
use engage_core::types::Channel;

use super::edge::{NO, YES};
use super::node::NodeKind;
use super::FlowDefinition;

/// Check a definition's structure before activation.
///
/// Collects every problem rather than stopping at the first. `has_provider`
/// reports whether a channel has a configured provider, so an unknown or
/// unwired channel fails here instead of at run time.
pub fn validate(def: &FlowDefinition, has_provider: &dyn Fn(Channel) -> bool) -> Result<()> {
    let errors = collect_errors(def, has_provider);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngageError::Validation(errors.join("; ")))
    }
}

fn collect_errors(def: &FlowDefinition, has_provider: &dyn Fn(Channel) -> bool) -> Vec<String> {
    let mut errors = Vec::new();

    let mut ids = HashSet::new();
    for node in &def.nodes {
        if node.id.trim().is_empty() {
            errors.push("node with empty id".to_string());
        }
        if !ids.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    if def.node(&def.entry).is_none() {
        errors.push(format!("entry node '{}' does not exist", def.entry));
    }

    for edge in &def.edges {
        if !ids.contains(edge.from.as_str()) {
            errors.push(format!("edge from unknown node '{}'", edge.from));
        }
        if !ids.contains(edge.to.as_str()) {
            errors.push(format!("edge to unknown node '{}'", edge.to));
        }
    }

    for node in &def.nodes {
        let out: Vec<_> = def.outgoing(&node.id).collect();
        match &node.kind {
            NodeKind::Send { channel, template, .. } => {
                if out.len() != 1 || out[0].label.is_some() {
                    errors.push(format!(
                        "send node '{}' needs exactly one unlabeled outgoing edge, has {}",
                        node.id,
                        out.len()
                    ));
                }
                if template.trim().is_empty() {
                    errors.push(format!("send node '{}' has no template", node.id));
                }
                if !has_provider(*channel) {
                    errors.push(format!(
                        "send node '{}' uses channel '{}' with no configured provider",
                        node.id, channel
                    ));
                }
            }
            NodeKind::Delay { seconds } => {
                if out.len() != 1 || out[0].label.is_some() {
                    errors.push(format!(
                        "delay node '{}' needs exactly one unlabeled outgoing edge, has {}",
                        node.id,
                        out.len()
                    ));
                }
                if *seconds == 0 {
                    errors.push(format!("delay node '{}' has zero duration", node.id));
                }
            }
            NodeKind::Decision { predicate } => {
                let mut labels: Vec<&str> = out.iter().filter_map(|e| e.label.as_deref()).collect();
                labels.sort_unstable();
                if out.len() != 2 || labels != [NO, YES] {
                    errors.push(format!(
                        "decision node '{}' needs exactly one 'yes' and one 'no' edge",
                        node.id
                    ));
                }
                if let Err(e) = predicate.check() {
                    errors.push(format!("decision node '{}': {}", node.id, e));
                }
            }
            NodeKind::Exit { .. } => {
                if !out.is_empty() {
                    errors.push(format!("exit node '{}' has outgoing edges", node.id));
                }
            }
        }
    }

    if let Some(node) = find_tight_cycle(def) {
        errors.push(format!(
            "cycle through '{}' does not pass a delay node",
            node
        ));
    }

    if def.node(&def.entry).is_some() {
        let reachable = reachable_from(def, &def.entry);
        for node in &def.nodes {
            if !reachable.contains(node.id.as_str()) {
                errors.push(format!("node '{}' is unreachable from the entry", node.id));
            }
        }
    }

    errors
}

fn reachable_from<'a>(def: &'a FlowDefinition, entry: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack = vec![entry];
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(def.outgoing(id).map(|e| e.to.as_str()));
        }
    }
    seen
}

/// Find a cycle that never leaves through a delay node. Delay out-edges are
/// dropped, then any remaining back edge is a tight loop.
fn find_tight_cycle(def: &FlowDefinition) -> Option<String> {
    let delays: HashSet<&str> = def
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Delay { .. }))
        .map(|n| n.id.as_str())
        .collect();

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        if !delays.contains(edge.from.as_str()) {
            adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for start in def.nodes.iter().map(|n| n.id.as_str()) {
        if marks.contains_key(start) {
            continue;
        }
        // Iterative DFS: (node, index of next child to visit)
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::Visiting);
        while let Some((node, idx)) = stack.pop() {
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&child) = children.get(idx) {
                stack.push((node, idx + 1));
                match marks.get(child) {
                    Some(Mark::Visiting) => return Some(child.to_string()),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
            }
        }
    }
    None
}

pub mod edge;
pub mod node;
pub mod validate;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use engage_core::error::{EngageError, Result};
use engage_core::types::{FlowId, TenantId};

pub use edge::Edge;
pub use node::{ExitOutcome, Node, NodeKind};
pub use validate::validate;

/// Activation status of a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Draft => "draft",
            FlowStatus::Active => "active",
            FlowStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(FlowStatus::Draft),
            "active" => Ok(FlowStatus::Active),
            "archived" => Ok(FlowStatus::Archived),
            other => Err(EngageError::Database(format!("unknown flow status '{}'", other))),
        }
    }
}

/// A typed flow graph owned by one tenant.
///
/// Immutable once active except for archiving; edits go through
/// [`FlowDefinition::clone_as_draft`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub id: FlowId,
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(default)]
    pub status: FlowStatus,
    /// Id of the entry node.
    pub entry: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cloned_from: Option<FlowId>,
}

impl FlowDefinition {
    pub fn new(tenant_id: TenantId, name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: FlowId::new(),
            tenant_id,
            name: name.into(),
            status: FlowStatus::Draft,
            entry: entry.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            created_at: Utc::now(),
            cloned_from: None,
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Target of the edge leaving `id` with the given label. Unlabeled
    /// lookups take the single outgoing edge.
    pub fn next(&self, id: &str, label: Option<&str>) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.from == id && e.label.as_deref() == label)
            .map(|e| e.to.as_str())
    }

    /// A new draft copy with a fresh id.
    pub fn clone_as_draft(&self) -> Self {
        Self {
            id: FlowId::new(),
            status: FlowStatus::Draft,
            created_at: Utc::now(),
            cloned_from: Some(self.id.clone()),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_core::types::Channel;

    #[test]
    fn definition_json_roundtrip_keeps_graph() {
        let def = FlowDefinition::new(TenantId::from_string("t1"), "welcome", "hello")
            .with_node(Node::send("hello", Channel::Sms, "welcome", "Hi!"))
            .with_node(Node::exit("done", ExitOutcome::Success))
            .with_edge(Edge::new("hello", "done"));

        let json = serde_json::to_string(&def).unwrap();
        let parsed: FlowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, def.id);
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.next("hello", None), Some("done"));
        assert_eq!(parsed.status, FlowStatus::Draft);
    }

    #[test]
    fn clone_as_draft_links_source() {
        let mut def = FlowDefinition::new(TenantId::from_string("t1"), "f", "a");
        def.status = FlowStatus::Active;
        let copy = def.clone_as_draft();
        assert_ne!(copy.id, def.id);
        assert_eq!(copy.status, FlowStatus::Draft);
        assert_eq!(copy.cloned_from, Some(def.id.clone()));
    }

    #[test]
    fn minimal_import_fills_defaults() {
        let json = r#"{
            "tenant_id": "t1",
            "name": "imported",
            "entry": "done",
            "nodes": [{"id": "done", "type": "exit", "outcome": "success"}],
            "edges": []
        }"#;
        let def: FlowDefinition = serde_json::from_str(json).unwrap();
        assert!(!def.id.as_str().is_empty());
        assert_eq!(def.status, FlowStatus::Draft);
    }

    #[test]
    fn next_outlives_the_lookup_key() {
        let def = FlowDefinition::new(TenantId::from_string("t1"), "branch", "check")
            .with_node(Node::decision(
                "check",
                crate::predicate::Predicate::replied_within(60),
            ))
            .with_node(Node::exit("won", ExitOutcome::Success))
            .with_node(Node::exit("lost", ExitOutcome::Abandoned))
            .with_edge(Edge::yes("check", "won"))
            .with_edge(Edge::no("check", "lost"));

        let target = {
            let key = String::from("check");
            def.next(&key, Some(edge::NO))
        };
        assert_eq!(target, Some("lost"));
        assert_eq!(def.next("check", Some(edge::YES)), Some("won"));
        assert_eq!(def.next("won", None), None);
    }
}

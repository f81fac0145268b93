//! Flow document model.
//!
//! The wire shape (`FlowRecord`) is what the document service returns and
//! accepts. The in-memory [`Document`] is what the editor mutates, and the
//! [`SaveSnapshot`] is the last copy known to match the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::FlowId;

/// Node type used for nodes generated from agent tasks.
pub const TASK_NODE_TYPE: &str = "task";
/// Node type used for nodes generated from task detail steps.
pub const DETAIL_NODE_TYPE: &str = "detail";

/// Canvas coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal offset.
    pub x: f64,
    /// Vertical offset.
    pub y: f64,
}

impl Position {
    /// Shorthand constructor.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Node payload: a label plus whatever the editor stores alongside it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// Text shown on the node.
    #[serde(default)]
    pub label: String,
    /// Editor-specific fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A graph node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique within the document.
    pub id: String,
    /// Editor node type (`task`, `detail`, or any user-defined type).
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    /// Canvas position.
    #[serde(default)]
    pub position: Position,
    /// Payload.
    #[serde(default)]
    pub data: NodeData,
}

fn default_node_type() -> String {
    "default".to_string()
}

impl Node {
    /// A user node with a label.
    pub fn new(id: impl Into<String>, label: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            node_type: default_node_type(),
            position,
            data: NodeData {
                label: label.into(),
                extra: Map::new(),
            },
        }
    }

    /// Whether the node mirrors agent state and is regenerated from it.
    pub fn is_generated(&self) -> bool {
        self.node_type == TASK_NODE_TYPE || self.node_type == DETAIL_NODE_TYPE
    }
}

/// A directed edge between two nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique within the document.
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Optional edge label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    /// An unlabelled edge with the conventional `e-<source>-<target>` id.
    pub fn between(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("e-{source}-{target}"),
            source,
            target,
            label: None,
        }
    }
}

/// Graph payload of a persisted flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowData {
    /// Nodes in editor order.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Edges in editor order.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Flow as exchanged with the document service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Flow id.
    pub id: FlowId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Graph payload.
    #[serde(default)]
    pub flow_data: FlowData,
    /// Server-assigned modification time. Ignored for dirty checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// The editable document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    /// Nodes in editor order.
    pub nodes: Vec<Node>,
    /// Edges in editor order.
    pub edges: Vec<Edge>,
    /// Display name.
    pub flow_name: String,
}

impl Document {
    /// Build a document from a fetched record.
    pub fn from_record(record: &FlowRecord) -> Self {
        Self {
            nodes: record.flow_data.nodes.clone(),
            edges: record.flow_data.edges.clone(),
            flow_name: record.name.clone(),
        }
    }

    /// Wire record for saving under `id`.
    pub fn to_record(&self, id: &FlowId) -> FlowRecord {
        FlowRecord {
            id: id.clone(),
            name: self.flow_name.clone(),
            flow_data: FlowData {
                nodes: self.nodes.clone(),
                edges: self.edges.clone(),
            },
            updated_at: None,
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a node by id for mutation.
    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }
}

/// Last `{nodes, edges, flow_name}` known to match the server copy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaveSnapshot {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    flow_name: String,
}

impl SaveSnapshot {
    /// Capture the persisted fields of `doc`.
    pub fn of(doc: &Document) -> Self {
        Self {
            nodes: doc.nodes.clone(),
            edges: doc.edges.clone(),
            flow_name: doc.flow_name.clone(),
        }
    }

    /// Structural equality against the current document.
    pub fn matches(&self, doc: &Document) -> bool {
        self.nodes == doc.nodes && self.edges == doc.edges && self.flow_name == doc.flow_name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

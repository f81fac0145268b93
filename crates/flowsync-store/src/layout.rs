//! Task and detail node generation.
//!
//! Generated nodes mirror the agent's task list. Their ids are derived from
//! indices (`task_<i>`, `task_<i>_detail_<j>`) so regeneration is
//! deterministic, and a node that already exists keeps the position the user
//! gave it. Only new nodes are placed by the [`Layout`].

use std::collections::{HashMap, HashSet};

use flowsync_core::agent::AgentState;
use flowsync_core::document::{DETAIL_NODE_TYPE, Document, Edge, Node, Position, TASK_NODE_TYPE};
use serde_json::Value;

/// Places newly generated nodes.
pub trait Layout: Send + Sync {
    /// Position of task `index` out of `count`.
    fn task_position(&self, index: usize, count: usize) -> Position;

    /// Position of detail step `detail` of a task placed at `task`.
    fn detail_position(&self, task: Position, detail: usize) -> Position;
}

/// Tasks left to right, details stacked under their task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridLayout {
    /// Position of the first task.
    pub origin: Position,
    /// Horizontal distance between tasks.
    pub column_gap: f64,
    /// Vertical distance between a task and its details.
    pub row_gap: f64,
}

impl Default for GridLayout {
    fn default() -> Self {
        Self {
            origin: Position::new(0.0, 0.0),
            column_gap: 280.0,
            row_gap: 120.0,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
impl Layout for GridLayout {
    fn task_position(&self, index: usize, _count: usize) -> Position {
        Position::new(self.origin.x + index as f64 * self.column_gap, self.origin.y)
    }

    fn detail_position(&self, task: Position, detail: usize) -> Position {
        Position::new(task.x, task.y + (detail + 1) as f64 * self.row_gap)
    }
}

/// Id of the node generated for task `index`.
pub fn task_node_id(index: usize) -> String {
    format!("task_{index}")
}

/// Id of the node generated for detail `detail` of task `task`.
pub fn detail_node_id(task: usize, detail: usize) -> String {
    format!("task_{task}_detail_{detail}")
}

/// Rebuild the generated nodes of `doc` from `agent`.
///
/// User nodes are untouched. Edges between generated nodes are rebuilt;
/// user edges survive unless one of their endpoints disappeared. Returns
/// whether the document changed.
pub fn regenerate(doc: &mut Document, agent: &AgentState, layout: &dyn Layout) -> bool {
    let before = (doc.nodes.clone(), doc.edges.clone());

    let previous: HashMap<String, Position> = doc
        .nodes
        .iter()
        .filter(|n| n.is_generated())
        .map(|n| (n.id.clone(), n.position))
        .collect();

    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    let count = agent.tasks.len();
    for (i, task) in agent.tasks.iter().enumerate() {
        let id = task_node_id(i);
        let position = previous
            .get(&id)
            .copied()
            .unwrap_or_else(|| layout.task_position(i, count));

        let mut node = Node::new(id.clone(), task.name.clone(), position);
        node.node_type = TASK_NODE_TYPE.to_string();
        let _ = node.data.extra.insert("task_index".into(), Value::from(i));
        let _ = node
            .data
            .extra
            .insert("task_type".into(), Value::String(task.task_type.clone()));
        nodes.push(node);

        if i > 0 {
            edges.push(Edge::between(task_node_id(i - 1), id.clone()));
        }

        for (j, step) in agent.details_of(i).iter().enumerate() {
            let detail_id = detail_node_id(i, j);
            let detail_position = previous
                .get(&detail_id)
                .copied()
                .unwrap_or_else(|| layout.detail_position(position, j));
            let mut detail = Node::new(detail_id.clone(), step.name.clone(), detail_position);
            detail.node_type = DETAIL_NODE_TYPE.to_string();
            if let Some(description) = &step.description {
                let _ = detail
                    .data
                    .extra
                    .insert("description".into(), Value::String(description.clone()));
            }
            nodes.push(detail);
            edges.push(Edge::between(id.clone(), detail_id));
        }
    }

    doc.nodes.retain(|n| !n.is_generated());
    let live: HashSet<&str> = doc
        .nodes
        .iter()
        .chain(nodes.iter())
        .map(|n| n.id.as_str())
        .collect();
    doc.edges.retain(|e| {
        let rebuilt = previous.contains_key(&e.source) && previous.contains_key(&e.target);
        !rebuilt && live.contains(e.source.as_str()) && live.contains(e.target.as_str())
    });

    doc.nodes.extend(nodes);
    doc.edges.extend(edges);
    before.0 != doc.nodes || before.1 != doc.edges
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_core::agent::{AgentTask, DetailStep};

    fn agent(tasks: &[(&str, usize)]) -> AgentState {
        AgentState {
            tasks: tasks
                .iter()
                .map(|(name, details)| AgentTask {
                    name: (*name).into(),
                    task_type: "step".into(),
                    details: (*details > 0).then(|| {
                        (0..*details)
                            .map(|j| DetailStep {
                                name: format!("{name} {j}"),
                                description: None,
                            })
                            .collect()
                    }),
                })
                .collect(),
            ..AgentState::default()
        }
    }

    fn user_doc() -> Document {
        Document {
            nodes: vec![Node::new("start", "Start", Position::new(-200.0, 0.0))],
            edges: vec![],
            flow_name: "Flow".into(),
        }
    }

    #[test]
    fn generates_tasks_details_and_edges() {
        let mut doc = user_doc();
        assert!(regenerate(&mut doc, &agent(&[("Collect", 2), ("Write", 0)]), &GridLayout::default()));

        let ids: Vec<&str> = doc.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["start", "task_0", "task_0_detail_0", "task_0_detail_1", "task_1"]
        );
        assert_eq!(doc.node("task_1").unwrap().position, Position::new(280.0, 0.0));
        assert_eq!(doc.node("task_0_detail_1").unwrap().position, Position::new(0.0, 240.0));
        assert_eq!(doc.node("task_0").unwrap().node_type, TASK_NODE_TYPE);
        assert_eq!(doc.node("task_0_detail_0").unwrap().node_type, DETAIL_NODE_TYPE);

        let edge_ids: Vec<&str> = doc.edges.iter().map(|e| e.id.as_str()).collect();
        assert!(edge_ids.contains(&"e-task_0-task_1"));
        assert!(edge_ids.contains(&"e-task_0-task_0_detail_1"));
    }

    #[test]
    fn regeneration_is_idempotent() {
        let state = agent(&[("Collect", 1), ("Write", 1)]);
        let mut doc = user_doc();
        let _ = regenerate(&mut doc, &state, &GridLayout::default());
        let once = doc.clone();
        assert!(!regenerate(&mut doc, &state, &GridLayout::default()));
        assert_eq!(doc, once);
    }

    #[test]
    fn existing_positions_are_kept() {
        let state = agent(&[("Collect", 0)]);
        let mut doc = user_doc();
        let _ = regenerate(&mut doc, &state, &GridLayout::default());
        doc.node_mut("task_0").unwrap().position = Position::new(55.0, 66.0);

        let _ = regenerate(&mut doc, &agent(&[("Collect again", 0), ("New", 0)]), &GridLayout::default());
        let task = doc.node("task_0").unwrap();
        assert_eq!(task.position, Position::new(55.0, 66.0));
        assert_eq!(task.data.label, "Collect again");
    }

    #[test]
    fn removed_tasks_drop_nodes_and_dangling_user_edges() {
        let mut doc = user_doc();
        let _ = regenerate(&mut doc, &agent(&[("A", 0), ("B", 0)]), &GridLayout::default());
        doc.edges.push(Edge::between("start", "task_1"));
        doc.edges.push(Edge::between("start", "task_0"));

        assert!(regenerate(&mut doc, &agent(&[("A", 0)]), &GridLayout::default()));
        assert!(doc.node("task_1").is_none());
        let edge_ids: Vec<&str> = doc.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(edge_ids, vec!["e-start-task_0"]);
    }

    #[test]
    fn empty_agent_removes_generated_nodes() {
        let mut doc = user_doc();
        let _ = regenerate(&mut doc, &agent(&[("A", 2)]), &GridLayout::default());
        assert!(regenerate(&mut doc, &AgentState::default(), &GridLayout::default()));
        assert_eq!(doc, user_doc());
    }
}

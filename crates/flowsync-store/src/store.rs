//! Reconciliation store.
//!
//! Single writer for the editable document and the server-owned agent state.
//! User edits and streamed deltas both go through the operations here; every
//! mutation runs under one lock and is announced as a [`DocumentChange`] on a
//! broadcast channel once the lock is released.
//!
//! Generated task and detail nodes are never edited directly: they are
//! rebuilt from the agent state whenever its task list changes, and again
//! after undo/redo so history never resurrects a stale task list.

use std::collections::VecDeque;
use std::sync::Arc;

use flowsync_core::agent::{AgentState, AgentStatePatch, MergeOutcome};
use flowsync_core::document::{Document, Edge, FlowRecord, Node, Position, SaveSnapshot};
use flowsync_core::ids::FlowId;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::layout::{GridLayout, Layout, regenerate};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Edit applied to one node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeChange {
    /// Move a node. `dragging` is true while a drag gesture is in progress
    /// and false for the final position of the gesture or a plain move.
    Position {
        /// Node id.
        id: String,
        /// New position.
        position: Position,
        /// Whether the gesture is still in progress.
        dragging: bool,
    },
    /// Rename a user node.
    Label {
        /// Node id.
        id: String,
        /// New label.
        label: String,
    },
    /// Insert a node, replacing one with the same id.
    Add(Node),
    /// Delete a user node and its edges.
    Remove {
        /// Node id.
        id: String,
    },
}

/// Edit applied to one edge.
#[derive(Clone, Debug, PartialEq)]
pub enum EdgeChange {
    /// Insert an edge, replacing one with the same id.
    Add(Edge),
    /// Delete an edge.
    Remove {
        /// Edge id.
        id: String,
    },
}

/// What a store mutation touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChange {
    /// A record was loaded or the document was unloaded.
    Loaded,
    /// Only node positions changed.
    Moved {
        /// Whether a drag gesture is still in progress.
        dragging: bool,
    },
    /// Nodes, edges or the flow name changed.
    Edited,
    /// Undo or redo replaced the document.
    History,
    /// The agent state changed.
    AgentState {
        /// Whether generated nodes were rebuilt as a result.
        regenerated: bool,
    },
}

impl DocumentChange {
    /// Whether the change can make the document differ from the last save.
    pub fn affects_document(self) -> bool {
        match self {
            Self::Loaded => false,
            Self::Moved { .. } | Self::Edited | Self::History => true,
            Self::AgentState { regenerated } => regenerated,
        }
    }
}

#[derive(Debug)]
struct History {
    past: VecDeque<Document>,
    future: Vec<Document>,
    limit: usize,
}

impl History {
    fn new(limit: usize) -> Self {
        Self {
            past: VecDeque::new(),
            future: Vec::new(),
            limit: limit.max(1),
        }
    }

    fn record(&mut self, before: Document) {
        self.past.push_back(before);
        while self.past.len() > self.limit {
            let _ = self.past.pop_front();
        }
        self.future.clear();
    }

    fn clear(&mut self) {
        self.past.clear();
        self.future.clear();
    }
}

struct StoreState {
    flow_id: Option<FlowId>,
    document: Document,
    agent: AgentState,
    history: History,
    drag_in_progress: bool,
    /// Whether the agent's task list is known since the last load. Until then
    /// the generated nodes of the fetched document are kept as they are.
    tasks_known: bool,
}

/// Single-writer document and agent state for one flow.
pub struct ReconciliationStore {
    state: Mutex<StoreState>,
    layout: Arc<dyn Layout>,
    changes: broadcast::Sender<DocumentChange>,
}

impl ReconciliationStore {
    /// Empty store with the default grid layout.
    pub fn new(history_limit: usize) -> Self {
        Self::with_layout(history_limit, Arc::new(GridLayout::default()))
    }

    /// Empty store placing generated nodes with `layout`.
    pub fn with_layout(history_limit: usize, layout: Arc<dyn Layout>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(StoreState {
                flow_id: None,
                document: Document::default(),
                agent: AgentState::default(),
                history: History::new(history_limit),
                drag_in_progress: false,
                tasks_known: false,
            }),
            layout,
            changes,
        }
    }

    /// Receive every subsequent [`DocumentChange`].
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    /// Replace everything with a fetched record. History and agent state are
    /// reset; generated nodes stay until the agent's tasks are known.
    pub fn load(&self, record: &FlowRecord) {
        {
            let mut state = self.state.lock();
            state.flow_id = Some(record.id.clone());
            state.document = Document::from_record(record);
            state.agent = AgentState::default();
            state.history.clear();
            state.drag_in_progress = false;
            state.tasks_known = false;
        }
        debug!(flow_id = %record.id, "document loaded");
        self.emit(DocumentChange::Loaded);
    }

    /// Forget the current flow.
    pub fn unload(&self) {
        {
            let mut state = self.state.lock();
            state.flow_id = None;
            state.document = Document::default();
            state.agent = AgentState::default();
            state.history.clear();
            state.drag_in_progress = false;
            state.tasks_known = false;
        }
        self.emit(DocumentChange::Loaded);
    }

    /// Id of the loaded flow.
    pub fn flow_id(&self) -> Option<FlowId> {
        self.state.lock().flow_id.clone()
    }

    /// Copy of the current document.
    pub fn document(&self) -> Document {
        self.state.lock().document.clone()
    }

    /// Copy of the current agent state.
    pub fn agent_state(&self) -> AgentState {
        self.state.lock().agent.clone()
    }

    /// Snapshot of the current document's persisted fields.
    pub fn snapshot(&self) -> SaveSnapshot {
        SaveSnapshot::of(&self.state.lock().document)
    }

    /// Wire record of the current document, if a flow is loaded.
    pub fn record(&self) -> Option<FlowRecord> {
        let state = self.state.lock();
        state
            .flow_id
            .as_ref()
            .map(|id| state.document.to_record(id))
    }

    /// Whether a node drag gesture is in progress.
    pub fn is_dragging(&self) -> bool {
        self.state.lock().drag_in_progress
    }

    /// Apply a batch of node edits as one history step.
    ///
    /// Intermediate drag positions do not record history; the position before
    /// the gesture started does. Label edits and removals of generated nodes
    /// are ignored.
    pub fn apply_node_changes(&self, changes: impl IntoIterator<Item = NodeChange>) {
        let change = {
            let mut state = self.state.lock();
            let before = state.document.clone();
            let was_dragging = state.drag_in_progress;
            let mut position_only = true;

            for change in changes {
                match change {
                    NodeChange::Position {
                        id,
                        position,
                        dragging,
                    } => {
                        if let Some(node) = state.document.node_mut(&id) {
                            node.position = position;
                        }
                        state.drag_in_progress = dragging;
                    }
                    NodeChange::Label { id, label } => {
                        position_only = false;
                        match state.document.node_mut(&id) {
                            Some(node) if node.is_generated() => {
                                debug!(node_id = %id, "ignoring label edit on generated node");
                            }
                            Some(node) => node.data.label = label,
                            None => trace!(node_id = %id, "label edit for unknown node"),
                        }
                    }
                    NodeChange::Add(node) => {
                        position_only = false;
                        match state.document.node_mut(&node.id) {
                            Some(existing) => *existing = node,
                            None => state.document.nodes.push(node),
                        }
                    }
                    NodeChange::Remove { id } => {
                        position_only = false;
                        let removable = state.document.node(&id).is_some_and(|n| !n.is_generated());
                        if removable {
                            state.document.nodes.retain(|n| n.id != id);
                            state.document.edges.retain(|e| e.source != id && e.target != id);
                        } else {
                            debug!(node_id = %id, "ignoring removal of generated or unknown node");
                        }
                    }
                }
            }

            let dragging = state.drag_in_progress;
            if state.document == before && dragging == was_dragging {
                return;
            }
            // a gesture is one history step: the pre-drag document is recorded
            // when the drag starts, nothing while it continues or ends
            if !(position_only && was_dragging) {
                state.history.record(before);
            }

            if position_only {
                DocumentChange::Moved { dragging }
            } else {
                DocumentChange::Edited
            }
        };
        self.emit(change);
    }

    /// Apply a batch of edge edits as one history step.
    pub fn apply_edge_changes(&self, changes: impl IntoIterator<Item = EdgeChange>) {
        {
            let mut state = self.state.lock();
            let before = state.document.clone();
            for change in changes {
                match change {
                    EdgeChange::Add(edge) => {
                        match state.document.edges.iter_mut().find(|e| e.id == edge.id) {
                            Some(existing) => *existing = edge,
                            None => state.document.edges.push(edge),
                        }
                    }
                    EdgeChange::Remove { id } => state.document.edges.retain(|e| e.id != id),
                }
            }
            if state.document == before {
                return;
            }
            state.history.record(before);
        }
        self.emit(DocumentChange::Edited);
    }

    /// Rename the flow.
    pub fn set_flow_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut state = self.state.lock();
            if state.document.flow_name == name {
                return;
            }
            let before = state.document.clone();
            state.document.flow_name = name;
            state.history.record(before);
        }
        self.emit(DocumentChange::Edited);
    }

    /// Step back one history entry. Returns `false` if there is none.
    pub fn undo(&self) -> bool {
        {
            let mut state = self.state.lock();
            let Some(previous) = state.history.past.pop_back() else {
                return false;
            };
            let current = std::mem::replace(&mut state.document, previous);
            state.history.future.push(current);
            let _ = self.regenerate_locked(&mut state);
        }
        self.emit(DocumentChange::History);
        true
    }

    /// Step forward one history entry. Returns `false` if there is none.
    pub fn redo(&self) -> bool {
        {
            let mut state = self.state.lock();
            let Some(next) = state.history.future.pop() else {
                return false;
            };
            let current = std::mem::replace(&mut state.document, next);
            state.history.past.push_back(current);
            let _ = self.regenerate_locked(&mut state);
        }
        self.emit(DocumentChange::History);
        true
    }

    /// Whether [`undo`](Self::undo) would do anything.
    pub fn can_undo(&self) -> bool {
        !self.state.lock().history.past.is_empty()
    }

    /// Whether [`redo`](Self::redo) would do anything.
    pub fn can_redo(&self) -> bool {
        !self.state.lock().history.future.is_empty()
    }

    /// Replace the agent state wholesale, as after a fetch.
    pub fn replace_agent_state(&self, agent: AgentState) {
        let regenerated = {
            let mut state = self.state.lock();
            if state.tasks_known && state.agent == agent {
                return;
            }
            let tasks_changed = !state.tasks_known || state.agent.tasks != agent.tasks;
            state.agent = agent;
            state.tasks_known = true;
            tasks_changed && self.regenerate_locked(&mut state)
        };
        self.emit(DocumentChange::AgentState { regenerated });
    }

    /// Merge a streamed partial agent state field by field.
    pub fn merge_agent_state(&self, patch: AgentStatePatch) -> MergeOutcome {
        let (outcome, regenerated) = {
            let mut state = self.state.lock();
            let outcome = state.agent.apply(patch);
            if outcome.tasks_changed {
                state.tasks_known = true;
            }
            let regenerated = outcome.tasks_changed && self.regenerate_locked(&mut state);
            (outcome, regenerated)
        };
        if outcome.changed {
            self.emit(DocumentChange::AgentState { regenerated });
        }
        outcome
    }

    /// Record a new user request. The only local edit to the agent state.
    pub fn set_user_request(&self, request: impl Into<String>) {
        let request = request.into();
        {
            let mut state = self.state.lock();
            if state.agent.user_request == request {
                return;
            }
            state.agent.user_request = request;
        }
        self.emit(DocumentChange::AgentState { regenerated: false });
    }

    fn regenerate_locked(&self, state: &mut StoreState) -> bool {
        if !state.tasks_known {
            return false;
        }
        let StoreState { document, agent, .. } = state;
        let changed = regenerate(document, agent, self.layout.as_ref());
        if changed {
            debug!(tasks = agent.tasks.len(), "generated nodes rebuilt");
        }
        changed
    }

    fn emit(&self, change: DocumentChange) {
        // no receivers is fine
        let _ = self.changes.send(change);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

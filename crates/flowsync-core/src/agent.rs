//! Server-owned agent sub-state.
//!
//! [`AgentState`] is replaced wholesale when fetched and merged field by
//! field when a streamed `state_updated` event carries an [`AgentStatePatch`].
//! Local code never edits it except to record a new user request.

use serde::{Deserialize, Deserializer, Serialize};

/// Phase of the server-side dialog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogState {
    /// Nothing requested yet.
    #[default]
    Idle,
    /// Waiting for the user to answer a clarification prompt.
    AwaitingClarification,
    /// Generating the task list.
    Planning,
    /// Working through generated tasks.
    Executing,
    /// All tasks finished.
    Completed,
    /// The dialog stopped with an error.
    Failed,
    /// A state this client does not know about.
    #[serde(other)]
    Unknown,
}

/// One step of a generated task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailStep {
    /// Step title.
    pub name: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A task generated by the server for the current request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    /// Task title.
    pub name: String,
    /// Server-defined task category.
    #[serde(rename = "type", default)]
    pub task_type: String,
    /// Detail steps, once the server has expanded the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<DetailStep>>,
}

/// Server-owned agent state attached to a flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    /// Current dialog phase.
    pub dialog_state: DialogState,
    /// Generated task list.
    pub tasks: Vec<AgentTask>,
    /// Text of the most recent user request.
    pub user_request: String,
    /// Whether the server considers the request finished.
    pub is_complete: bool,
    /// Whether the server reported an error for the request.
    pub has_error: bool,
    /// Question the server needs answered before it can continue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
}

/// Partial agent state carried by a `state_updated` event.
///
/// Absent fields leave the current value untouched. `clarification` can be
/// cleared with an explicit `null`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentStatePatch {
    /// New dialog phase.
    pub dialog_state: Option<DialogState>,
    /// Replacement task list.
    pub tasks: Option<Vec<AgentTask>>,
    /// Replacement request text.
    pub user_request: Option<String>,
    /// New completion flag.
    pub is_complete: Option<bool>,
    /// New error flag.
    pub has_error: Option<bool>,
    /// `Some(None)` clears the prompt, `None` leaves it alone.
    #[serde(deserialize_with = "present_or_null")]
    pub clarification: Option<Option<String>>,
}

fn present_or_null<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

impl AgentStatePatch {
    /// Whether the patch carries no fields at all.
    pub fn is_empty(&self) -> bool {
        self.dialog_state.is_none()
            && self.tasks.is_none()
            && self.user_request.is_none()
            && self.is_complete.is_none()
            && self.has_error.is_none()
            && self.clarification.is_none()
    }
}

impl AgentState {
    /// Merge `patch` field by field. Returns whether anything changed and
    /// whether the task list (and therefore the generated nodes) changed.
    pub fn apply(&mut self, patch: AgentStatePatch) -> MergeOutcome {
        let before = self.clone();
        if let Some(v) = patch.dialog_state {
            self.dialog_state = v;
        }
        if let Some(v) = patch.tasks {
            self.tasks = v;
        }
        if let Some(v) = patch.user_request {
            self.user_request = v;
        }
        if let Some(v) = patch.is_complete {
            self.is_complete = v;
        }
        if let Some(v) = patch.has_error {
            self.has_error = v;
        }
        if let Some(v) = patch.clarification {
            self.clarification = v;
        }
        MergeOutcome {
            changed: before != *self,
            tasks_changed: before.tasks != self.tasks,
        }
    }

    /// Detail steps of task `index`, if the task exists and was expanded.
    pub fn details_of(&self, index: usize) -> &[DetailStep] {
        self.tasks
            .get(index)
            .and_then(|t| t.details.as_deref())
            .unwrap_or(&[])
    }
}

/// What a merge touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Any field differs from before the merge.
    pub changed: bool,
    /// The task list differs from before the merge.
    pub tasks_changed: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Component info — serialisable status tree for the supervisor and its valves.
//!
//! Every [`ValveService`](crate::service::ValveService) reports itself as a
//! leaf via `info()`; the supervisor wraps them in a root node. The tree is
//! printed as JSON at startup and on demand.

use serde::{Deserialize, Serialize};

// ── ComponentStatus ───────────────────────────────────────────────────────────

/// Operational state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Loaded and operating normally.
    On,
    /// Present but inactive.
    Off,
    /// Last attempt to bring it up failed.
    Err,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::On => "on",
            ComponentStatus::Off => "off",
            ComponentStatus::Err => "err",
        }
    }
}

// ── ComponentInfo ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Stable identifier (service name, or `"supervisor"` for the root).
    pub id: String,
    /// Class name for valves, display name for the root.
    pub name: String,
    /// Lifecycle state string (`"started"`, `"stopped"`, …).
    pub status: String,
    pub state: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    /// Last error message, if the component is in `err`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
    /// Child components, sorted by id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ComponentInfo>,
}

impl ComponentInfo {
    /// A leaf node with no children.
    pub fn leaf(id: &str, name: &str, status: &str, state: ComponentStatus) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: status.to_string(),
            state,
            generation: None,
            detail: None,
            uptime_ms: None,
            children: vec![],
        }
    }

    /// A running node wrapping `children`.
    pub fn running(id: &str, name: &str, children: Vec<ComponentInfo>) -> Self {
        let mut node = Self::leaf(id, name, "running", ComponentStatus::On);
        node.children = children;
        node.sort_children();
        node
    }

    pub fn sort_children(&mut self) {
        self.children.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// Count of nodes in the subtree (excluding `self`) with the given state.
    pub fn count(&self, state: ComponentStatus) -> usize {
        self.children
            .iter()
            .map(|c| usize::from(c.state == state) + c.count(state))
            .sum()
    }
}

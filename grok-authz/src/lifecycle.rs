use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::role::Role;
use crate::scope::Scope;

/// Where a stack entry stands in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Built from configuration, `load` not called yet.
    #[default]
    Unloaded,
    /// Configured, but no loaded unit was bound to the slot.
    Missing,
    Working,
    /// `load` failed; for stacks, some entry below is not working.
    Failed,
}

impl PluginState {
    pub fn is_working(self) -> bool {
        self == PluginState::Working
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Missing => "missing",
            PluginState::Working => "working",
            PluginState::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Administrative view of one stack entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryStatus {
    /// Names of the enclosing stacks followed by the entry's own name.
    pub path: Vec<String>,
    pub stack: bool,
    pub role: Role,
    pub state: PluginState,
    pub scope: Scope,
    /// Where the bound unit was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryStatus {
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }
}

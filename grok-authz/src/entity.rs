use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Group,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Project => f.write_str("project"),
            EntityKind::Group => f.write_str("group"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub parent: Option<String>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// The thing a request wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectedEntity<'a> {
    Project(&'a Project),
    Group(&'a Group),
}

impl ProtectedEntity<'_> {
    pub fn name(&self) -> &str {
        match self {
            ProtectedEntity::Project(project) => &project.name,
            ProtectedEntity::Group(group) => &group.name,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ProtectedEntity::Project(_) => EntityKind::Project,
            ProtectedEntity::Group(_) => EntityKind::Group,
        }
    }
}

impl<'a> From<&'a Project> for ProtectedEntity<'a> {
    fn from(project: &'a Project) -> Self {
        ProtectedEntity::Project(project)
    }
}

impl<'a> From<&'a Group> for ProtectedEntity<'a> {
    fn from(group: &'a Group) -> Self {
        ProtectedEntity::Group(group)
    }
}

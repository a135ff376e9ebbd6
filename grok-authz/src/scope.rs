use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::catalog::ProjectCatalog;
use crate::entity::ProtectedEntity;

/// Projects and groups a stack entry is consulted for.
///
/// An empty scope covers everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scope {
    pub projects: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.projects.insert(project.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty() && self.groups.is_empty()
    }

    /// Expands the configured names against `catalog`.
    ///
    /// Each named group contributes itself, its related groups and every
    /// project below it. Names the catalog does not know are dropped with a
    /// warning.
    pub fn resolve(&self, catalog: &ProjectCatalog, owner: &str) -> Scope {
        let mut resolved = Scope::new();
        resolved.projects = self.projects.clone();

        for group in &self.groups {
            if catalog.group(group).is_none() {
                warn!(group = %group, entry = owner, "configured group in scope does not exist");
                continue;
            }
            resolved.projects.extend(catalog.all_projects(group));
            resolved.groups.extend(catalog.related_groups(group));
            resolved.groups.insert(group.clone());
        }

        resolved.projects.retain(|project| {
            let known = catalog.project(project).is_some();
            if !known {
                warn!(project = %project, entry = owner, "configured project in scope does not exist");
            }
            known
        });
        resolved
    }

    pub fn applies_to(&self, entity: ProtectedEntity<'_>) -> bool {
        if self.is_empty() {
            return true;
        }
        match entity {
            ProtectedEntity::Project(project) => self.projects.contains(&project.name),
            ProtectedEntity::Group(group) => self.groups.contains(&group.name),
        }
    }
}

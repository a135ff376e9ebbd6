use std::collections::BTreeMap;
use std::collections::BTreeSet;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::entity::Group;
use crate::entity::Project;
use crate::error::AuthzError;
use crate::error::Result;

/// Declarative form of the project catalog, as found in `[catalog]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub projects: Vec<String>,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub name: String,
    pub parent: Option<String>,
    /// Projects listed explicitly.
    pub projects: Vec<String>,
    /// Projects whose whole name matches this regex also belong to the group.
    pub pattern: Option<String>,
}

#[derive(Debug)]
struct GroupNode {
    group: Group,
    children: Vec<String>,
    projects: BTreeSet<String>,
}

/// Known projects and the group hierarchy over them.
#[derive(Debug, Default)]
pub struct ProjectCatalog {
    projects: BTreeMap<String, Project>,
    groups: BTreeMap<String, GroupNode>,
}

impl ProjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CatalogConfig) -> Result<Self> {
        let projects: BTreeMap<String, Project> = config
            .projects
            .iter()
            .map(|name| (name.clone(), Project::new(name.clone())))
            .collect();

        let mut groups = BTreeMap::new();
        for entry in &config.groups {
            if entry.name.is_empty() {
                return Err(AuthzError::Catalog("group without a name".into()));
            }
            let pattern = entry
                .pattern
                .as_deref()
                .map(|pattern| Regex::new(&format!("^(?:{pattern})$")))
                .transpose()
                .map_err(|source| AuthzError::Pattern {
                    group: entry.name.clone(),
                    source,
                })?;

            let mut members = BTreeSet::new();
            for project in &entry.projects {
                if !projects.contains_key(project) {
                    return Err(AuthzError::Catalog(format!(
                        "group \"{}\" lists unknown project \"{project}\"",
                        entry.name
                    )));
                }
                members.insert(project.clone());
            }
            if let Some(pattern) = &pattern {
                members.extend(projects.keys().filter(|name| pattern.is_match(name)).cloned());
            }

            let group = Group {
                name: entry.name.clone(),
                parent: entry.parent.clone(),
            };
            let node = GroupNode {
                group,
                children: Vec::new(),
                projects: members,
            };
            if groups.insert(entry.name.clone(), node).is_some() {
                return Err(AuthzError::Catalog(format!(
                    "group \"{}\" is defined twice",
                    entry.name
                )));
            }
        }

        let links: Vec<(String, String)> = groups
            .values()
            .filter_map(|node| {
                node.group
                    .parent
                    .clone()
                    .map(|parent| (parent, node.group.name.clone()))
            })
            .collect();
        for (parent, child) in links {
            let Some(node) = groups.get_mut(&parent) else {
                return Err(AuthzError::Catalog(format!(
                    "group \"{child}\" has unknown parent \"{parent}\""
                )));
            };
            node.children.push(child);
        }

        let catalog = Self { projects, groups };
        for name in catalog.groups.keys() {
            let mut seen = BTreeSet::new();
            let mut current = Some(name.as_str());
            while let Some(group) = current {
                if !seen.insert(group) {
                    return Err(AuthzError::Catalog(format!(
                        "group \"{name}\" is its own ancestor"
                    )));
                }
                current = catalog.parent_of(group);
            }
        }
        Ok(catalog)
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name).map(|node| &node.group)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values().map(|node| &node.group)
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty() && self.groups.is_empty()
    }

    fn parent_of(&self, group: &str) -> Option<&str> {
        self.groups
            .get(group)
            .and_then(|node| node.group.parent.as_deref())
    }

    /// Every group below `group`, at any depth.
    pub fn descendants(&self, group: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut pending: Vec<&str> = vec![group];
        while let Some(current) = pending.pop() {
            let Some(node) = self.groups.get(current) else {
                continue;
            };
            for child in &node.children {
                if found.insert(child.clone()) {
                    pending.push(child);
                }
            }
        }
        found
    }

    /// Every group above `group` up to the root.
    pub fn ancestors(&self, group: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut current = self.parent_of(group);
        while let Some(parent) = current {
            if !found.insert(parent.to_string()) {
                break;
            }
            current = self.parent_of(parent);
        }
        found
    }

    pub fn related_groups(&self, group: &str) -> BTreeSet<String> {
        let mut related = self.descendants(group);
        related.extend(self.ancestors(group));
        related
    }

    /// Projects of `group` and of all groups below it.
    pub fn all_projects(&self, group: &str) -> BTreeSet<String> {
        let Some(node) = self.groups.get(group) else {
            return BTreeSet::new();
        };
        let mut projects = node.projects.clone();
        for descendant in self.descendants(group) {
            if let Some(node) = self.groups.get(&descendant) {
                projects.extend(node.projects.iter().cloned());
            }
        }
        projects
    }
}

use std::fmt::Write as _;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use grok_plugin::CompiledUnit;
use grok_plugin::LoadedPlugin;
use grok_plugin::panic_message;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::catalog::ProjectCatalog;
use crate::config::EntryConfig;
use crate::config::PluginConfig;
use crate::config::StackConfig;
use crate::entity::ProtectedEntity;
use crate::lifecycle::EntryStatus;
use crate::lifecycle::PluginState;
use crate::plugin::AuthorizationCapability;
use crate::plugin::AuthorizationPlugin;
use crate::plugin::Setup;
use crate::request::RequestContext;
use crate::role::Role;
use crate::scope::Scope;

/// `parent` overlaid with `own`.
fn merge_setup(parent: &Setup, own: &Setup) -> Setup {
    let mut merged = parent.clone();
    merged.extend(own.iter().map(|(key, value)| (key.clone(), value.clone())));
    merged
}

/// A plugin slot in a stack.
pub struct PluginEntry {
    name: String,
    role: Role,
    setup: Setup,
    current_setup: Setup,
    scope: Scope,
    effective_scope: Scope,
    unit: Option<Arc<CompiledUnit>>,
    plugin: Option<Box<dyn AuthorizationPlugin>>,
    state: PluginState,
    error: Option<String>,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            setup: Setup::new(),
            current_setup: Setup::new(),
            scope: Scope::default(),
            effective_scope: Scope::default(),
            unit: None,
            plugin: None,
            state: PluginState::Unloaded,
            error: None,
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        Self::new(config.name.clone(), config.role)
            .with_setup(config.setup.clone())
            .with_scope(config.scope.clone())
    }

    pub fn with_setup(mut self, setup: Setup) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.effective_scope = scope.clone();
        self.scope = scope;
        self
    }

    pub fn with_plugin(mut self, plugin: Box<dyn AuthorizationPlugin>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    /// The parameters the last `load` received.
    pub fn current_setup(&self) -> &Setup {
        &self.current_setup
    }

    /// The resolved scope after `load`; the configured one before.
    pub fn scope(&self) -> &Scope {
        &self.effective_scope
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        self.unit.as_ref()
    }

    pub fn has_plugin(&self) -> bool {
        self.plugin.is_some()
    }

    /// Binds a fresh instance of `unit` when the slot is named after it.
    /// The first binding of a slot wins.
    fn bind(&mut self, unit: &Arc<CompiledUnit>) -> bool {
        if self.name != unit.name().as_str() {
            return false;
        }
        if self.plugin.is_some() {
            debug!(plugin = %self.name, origin = %unit.origin(), "slot already bound, keeping the first unit");
            return true;
        }
        match unit.instantiate::<AuthorizationCapability>() {
            Ok(plugin) => {
                self.plugin = Some(plugin);
                self.unit = Some(unit.clone());
            }
            Err(err) => {
                warn!(plugin = %self.name, error = %err, "plugin could not be instantiated for its slot");
                self.state = PluginState::Failed;
                self.error = Some(err.to_string());
            }
        }
        true
    }

    fn load(&mut self, parameters: &Setup, catalog: &ProjectCatalog) {
        self.current_setup = merge_setup(parameters, &self.setup);
        self.effective_scope = self.scope.resolve(catalog, &self.name);

        let Some(plugin) = self.plugin.as_mut() else {
            if self.state != PluginState::Failed {
                self.state = PluginState::Missing;
            }
            warn!(role = %self.role, plugin = %self.name, "configured plugin has not been loaded");
            return;
        };

        let setup = &self.current_setup;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| plugin.load(setup)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        match failure {
            None => {
                self.state = PluginState::Working;
                self.error = None;
            }
            Some(reason) => {
                warn!(plugin = %self.name, error = %reason, "plugin has failed while loading");
                self.state = PluginState::Failed;
                self.error = Some(reason);
            }
        }
        info!(role = %self.role, plugin = %self.name, state = %self.state, "plugin loaded");
    }

    fn unload(&self) {
        let Some(plugin) = self.plugin.as_deref() else {
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| plugin.unload())) {
            warn!(
                plugin = %self.name,
                panic = %panic_message(payload.as_ref()),
                "plugin panicked while unloading"
            );
        }
    }

    fn decide(&self, request: &RequestContext, entity: ProtectedEntity<'_>) -> bool {
        let plugin = match self.plugin.as_deref() {
            Some(plugin) if self.state.is_working() => plugin,
            _ => {
                trace!(plugin = %self.name, state = %self.state, "plugin is not working, denying");
                return false;
            }
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match entity {
            ProtectedEntity::Project(project) => plugin.is_allowed_project(request, project),
            ProtectedEntity::Group(group) => plugin.is_allowed_group(request, group),
        }));
        match outcome {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(err)) => {
                warn!(
                    plugin = %self.name,
                    entity = entity.name(),
                    error = %format!("{err:#}"),
                    "plugin check failed, denying"
                );
                false
            }
            Err(payload) => {
                warn!(
                    plugin = %self.name,
                    entity = entity.name(),
                    panic = %panic_message(payload.as_ref()),
                    "plugin check panicked, denying"
                );
                false
            }
        }
    }
}

/// One entry of a stack: a plugin slot or a nested stack.
pub enum AuthorizationEntity {
    Plugin(PluginEntry),
    Stack(AuthorizationStack),
}

impl From<PluginEntry> for AuthorizationEntity {
    fn from(entry: PluginEntry) -> Self {
        AuthorizationEntity::Plugin(entry)
    }
}

impl From<AuthorizationStack> for AuthorizationEntity {
    fn from(stack: AuthorizationStack) -> Self {
        AuthorizationEntity::Stack(stack)
    }
}

impl AuthorizationEntity {
    pub fn from_config(config: &EntryConfig) -> Self {
        match config {
            EntryConfig::Plugin(plugin) => PluginEntry::from_config(plugin).into(),
            EntryConfig::Stack(stack) => AuthorizationStack::from_config(stack).into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.name(),
            AuthorizationEntity::Stack(stack) => stack.name(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.role(),
            AuthorizationEntity::Stack(stack) => stack.role(),
        }
    }

    pub fn state(&self) -> PluginState {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.state(),
            AuthorizationEntity::Stack(stack) => stack.state(),
        }
    }

    pub fn scope(&self) -> &Scope {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.scope(),
            AuthorizationEntity::Stack(stack) => stack.scope(),
        }
    }

    fn applies_to(&self, entity: ProtectedEntity<'_>) -> bool {
        self.scope().applies_to(entity)
    }

    fn decide(&self, request: &RequestContext, entity: ProtectedEntity<'_>) -> bool {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.decide(request, entity),
            AuthorizationEntity::Stack(stack) => stack.evaluate(request, entity),
        }
    }

    fn bind(&mut self, unit: &Arc<CompiledUnit>) -> bool {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.bind(unit),
            AuthorizationEntity::Stack(stack) => stack.set_plugin(unit),
        }
    }

    fn contains_unit(&self, name: &str) -> bool {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.name() == name,
            AuthorizationEntity::Stack(stack) => stack.contains_unit(name),
        }
    }

    fn load(&mut self, parameters: &Setup, catalog: &ProjectCatalog) {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.load(parameters, catalog),
            AuthorizationEntity::Stack(stack) => stack.load(parameters, catalog),
        }
    }

    fn unload(&self) {
        match self {
            AuthorizationEntity::Plugin(entry) => entry.unload(),
            AuthorizationEntity::Stack(stack) => stack.unload(),
        }
    }

    fn collect_statuses(&self, parent: &[String], out: &mut Vec<EntryStatus>) {
        match self {
            AuthorizationEntity::Plugin(entry) => {
                let mut path = parent.to_vec();
                path.push(entry.name.clone());
                out.push(EntryStatus {
                    path,
                    stack: false,
                    role: entry.role,
                    state: entry.state,
                    scope: entry.effective_scope.clone(),
                    origin: entry.unit.as_ref().map(|unit| unit.origin().to_string()),
                    digest: entry
                        .unit
                        .as_ref()
                        .and_then(|unit| unit.digest().map(str::to_string)),
                    error: entry.error.clone(),
                });
            }
            AuthorizationEntity::Stack(stack) => stack.collect_statuses(parent, out),
        }
    }

    fn write_hierarchy(&self, out: &mut String, depth: usize) {
        match self {
            AuthorizationEntity::Plugin(entry) => {
                let indent = "    ".repeat(depth);
                let _ = writeln!(
                    out,
                    "{indent}{} \"{}\" ({})",
                    entry.role, entry.name, entry.state
                );
                write_details(out, depth + 1, &entry.current_setup, &entry.effective_scope);
                if let Some(error) = &entry.error {
                    let _ = writeln!(out, "{indent}    error: {error}");
                }
            }
            AuthorizationEntity::Stack(stack) => stack.write_hierarchy(out, depth),
        }
    }
}

fn write_details(out: &mut String, depth: usize, setup: &Setup, scope: &Scope) {
    let indent = "    ".repeat(depth);
    if !setup.is_empty() {
        let rendered = serde_json::to_string(setup).unwrap_or_default();
        let _ = writeln!(out, "{indent}setup: {rendered}");
    }
    if !scope.projects.is_empty() {
        let projects: Vec<&str> = scope.projects.iter().map(String::as_str).collect();
        let _ = writeln!(out, "{indent}projects: {}", projects.join(", "));
    }
    if !scope.groups.is_empty() {
        let groups: Vec<&str> = scope.groups.iter().map(String::as_str).collect();
        let _ = writeln!(out, "{indent}groups: {}", groups.join(", "));
    }
}

/// An ordered, role-tagged list of entries evaluated with PAM semantics.
///
/// For every entry whose scope covers the entity, in order:
///
/// * a denying REQUIRED entry fails the stack and evaluation continues;
/// * a denying REQUISITE entry denies immediately;
/// * an approving SUFFICIENT entry allows immediately unless something has
///   already failed.
///
/// The verdict is "allow" unless something failed. Entries that are not
/// working deny without being asked, and faults raised by a plugin deny that
/// one call.
pub struct AuthorizationStack {
    name: String,
    role: Role,
    setup: Setup,
    current_setup: Setup,
    scope: Scope,
    effective_scope: Scope,
    entries: Vec<AuthorizationEntity>,
    state: PluginState,
}

impl AuthorizationStack {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            setup: Setup::new(),
            current_setup: Setup::new(),
            scope: Scope::default(),
            effective_scope: Scope::default(),
            entries: Vec::new(),
            state: PluginState::Unloaded,
        }
    }

    /// A fresh, unbound, unloaded copy of the configured tree.
    pub fn from_config(config: &StackConfig) -> Self {
        let mut stack = Self::new(config.name.clone(), config.role)
            .with_setup(config.setup.clone())
            .with_scope(config.scope.clone());
        stack.entries = config
            .entries
            .iter()
            .map(AuthorizationEntity::from_config)
            .collect();
        stack
    }

    pub fn with_setup(mut self, setup: Setup) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.effective_scope = scope.clone();
        self.scope = scope;
        self
    }

    pub fn push(&mut self, entry: impl Into<AuthorizationEntity>) {
        self.entries.push(entry.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn scope(&self) -> &Scope {
        &self.effective_scope
    }

    pub fn current_setup(&self) -> &Setup {
        &self.current_setup
    }

    pub fn entries(&self) -> &[AuthorizationEntity] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binds `unit` to every slot named after it, at any depth, each with
    /// its own instance. Returns whether any slot matched.
    pub fn set_plugin(&mut self, unit: &Arc<CompiledUnit>) -> bool {
        let mut matched = false;
        for entry in &mut self.entries {
            matched |= entry.bind(unit);
        }
        matched
    }

    /// Whether a slot for the unit `name` exists anywhere in the tree.
    pub fn contains_unit(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.contains_unit(name))
    }

    /// Appends a loaded plugin with `role`. A unit that already has a slot
    /// is not added again; the existing slot keeps its role.
    pub fn add_plugin(&mut self, plugin: LoadedPlugin<AuthorizationCapability>, role: Role) -> bool {
        let name = plugin.unit.name().as_str();
        if self.contains_unit(name) {
            debug!(plugin = name, "plugin is already on the stack, ignoring");
            return false;
        }
        let mut entry = PluginEntry::new(name, role);
        entry.unit = Some(plugin.unit);
        entry.plugin = Some(plugin.instance);
        self.entries.push(entry.into());
        true
    }

    /// Loads every entry with this stack's setup overlaid on `parameters`
    /// and resolves all scopes against `catalog`.
    pub fn load(&mut self, parameters: &Setup, catalog: &ProjectCatalog) {
        self.current_setup = merge_setup(parameters, &self.setup);
        info!(role = %self.role, stack = %self.name, "stack is loading");
        self.effective_scope = self.scope.resolve(catalog, &self.name);

        let mut working = 0;
        for entry in &mut self.entries {
            entry.load(&self.current_setup, catalog);
            if entry.state().is_working() {
                working += 1;
            }
        }
        self.state = if working == self.entries.len() {
            PluginState::Working
        } else {
            PluginState::Failed
        };
        info!(
            role = %self.role,
            stack = %self.name,
            "stack is {}",
            if self.state.is_working() { "ready" } else { "not fully ok" }
        );
    }

    pub fn unload(&self) {
        for entry in &self.entries {
            entry.unload();
        }
    }

    pub fn is_allowed(&self, request: &RequestContext, entity: ProtectedEntity<'_>) -> bool {
        if !self.effective_scope.applies_to(entity) {
            trace!(stack = %self.name, entity = entity.name(), "entity out of stack scope");
            return true;
        }
        let allowed = self.evaluate(request, entity);
        trace!(
            stack = %self.name,
            kind = %entity.kind(),
            entity = entity.name(),
            allowed,
            "authorization decided"
        );
        allowed
    }

    fn evaluate(&self, request: &RequestContext, entity: ProtectedEntity<'_>) -> bool {
        let mut has_failed = false;
        for entry in &self.entries {
            if !entry.applies_to(entity) {
                trace!(entry = entry.name(), entity = entity.name(), "skipping entry out of scope");
                continue;
            }
            let allowed = entry.decide(request, entity);
            trace!(
                role = %entry.role(),
                entry = entry.name(),
                entity = entity.name(),
                allowed,
                "entry decided"
            );
            match entry.role() {
                Role::Required if !allowed => has_failed = true,
                Role::Requisite if !allowed => return false,
                Role::Sufficient if allowed && !has_failed => return true,
                _ => {}
            }
        }
        !has_failed
    }

    /// Status of this stack and everything below it, depth first.
    pub fn statuses(&self) -> Vec<EntryStatus> {
        let mut out = Vec::new();
        self.collect_statuses(&[], &mut out);
        out
    }

    fn collect_statuses(&self, parent: &[String], out: &mut Vec<EntryStatus>) {
        let mut path = parent.to_vec();
        path.push(self.name.clone());
        out.push(EntryStatus {
            path: path.clone(),
            stack: true,
            role: self.role,
            state: self.state,
            scope: self.effective_scope.clone(),
            origin: None,
            digest: None,
            error: None,
        });
        for entry in &self.entries {
            entry.collect_statuses(&path, out);
        }
    }

    /// Indented text rendering of the tree for administrators.
    pub fn hierarchy_to_string(&self) -> String {
        let mut out = String::new();
        self.write_hierarchy(&mut out, 0);
        out
    }

    fn write_hierarchy(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        let state = match self.state {
            PluginState::Working => "ok",
            PluginState::Unloaded => "unloaded",
            _ => "not fully ok",
        };
        let _ = writeln!(out, "{indent}{} \"{}\" (stack {state})", self.role, self.name);
        write_details(out, depth + 1, &self.current_setup, &self.effective_scope);
        for entry in &self.entries {
            entry.write_hierarchy(out, depth + 1);
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Instant;

use arc_swap::ArcSwap;
use grok_plugin::LoadedPlugin;
use grok_plugin::PluginRegistry;
use grok_plugin::ReloadHooks;
use grok_plugin::ReloadOutcome;
use grok_plugin::ReloadReport;
use grok_plugin::SymbolTable;
use tracing::debug;
use tracing::info;

use crate::catalog::ProjectCatalog;
use crate::config::AuthzConfig;
use crate::config::StackConfig;
use crate::entity::Group;
use crate::entity::Project;
use crate::entity::ProtectedEntity;
use crate::error::Result;
use crate::lifecycle::EntryStatus;
use crate::lifecycle::PluginState;
use crate::plugin::AuthorizationCapability;
use crate::plugin::Setup;
use crate::request::RequestContext;
use crate::role::Role;
use crate::stack::AuthorizationStack;
use crate::statistics;
use crate::statistics::Statistics;

/// A loaded stack together with the reload generation that produced it.
pub struct PublishedStack {
    generation: u64,
    stack: AuthorizationStack,
}

impl PublishedStack {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stack(&self) -> &AuthorizationStack {
        &self.stack
    }
}

struct ReloadState {
    config: AuthzConfig,
    catalog: Arc<ProjectCatalog>,
    last_report: Option<ReloadReport>,
}

/// Builds the next stack while the registry walks the plugin directory.
struct StackBuilder<'a> {
    config: &'a StackConfig,
    append_unconfigured: bool,
    stack: AuthorizationStack,
}

impl ReloadHooks<AuthorizationCapability> for StackBuilder<'_> {
    fn before_reload(&mut self) {
        self.stack = AuthorizationStack::from_config(self.config);
    }

    fn unit_loaded(&mut self, plugin: LoadedPlugin<AuthorizationCapability>) {
        if self.stack.set_plugin(&plugin.unit) {
            return;
        }
        let name = plugin.name().to_string();
        if !self.append_unconfigured {
            debug!(plugin = %name, "loaded plugin has no configured slot, ignoring");
        } else if self.stack.add_plugin(plugin, Role::Required) {
            info!(plugin = %name, "appending unconfigured plugin as REQUIRED");
        }
    }
}

/// The authorization entry point of the host.
///
/// Requests read the published stack without locking; [`reload`](Self::reload)
/// builds and loads a complete new stack, publishes it with one atomic swap
/// and unloads the stack it replaced. Reloads are serialized.
pub struct AuthorizationFramework {
    current: ArcSwap<PublishedStack>,
    reload: Mutex<ReloadState>,
    symbols: Arc<SymbolTable>,
    statistics: Statistics,
}

impl AuthorizationFramework {
    /// A framework linking units against every factory exported in the
    /// binary.
    pub fn new(config: AuthzConfig) -> Result<Self> {
        Self::with_symbols(config, SymbolTable::exported())
    }

    pub fn with_symbols(config: AuthzConfig, symbols: SymbolTable) -> Result<Self> {
        let catalog = ProjectCatalog::from_config(&config.catalog)?;
        let initial = PublishedStack {
            generation: 0,
            stack: AuthorizationStack::new(config.stack.name.clone(), config.stack.role),
        };
        Ok(Self {
            current: ArcSwap::from_pointee(initial),
            reload: Mutex::new(ReloadState {
                config,
                catalog: Arc::new(catalog),
                last_report: None,
            }),
            symbols: Arc::new(symbols),
            statistics: Statistics::new(),
        })
    }

    fn reload_state(&self) -> MutexGuard<'_, ReloadState> {
        self.reload.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the configuration used by subsequent reloads.
    pub fn set_config(&self, config: AuthzConfig) -> Result<()> {
        let catalog = ProjectCatalog::from_config(&config.catalog)?;
        let mut state = self.reload_state();
        state.config = config;
        state.catalog = Arc::new(catalog);
        Ok(())
    }

    pub fn config(&self) -> AuthzConfig {
        self.reload_state().config.clone()
    }

    pub fn catalog(&self) -> Arc<ProjectCatalog> {
        self.reload_state().catalog.clone()
    }

    pub fn plugin_directory(&self) -> Option<PathBuf> {
        self.reload_state().config.plugin_directory.clone()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Discovers plugins, binds them into a fresh copy of the configured
    /// stack, loads it and publishes it.
    ///
    /// When the plugin directory is missing nothing changes and the
    /// previously published stack stays in effect.
    pub fn reload(&self) -> ReloadOutcome {
        let mut state = self.reload_state();
        let config = &state.config;

        let registry: PluginRegistry<AuthorizationCapability> =
            PluginRegistry::new(config.plugin_directory.clone(), self.symbols.clone())
                .with_options(config.discovery.clone())
                .with_policy(Arc::new(config.security.clone()));
        let mut builder = StackBuilder {
            config: &config.stack,
            append_unconfigured: config.append_unconfigured,
            stack: AuthorizationStack::from_config(&config.stack),
        };

        let report = match registry.reload(&mut builder) {
            ReloadOutcome::Completed(report) => report,
            skipped @ ReloadOutcome::Skipped { .. } => return skipped,
        };

        let mut stack = builder.stack;
        stack.load(&Setup::new(), &state.catalog);

        let failed_slots = stack
            .statuses()
            .iter()
            .filter(|status| !status.stack && status.state == PluginState::Failed)
            .count();
        self.statistics.add_request(statistics::STACK_RELOAD);
        self.statistics.add_requests(
            statistics::PLUGIN_LOAD_FAILURES,
            (report.load_failures() + failed_slots) as u64,
        );
        self.statistics.add_requests(
            statistics::SECURITY_VIOLATIONS,
            report.security_violations() as u64,
        );

        let generation = self.current.load().generation + 1;
        let previous = self.current.swap(Arc::new(PublishedStack { generation, stack }));
        info!(generation, "authorization stack published");
        previous.stack.unload();

        state.last_report = Some(report.clone());
        ReloadOutcome::Completed(report)
    }

    /// Unloads the published stack and falls back to allowing everything.
    pub fn shutdown(&self) {
        let state = self.reload_state();
        let generation = self.current.load().generation + 1;
        let empty = AuthorizationStack::new(state.config.stack.name.clone(), state.config.stack.role);
        let previous = self.current.swap(Arc::new(PublishedStack {
            generation,
            stack: empty,
        }));
        previous.stack.unload();
    }

    /// Decides whether the request may see `entity`.
    ///
    /// Never fails: plugin faults deny inside the stack, and without a
    /// published stack everything is allowed.
    pub fn is_allowed(&self, request: &RequestContext, entity: ProtectedEntity<'_>) -> bool {
        let current = self.current.load_full();
        let kind = entity.kind();
        let name = entity.name();

        if let Some(allowed) = request.cached_decision(current.generation, kind, name) {
            self.statistics.add_request(statistics::CACHE_HITS);
            return allowed;
        }
        self.statistics.add_request(statistics::CACHE_MISSES);

        let started = Instant::now();
        let allowed = current.stack.is_allowed(request, entity);
        let elapsed = started.elapsed();

        let verdict = if allowed { "positive" } else { "negative" };
        self.statistics.add_request_time(statistics::TIMING, elapsed);
        self.statistics
            .add_request_time(&format!("authorization_{verdict}"), elapsed);
        // Per-entity names are bounded by the statistics timing limit.
        self.statistics
            .add_request_time(&format!("authorization_{verdict}_of_{name}"), elapsed);
        self.statistics
            .add_request_time(&format!("authorization_of_{name}"), elapsed);
        self.statistics.add_request(if allowed {
            statistics::ALLOWED
        } else {
            statistics::DENIED
        });

        request.remember_decision(current.generation, kind, name, allowed);
        allowed
    }

    pub fn is_allowed_project(&self, request: &RequestContext, project: &Project) -> bool {
        self.is_allowed(request, ProtectedEntity::Project(project))
    }

    pub fn is_allowed_group(&self, request: &RequestContext, group: &Group) -> bool {
        self.is_allowed(request, ProtectedEntity::Group(group))
    }

    pub fn current(&self) -> Arc<PublishedStack> {
        self.current.load_full()
    }

    /// Incremented by every published stack; 0 until the first reload.
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    pub fn statuses(&self) -> Vec<EntryStatus> {
        self.current.load().stack.statuses()
    }

    pub fn hierarchy_to_string(&self) -> String {
        self.current.load().stack.hierarchy_to_string()
    }

    /// What the last completed reload found in the plugin directory.
    pub fn last_reload_report(&self) -> Option<ReloadReport> {
        self.reload_state().last_report.clone()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }
}

use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::capability::Capability;
use crate::error::LoadError;
use crate::error::Result;
use crate::loader::DEFAULT_BUNDLE_SUFFIX;
use crate::loader::DEFAULT_UNIT_SUFFIX;
use crate::loader::SandboxedLoader;
use crate::loader::list_files;
use crate::policy::SecurityPolicy;
use crate::symbol::ParentLoader;
use crate::symbol::SymbolTable;
use crate::unit::CompiledUnit;
use crate::unit::UnitName;

/// Which files a reload pass looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    pub load_units: bool,
    pub load_bundles: bool,
    pub recursive_units: bool,
    pub recursive_bundles: bool,
    pub unit_suffix: String,
    pub bundle_suffix: String,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            load_units: true,
            load_bundles: true,
            recursive_units: true,
            recursive_bundles: false,
            unit_suffix: DEFAULT_UNIT_SUFFIX.into(),
            bundle_suffix: DEFAULT_BUNDLE_SUFFIX.into(),
        }
    }
}

/// A freshly instantiated plugin and the unit it came from.
pub struct LoadedPlugin<C: Capability> {
    pub unit: Arc<CompiledUnit>,
    pub instance: C::Instance,
}

impl<C: Capability> LoadedPlugin<C> {
    pub fn name(&self) -> &UnitName {
        self.unit.name()
    }

    /// Another instance of the same unit.
    pub fn instantiate(&self) -> Result<C::Instance> {
        self.unit.instantiate::<C>()
    }
}

/// Callbacks driven by [`PluginRegistry::reload`].
pub trait ReloadHooks<C: Capability> {
    /// Called before the directory is enumerated; lets the owner drop its
    /// previous instance set.
    fn before_reload(&mut self) {}

    fn unit_loaded(&mut self, plugin: LoadedPlugin<C>);

    fn unit_failed(&mut self, _name: &UnitName, _error: &LoadError) {}

    fn after_reload(&mut self) {}
}

/// One candidate that could not be turned into a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit: String,
    pub security_violation: bool,
    pub error: String,
}

/// What a completed reload pass saw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub directory: PathBuf,
    pub candidates: usize,
    pub loaded: Vec<UnitName>,
    pub skipped: Vec<UnitName>,
    pub failures: Vec<UnitFailure>,
}

impl ReloadReport {
    pub fn security_violations(&self) -> usize {
        self.failures
            .iter()
            .filter(|failure| failure.security_violation)
            .count()
    }

    pub fn load_failures(&self) -> usize {
        self.failures.len() - self.security_violations()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Completed(ReloadReport),
    /// The plugin directory is not configured or not readable. Hooks were
    /// not called and the owner keeps whatever it had.
    Skipped { reason: String },
}

/// Discovers plugins implementing `C` in a plugin directory.
///
/// Each [`reload`](Self::reload) builds a fresh [`SandboxedLoader`], walks
/// loose unit files and bundle archives, and hands every instantiable
/// implementer of `C` to the hooks. Failures of individual candidates are
/// logged and skipped.
pub struct PluginRegistry<C: Capability> {
    directory: Option<PathBuf>,
    options: DiscoveryOptions,
    policy: Arc<SecurityPolicy>,
    symbols: Arc<SymbolTable>,
    parent: Option<Arc<dyn ParentLoader>>,
    _capability: PhantomData<fn() -> C>,
}

impl<C: Capability> PluginRegistry<C> {
    pub fn new(directory: Option<PathBuf>, symbols: Arc<SymbolTable>) -> Self {
        Self {
            directory,
            options: DiscoveryOptions::default(),
            policy: Arc::new(SecurityPolicy::default()),
            symbols,
            parent: None,
            _capability: PhantomData,
        }
    }

    pub fn with_options(mut self, options: DiscoveryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policy(mut self, policy: Arc<SecurityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the trusted parent; defaults to the symbol table.
    pub fn with_parent(mut self, parent: Arc<dyn ParentLoader>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn set_directory(&mut self, directory: Option<PathBuf>) {
        self.directory = directory;
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    pub fn set_load_units(&mut self, enabled: bool) {
        self.options.load_units = enabled;
    }

    pub fn set_load_bundles(&mut self, enabled: bool) {
        self.options.load_bundles = enabled;
    }

    pub fn reload(&self, hooks: &mut dyn ReloadHooks<C>) -> ReloadOutcome {
        let directory = match self.readable_directory() {
            Ok(directory) => directory,
            Err(reason) => {
                warn!(%reason, "plugin directory not found or not readable, all requests allowed");
                return ReloadOutcome::Skipped { reason };
            }
        };

        info!(directory = %directory.display(), capability = C::NAME, "plugins are being reloaded");

        let loader = self.new_loader(directory);
        let mut report = ReloadReport {
            directory: directory.to_path_buf(),
            ..ReloadReport::default()
        };

        hooks.before_reload();

        if self.options.load_units {
            for path in list_files(directory, &self.options.unit_suffix, self.options.recursive_units)
            {
                let relative = path.strip_prefix(directory).unwrap_or(path.as_path());
                match UnitName::from_relative_path(relative, &self.options.unit_suffix) {
                    Some(name) => self.handle_candidate(&loader, name, hooks, &mut report),
                    None => debug!(path = %path.display(), "file does not name a unit"),
                }
            }
        }

        if self.options.load_bundles {
            for archive in list_files(
                directory,
                &self.options.bundle_suffix,
                self.options.recursive_bundles,
            ) {
                match bundle_units(&archive, &self.options.unit_suffix) {
                    Ok(names) => {
                        for name in names {
                            self.handle_candidate(&loader, name, hooks, &mut report);
                        }
                    }
                    Err(err) => {
                        warn!(bundle = %archive.display(), error = %err, "could not read bundle");
                    }
                }
            }
        }

        hooks.after_reload();

        info!(
            candidates = report.candidates,
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            "plugin reload finished"
        );
        ReloadOutcome::Completed(report)
    }

    fn readable_directory(&self) -> std::result::Result<&Path, String> {
        let Some(directory) = self.directory.as_deref() else {
            return Err("no plugin directory configured".to_string());
        };
        if !directory.is_dir() {
            return Err(format!("{} is not a directory", directory.display()));
        }
        std::fs::read_dir(directory)
            .map(|_| directory)
            .map_err(|err| format!("{}: {err}", directory.display()))
    }

    fn new_loader(&self, directory: &Path) -> SandboxedLoader {
        let loader = SandboxedLoader::new(directory, self.symbols.clone())
            .with_policy(self.policy.clone())
            .with_suffixes(&self.options.unit_suffix, &self.options.bundle_suffix)
            .with_recursive_bundles(self.options.recursive_bundles);
        match &self.parent {
            Some(parent) => loader.with_parent(parent.clone()),
            None => loader,
        }
    }

    fn handle_candidate(
        &self,
        loader: &SandboxedLoader,
        name: UnitName,
        hooks: &mut dyn ReloadHooks<C>,
        report: &mut ReloadReport,
    ) {
        report.candidates += 1;
        let result = loader.load_unit(&name).and_then(|unit| {
            if unit.is_abstract() || !unit.implements(C::NAME) {
                trace!(unit = %name, capability = C::NAME, "unit does not implement the capability");
                return Ok(None);
            }
            let instance = unit.instantiate::<C>()?;
            Ok(Some(LoadedPlugin { unit, instance }))
        });

        match result {
            Ok(Some(plugin)) => {
                debug!(unit = %name, origin = %plugin.unit.origin(), "plugin instantiated");
                report.loaded.push(name);
                hooks.unit_loaded(plugin);
            }
            Ok(None) => report.skipped.push(name),
            Err(err) => {
                if let Some(violation) = err.security_violation() {
                    error!(unit = %name, %violation, "unit refused by the security policy");
                } else {
                    warn!(unit = %name, error = %err, "unit could not be loaded");
                }
                report.failures.push(UnitFailure {
                    unit: name.to_string(),
                    security_violation: err.is_security_violation(),
                    error: err.to_string(),
                });
                hooks.unit_failed(&name, &err);
            }
        }
    }
}

/// Unit names stored in a bundle, in archive order.
fn bundle_units(
    archive: &Path,
    suffix: &str,
) -> std::result::Result<Vec<UnitName>, zip::result::ZipError> {
    let bundle = zip::ZipArchive::new(std::fs::File::open(archive)?)?;
    Ok(bundle
        .file_names()
        .filter(|entry| !entry.ends_with('/'))
        .filter_map(|entry| UnitName::from_entry(entry, suffix))
        .collect())
}

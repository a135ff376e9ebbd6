use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use tracing::debug;
use tracing::trace;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::LoadError;
use crate::error::Result;
use crate::policy::SecurityPolicy;
use crate::symbol::ParentLoader;
use crate::symbol::SymbolTable;
use crate::unit::CompiledUnit;
use crate::unit::UnitName;
use crate::unit::UnitOrigin;

pub const DEFAULT_UNIT_SUFFIX: &str = ".unit";
pub const DEFAULT_BUNDLE_SUFFIX: &str = ".bundle";

/// Resolves unit names against one plugin directory.
///
/// Resolution order: cache, trusted parent, loose unit file, first bundle
/// archive (by file name) holding a matching entry. Every name passes the
/// [`SecurityPolicy`] before any source is consulted, and so does every unit
/// it `requires`.
///
/// A loader caches for its whole lifetime; build a fresh one for each reload
/// pass so stale plugin units are never served.
pub struct SandboxedLoader {
    directory: PathBuf,
    policy: Arc<SecurityPolicy>,
    symbols: Arc<SymbolTable>,
    parent: Arc<dyn ParentLoader>,
    unit_suffix: String,
    bundle_suffix: String,
    recursive_bundles: bool,
    bundles: OnceLock<Vec<PathBuf>>,
    cache: Mutex<HashMap<UnitName, Arc<CompiledUnit>>>,
    resolving: Mutex<HashSet<UnitName>>,
}

impl SandboxedLoader {
    /// A loader using the default policy whose trusted parent is `symbols`.
    pub fn new(directory: impl Into<PathBuf>, symbols: Arc<SymbolTable>) -> Self {
        Self {
            directory: directory.into(),
            policy: Arc::new(SecurityPolicy::default()),
            parent: symbols.clone(),
            symbols,
            unit_suffix: DEFAULT_UNIT_SUFFIX.to_string(),
            bundle_suffix: DEFAULT_BUNDLE_SUFFIX.to_string(),
            recursive_bundles: false,
            bundles: OnceLock::new(),
            cache: Mutex::new(HashMap::new()),
            resolving: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_policy(mut self, policy: Arc<SecurityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parent(mut self, parent: Arc<dyn ParentLoader>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_suffixes(mut self, unit_suffix: &str, bundle_suffix: &str) -> Self {
        self.unit_suffix = unit_suffix.to_string();
        self.bundle_suffix = bundle_suffix.to_string();
        self
    }

    pub fn with_recursive_bundles(mut self, recursive: bool) -> Self {
        self.recursive_bundles = recursive;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn unit_suffix(&self) -> &str {
        &self.unit_suffix
    }

    pub fn bundle_suffix(&self) -> &str {
        &self.bundle_suffix
    }

    pub fn load(&self, name: &str) -> Result<Arc<CompiledUnit>> {
        let name = UnitName::parse(name)?;
        self.load_unit(&name)
    }

    pub fn load_unit(&self, name: &UnitName) -> Result<Arc<CompiledUnit>> {
        if let Err(violation) = self.policy.check(name.as_str()) {
            debug!(unit = %name, %violation, "unit refused by security policy");
            return Err(violation.into());
        }

        if let Some(unit) = self.cached(name) {
            return Ok(unit);
        }

        if let Some(unit) = self.parent.find_unit(name) {
            trace!(unit = %name, "unit provided by the trusted parent");
            return Ok(self.remember(unit));
        }

        let unit = self.find_on_disk(name)?;
        self.link_requirements(&unit)?;
        Ok(self.remember(unit))
    }

    /// Units resolved so far, in no particular order.
    pub fn cached_units(&self) -> Vec<Arc<CompiledUnit>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn cached(&self, name: &UnitName) -> Option<Arc<CompiledUnit>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remember(&self, unit: CompiledUnit) -> Arc<CompiledUnit> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(unit.name().clone())
            .or_insert_with(|| Arc::new(unit))
            .clone()
    }

    fn find_on_disk(&self, name: &UnitName) -> Result<CompiledUnit> {
        let file_error = match self.find_in_file(name) {
            Ok(unit) => return Ok(unit),
            Err(err) if err.is_security_violation() => return Err(err),
            Err(err) => err,
        };
        let bundle_error = match self.find_in_bundles(name) {
            Ok(unit) => return Ok(unit),
            Err(err) => err,
        };
        // Report the failure of a source that actually held the unit.
        if file_error.is_not_found() {
            Err(bundle_error)
        } else {
            Err(file_error)
        }
    }

    fn find_in_file(&self, name: &UnitName) -> Result<CompiledUnit> {
        let path = self.directory.join(name.relative_path(&self.unit_suffix));
        let bytes = std::fs::read(&path).map_err(|err| {
            LoadError::not_found(name.as_str(), format!("{}: {err}", path.display()))
        })?;
        let unit = CompiledUnit::define(
            name.clone(),
            UnitOrigin::File { path: path.clone() },
            &bytes,
            &self.symbols,
            &self.policy,
        )?;
        trace!(unit = %name, path = %path.display(), "unit found in file");
        Ok(unit)
    }

    fn find_in_bundles(&self, name: &UnitName) -> Result<CompiledUnit> {
        let entry = name.entry_name(&self.unit_suffix);
        let bundles = self.bundles();
        if bundles.is_empty() && !self.directory.is_dir() {
            return Err(LoadError::not_found(
                name.as_str(),
                format!("directory {} is not accessible", self.directory.display()),
            ));
        }

        let mut failure = None;
        for archive in bundles {
            match read_bundle_entry(archive, &entry) {
                Ok(Some(bytes)) => {
                    let origin = UnitOrigin::Bundle {
                        archive: archive.clone(),
                        entry: entry.clone(),
                    };
                    match CompiledUnit::define(name.clone(), origin, &bytes, &self.symbols, &self.policy) {
                        Ok(unit) => {
                            debug!(unit = %name, bundle = %archive.display(), "unit found in bundle");
                            return Ok(unit);
                        }
                        Err(err) if err.is_security_violation() => return Err(err),
                        Err(err) => {
                            debug!(unit = %name, bundle = %archive.display(), error = %err, "bundle entry rejected");
                            failure.get_or_insert(err);
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(bundle = %archive.display(), error = %err, "could not read bundle");
                }
            }
        }
        Err(failure.unwrap_or_else(|| {
            LoadError::not_found(
                name.as_str(),
                format!("no unit file or bundle entry in {}", self.directory.display()),
            )
        }))
    }

    fn bundles(&self) -> &[PathBuf] {
        self.bundles.get_or_init(|| {
            list_files(&self.directory, &self.bundle_suffix, self.recursive_bundles)
        })
    }

    fn link_requirements(&self, unit: &CompiledUnit) -> Result<()> {
        if unit.manifest().requires.is_empty() {
            return Ok(());
        }
        self.resolving
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.name().clone());

        let result = unit.manifest().requires.iter().try_for_each(|dependency| {
            let in_progress = self
                .resolving
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(dependency);
            if in_progress {
                trace!(unit = %unit.name(), %dependency, "cyclic requirement");
                return Ok(());
            }
            self.load_unit(dependency)
                .map(drop)
                .map_err(|err| LoadError::Dependency {
                    name: unit.name().to_string(),
                    dependency: dependency.to_string(),
                    source: Box::new(err),
                })
        });

        self.resolving
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(unit.name());
        result
    }
}

/// Files under `directory` ending with `suffix`, sorted by path. Unreadable
/// entries are skipped.
pub fn list_files(directory: &Path, suffix: &str, recursive: bool) -> Vec<PathBuf> {
    let walker = WalkDir::new(directory)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();
    walker
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(error = %err, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(suffix))
        })
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn read_bundle_entry(
    archive: &Path,
    entry: &str,
) -> std::result::Result<Option<Vec<u8>>, zip::result::ZipError> {
    let file = std::fs::File::open(archive)?;
    let mut bundle = zip::ZipArchive::new(file)?;
    let mut unit = match bundle.by_name(entry) {
        Ok(unit) => unit,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut bytes = Vec::new();
    unit.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::capability::testing::GreeterCapability;
    use crate::capability::testing::HELLO;
    use crate::capability::testing::HOST_INTERNAL;
    use crate::error::SecurityViolation;
    use crate::symbol::NoParent;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_unit(dir: &Path, relative: &str, text: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn write_bundle(dir: &Path, file: &str, entries: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(std::fs::File::create(dir.join(file)).unwrap());
        for (name, text) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(text.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn loader(dir: &Path) -> SandboxedLoader {
        SandboxedLoader::new(dir, Arc::new(SymbolTable::new().with(HELLO)))
    }

    #[test]
    fn test_loads_loose_unit() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "acme/Hello.unit", r#"entry = "acme.greeters.Hello""#);

        let unit = loader(dir.path()).load("acme.Hello").unwrap();
        assert_eq!(unit.name().as_str(), "acme.Hello");
        assert_eq!(
            unit.origin(),
            &UnitOrigin::File {
                path: dir.path().join("acme/Hello.unit")
            }
        );
        assert!(unit.implements(GreeterCapability::NAME));
    }

    #[test]
    fn test_loads_from_first_bundle() {
        let dir = TempDir::new().unwrap();
        write_bundle(dir.path(), "a.bundle", &[("acme/Other.unit", "")]);
        write_bundle(
            dir.path(),
            "b.bundle",
            &[("acme/Hello.unit", r#"entry = "acme.greeters.Hello""#)],
        );
        write_bundle(
            dir.path(),
            "c.bundle",
            &[("acme/Hello.unit", r#"description = "shadowed""#)],
        );

        let unit = loader(dir.path()).load("acme.Hello").unwrap();
        assert_eq!(
            unit.origin(),
            &UnitOrigin::Bundle {
                archive: dir.path().join("b.bundle"),
                entry: "acme/Hello.unit".into(),
            }
        );
        assert!(!unit.is_abstract());
    }

    #[test]
    fn test_loose_file_wins_over_bundle() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "acme/Hello.unit", r#"description = "loose""#);
        write_bundle(
            dir.path(),
            "a.bundle",
            &[("acme/Hello.unit", r#"entry = "acme.greeters.Hello""#)],
        );

        let unit = loader(dir.path()).load("acme.Hello").unwrap();
        assert_eq!(unit.manifest().description.as_deref(), Some("loose"));
    }

    #[test]
    fn test_parent_wins_over_disk() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "acme/greeters/Hello.unit", r#"description = "impostor""#);

        let unit = loader(dir.path()).load("acme.greeters.Hello").unwrap();
        assert_eq!(unit.origin(), &UnitOrigin::Host);

        let unit = loader(dir.path())
            .with_parent(Arc::new(NoParent))
            .load("acme.greeters.Hello")
            .unwrap();
        assert_eq!(unit.manifest().description.as_deref(), Some("impostor"));
    }

    #[test]
    fn test_resolved_units_are_cached() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "acme/Hello.unit", r#"entry = "acme.greeters.Hello""#);
        let loader = loader(dir.path());

        let first = loader.load("acme.Hello").unwrap();
        std::fs::remove_file(dir.path().join("acme/Hello.unit")).unwrap();
        let second = loader.load("acme.Hello").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.cached_units().len(), 1);

        // A fresh loader never serves the stale unit.
        assert!(self::loader(dir.path()).load("acme.Hello").unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_and_corrupt_units_are_not_found() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "acme/Broken.unit", "entry = [");
        write_bundle(dir.path(), "broken.bundle", &[]);
        std::fs::write(dir.path().join("garbage.bundle"), b"not a zip").unwrap();

        let loader = loader(dir.path());
        assert!(loader.load("acme.Missing").unwrap_err().is_not_found());
        assert!(loader.load("acme.Broken").unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let loader = loader(&dir.path().join("nope"));
        let err = loader.load("acme.Hello").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("not accessible"));
    }

    #[test]
    fn test_policy_refuses_before_reading_disk() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "std/fs/File.unit", r#"entry = "acme.greeters.Hello""#);
        write_unit(
            dir.path(),
            "grok/authz/AuthorizationFramework.unit",
            r#"entry = "acme.greeters.Hello""#,
        );
        let loader = loader(dir.path());

        assert!(matches!(
            loader.load("std.fs.File"),
            Err(LoadError::Security(SecurityViolation::BlacklistedPackage { .. }))
        ));
        assert!(matches!(
            loader.load("grok.authz.AuthorizationFramework"),
            Err(LoadError::Security(SecurityViolation::HostNamespace { .. }))
        ));
        assert!(loader.cached_units().is_empty());
    }

    #[test]
    fn test_entry_symbols_go_through_the_policy() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "acme/Admin.unit", r#"entry = "grok.internal.Admin""#);
        write_unit(dir.path(), "acme/Files.unit", r#"entry = "std.fs.File""#);
        write_unit(dir.path(), "acme/Hidden.unit", r#"entry = "grok.internal.Admin""#);
        write_bundle(
            dir.path(),
            "a.bundle",
            &[("acme/Bundled.unit", r#"entry = "grok.internal.Admin""#)],
        );
        write_bundle(
            dir.path(),
            "b.bundle",
            &[
                ("acme/Bundled.unit", r#"entry = "acme.greeters.Hello""#),
                ("acme/Hidden.unit", r#"entry = "acme.greeters.Hello""#),
            ],
        );
        let symbols = SymbolTable::new().with(HELLO).with(HOST_INTERNAL);
        let loader = SandboxedLoader::new(dir.path(), Arc::new(symbols));

        assert!(matches!(
            loader.load("grok.internal.Admin"),
            Err(LoadError::Security(SecurityViolation::HostNamespace { .. }))
        ));
        assert!(matches!(
            loader.load("acme.Admin"),
            Err(LoadError::Security(SecurityViolation::HostNamespace { .. }))
        ));
        assert!(matches!(
            loader.load("acme.Files"),
            Err(LoadError::Security(SecurityViolation::BlacklistedPackage { .. }))
        ));
        // A refused source is not shadowed by a later one.
        assert!(matches!(
            loader.load("acme.Bundled"),
            Err(LoadError::Security(SecurityViolation::HostNamespace { .. }))
        ));
        assert!(loader.load("acme.Hidden").unwrap_err().is_security_violation());
        assert!(loader.cached_units().is_empty());
    }

    #[test]
    fn test_requirements_go_through_the_policy() {
        let dir = TempDir::new().unwrap();
        write_unit(
            dir.path(),
            "acme/Sneaky.unit",
            r#"
entry = "acme.greeters.Hello"
requires = ["acme.Common", "std.process.Command"]
"#,
        );
        write_unit(dir.path(), "acme/Common.unit", "");
        let loader = loader(dir.path());

        let err = loader.load("acme.Sneaky").unwrap_err();
        assert!(matches!(err, LoadError::Dependency { .. }));
        assert!(err.is_security_violation());
        assert!(loader.load("acme.Common").is_ok());
    }

    #[test]
    fn test_missing_requirement_fails_the_unit() {
        let dir = TempDir::new().unwrap();
        write_unit(
            dir.path(),
            "acme/Needy.unit",
            r#"
entry = "acme.greeters.Hello"
requires = ["acme.Absent"]
"#,
        );
        let err = loader(dir.path()).load("acme.Needy").unwrap_err();
        assert!(matches!(err, LoadError::Dependency { .. }));
        assert!(!err.is_security_violation());
    }

    #[test]
    fn test_cyclic_requirements_resolve() {
        let dir = TempDir::new().unwrap();
        write_unit(
            dir.path(),
            "acme/A.unit",
            r#"
entry = "acme.greeters.Hello"
requires = ["acme.B"]
"#,
        );
        write_unit(dir.path(), "acme/B.unit", r#"requires = ["acme.A"]"#);
        let loader = loader(dir.path());
        assert!(loader.load("acme.A").is_ok());
        assert_eq!(loader.cached_units().len(), 2);
    }

    #[test]
    fn test_list_files_depth() {
        let dir = TempDir::new().unwrap();
        write_unit(dir.path(), "top.bundle", "");
        write_unit(dir.path(), "nested/inner.bundle", "");
        write_unit(dir.path(), "nested/skip.txt", "");

        assert_eq!(
            list_files(dir.path(), ".bundle", false),
            vec![dir.path().join("top.bundle")]
        );
        assert_eq!(
            list_files(dir.path(), ".bundle", true),
            vec![
                dir.path().join("nested/inner.bundle"),
                dir.path().join("top.bundle"),
            ]
        );
    }
}

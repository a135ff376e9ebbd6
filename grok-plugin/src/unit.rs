use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::capability::Capability;
use crate::error::LoadError;
use crate::error::Result;
use crate::error::panic_message;
use crate::policy::SecurityPolicy;
use crate::symbol::PluginFactory;
use crate::symbol::SymbolTable;

/// Dotted identifier of a unit, e.g. `acme.auth.LdapUserPlugin`.
///
/// It is also the plugin's implementation identity: two instances built
/// from the same unit share it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitName(String);

impl UnitName {
    pub fn parse(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
            });
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(LoadError::InvalidName(name.to_string()))
        }
    }

    /// Name of a loose unit at `relative` (relative to the plugin
    /// directory). `None` unless the file carries `suffix`.
    pub fn from_relative_path(relative: &Path, suffix: &str) -> Option<Self> {
        let segments = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Self::from_segments(&segments, suffix)
    }

    /// Name of a bundle entry; archives always use `/` as separator.
    pub fn from_entry(entry: &str, suffix: &str) -> Option<Self> {
        let segments = entry.split('/').collect::<Vec<_>>();
        Self::from_segments(&segments, suffix)
    }

    fn from_segments(segments: &[&str], suffix: &str) -> Option<Self> {
        let (file, packages) = segments.split_last()?;
        let stem = file.strip_suffix(suffix)?;
        let mut name = packages.join(".");
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(stem);
        Self::parse(&name).ok()
    }

    pub fn relative_path(&self, suffix: &str) -> PathBuf {
        let mut path: PathBuf = self.0.split('.').collect();
        path.set_file_name(format!("{}{suffix}", self.simple_name()));
        path
    }

    pub fn entry_name(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.0.replace('.', "/"))
    }

    pub fn simple_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UnitName {
    type Error = LoadError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<UnitName> for String {
    fn from(value: UnitName) -> Self {
        value.0
    }
}

/// Where a unit was resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UnitOrigin {
    Host,
    File { path: PathBuf },
    Bundle { archive: PathBuf, entry: String },
}

impl fmt::Display for UnitOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::File { path } => write!(f, "{}", path.display()),
            Self::Bundle { archive, entry } => write!(f, "{}!{entry}", archive.display()),
        }
    }
}

/// Contents of a unit file.
///
/// ```toml
/// entry = "grok.authz.plugins.UserWhitelistPlugin"
/// requires = ["acme.auth.Common"]
/// ```
///
/// A unit without `entry` is abstract: it resolves, but is never
/// instantiated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitManifest {
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub requires: Vec<UnitName>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// A resolved unit, linked against the host's symbol table.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    name: UnitName,
    origin: UnitOrigin,
    manifest: UnitManifest,
    entry: Option<PluginFactory>,
    digest: Option<String>,
}

impl CompiledUnit {
    /// A unit the host itself provides under the symbol `name`.
    pub fn host(name: UnitName, factory: PluginFactory) -> Self {
        Self {
            manifest: UnitManifest {
                entry: Some(factory.symbol.to_string()),
                ..UnitManifest::default()
            },
            name,
            origin: UnitOrigin::Host,
            entry: Some(factory),
            digest: None,
        }
    }

    /// Parses unit bytes and links the entry symbol. Corrupt bytes surface
    /// as [`LoadError::NotFound`]; dependencies are left to the loader.
    ///
    /// The entry symbol is held to the same policy as unit names, so a unit
    /// cannot reach a host type that could not be loaded by name.
    pub fn define(
        name: UnitName,
        origin: UnitOrigin,
        bytes: &[u8],
        symbols: &SymbolTable,
        policy: &SecurityPolicy,
    ) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| LoadError::not_found(name.as_str(), format!("{origin}: {err}")))?;
        let manifest: UnitManifest = toml::from_str(text)
            .map_err(|err| LoadError::not_found(name.as_str(), format!("{origin}: {err}")))?;
        let entry = match manifest.entry.as_deref() {
            Some(symbol) => {
                policy.check(symbol)?;
                match symbols.resolve(symbol) {
                    Some(factory) => Some(*factory),
                    None => {
                        return Err(LoadError::UnresolvedSymbol {
                            name: name.to_string(),
                            symbol: symbol.to_string(),
                        });
                    }
                }
            }
            None => None,
        };
        Ok(Self {
            name,
            origin,
            manifest,
            entry,
            digest: Some(format!("{:x}", Sha256::digest(bytes))),
        })
    }

    pub fn name(&self) -> &UnitName {
        &self.name
    }

    pub fn origin(&self) -> &UnitOrigin {
        &self.origin
    }

    pub fn manifest(&self) -> &UnitManifest {
        &self.manifest
    }

    /// Hex sha256 of the unit bytes; `None` for host units.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn is_abstract(&self) -> bool {
        self.entry.is_none()
    }

    pub fn implements(&self, capability: &str) -> bool {
        self.entry
            .is_some_and(|factory| factory.capability == capability)
    }

    /// Builds a fresh instance through the unit's no-argument factory.
    /// A panicking constructor is contained and reported as an error.
    pub fn instantiate<C: Capability>(&self) -> Result<C::Instance> {
        let factory = match self.entry {
            Some(factory) if factory.capability == C::NAME => factory,
            _ => {
                return Err(LoadError::NotImplementer {
                    name: self.name.to_string(),
                    capability: C::NAME.to_string(),
                });
            }
        };
        let boxed = std::panic::catch_unwind(AssertUnwindSafe(|| factory.construct())).map_err(
            |payload| LoadError::Instantiation {
                name: self.name.to_string(),
                reason: panic_message(payload.as_ref()),
            },
        )?;
        boxed
            .downcast::<C::Instance>()
            .map(|instance| *instance)
            .map_err(|_| LoadError::Instantiation {
                name: self.name.to_string(),
                reason: format!("factory \"{}\" built an unexpected type", factory.symbol),
            })
    }
}

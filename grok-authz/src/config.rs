use std::path::Path;
use std::path::PathBuf;

use grok_plugin::DiscoveryOptions;
use grok_plugin::SecurityPolicy;
use serde::Deserialize;
use serde::Serialize;

use crate::catalog::CatalogConfig;
use crate::error::AuthzError;
use crate::error::Result;
use crate::plugin::Setup;
use crate::role::Role;
use crate::scope::Scope;

pub const DEFAULT_STACK_NAME: &str = "default stack";

/// Top-level authorization configuration.
///
/// ```toml
/// plugin_directory = "/var/lib/grok/plugins"
/// append_unconfigured = true
///
/// [security]
/// host_namespaces = ["grok"]
///
/// [[stack.entries]]
/// kind = "plugin"
/// name = "grok.authz.plugins.UserWhitelistPlugin"
/// role = "requisite"
/// setup = { file = "/etc/grok/users" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// Without a directory no reload ever publishes a stack and every
    /// request is allowed.
    pub plugin_directory: Option<PathBuf>,
    #[serde(flatten)]
    pub discovery: DiscoveryOptions,
    /// Loaded units with no configured slot join the top-level stack as
    /// REQUIRED entries.
    pub append_unconfigured: bool,
    pub security: SecurityPolicy,
    pub stack: StackConfig,
    pub catalog: CatalogConfig,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            plugin_directory: None,
            discovery: DiscoveryOptions::default(),
            append_unconfigured: true,
            security: SecurityPolicy::default(),
            stack: StackConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl AuthzConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads a configuration file. A relative `plugin_directory` is taken
    /// relative to the file's directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| AuthzError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let (Some(directory), Some(base)) = (config.plugin_directory.as_mut(), path.parent()) {
            if directory.is_relative() {
                *directory = base.join(&*directory);
            }
        }
        Ok(config)
    }
}

/// A stack: ordered entries sharing one role towards the enclosing stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub name: String,
    pub role: Role,
    pub setup: Setup,
    pub scope: Scope,
    pub entries: Vec<EntryConfig>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_STACK_NAME.to_string(),
            role: Role::Required,
            setup: Setup::new(),
            scope: Scope::default(),
            entries: Vec::new(),
        }
    }
}

/// A plugin slot, bound by unit name on every reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub name: String,
    pub role: Role,
    pub setup: Setup,
    pub scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryConfig {
    Plugin(PluginConfig),
    Stack(StackConfig),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const FULL: &str = r#"
plugin_directory = "/var/lib/grok/plugins"
load_bundles = false
unit_suffix = ".plugin"
append_unconfigured = false

[security]
package_blacklist = ["std"]
host_namespaces = ["grok"]
class_whitelist = ["grok.authz.plugins.*"]

[stack]
setup = { realm = "corp" }

[[stack.entries]]
kind = "plugin"
name = "acme.auth.Ldap"
role = "requisite"
setup = { url = "ldap://ldap.example.com", timeout = 5 }
scope = { groups = ["system"] }

[[stack.entries]]
kind = "stack"
name = "admins"
role = "sufficient"

[[stack.entries.entries]]
kind = "plugin"
name = "grok.authz.plugins.UserWhitelistPlugin"
setup = { file = "/etc/grok/admins" }

[catalog]
projects = ["kernel"]
groups = [{ name = "system", projects = ["kernel"] }]
"#;

    #[test]
    fn test_full_config() {
        let config = AuthzConfig::from_toml_str(FULL).unwrap();
        assert_eq!(
            config.plugin_directory.as_deref(),
            Some(Path::new("/var/lib/grok/plugins"))
        );
        assert!(!config.discovery.load_bundles);
        assert!(config.discovery.load_units);
        assert_eq!(config.discovery.unit_suffix, ".plugin");
        assert!(!config.append_unconfigured);
        assert_eq!(config.security.package_blacklist, vec!["std".to_string()]);
        assert_eq!(config.stack.name, DEFAULT_STACK_NAME);
        assert_eq!(config.stack.setup.get("realm"), Some(&json!("corp")));
        assert_eq!(config.stack.entries.len(), 2);

        let EntryConfig::Plugin(ldap) = &config.stack.entries[0] else {
            panic!("expected a plugin entry");
        };
        assert_eq!(ldap.role, Role::Requisite);
        assert_eq!(ldap.setup.get("timeout"), Some(&json!(5)));
        assert_eq!(ldap.scope, Scope::new().with_group("system"));

        let EntryConfig::Stack(admins) = &config.stack.entries[1] else {
            panic!("expected a nested stack");
        };
        assert_eq!(admins.role, Role::Sufficient);
        let EntryConfig::Plugin(whitelist) = &admins.entries[0] else {
            panic!("expected a plugin entry");
        };
        assert_eq!(whitelist.role, Role::Required);
        assert_eq!(config.catalog.groups[0].name, "system");
    }

    #[test]
    fn test_defaults() {
        let config = AuthzConfig::from_toml_str("").unwrap();
        assert_eq!(config, AuthzConfig::default());
        assert!(config.append_unconfigured);
        assert!(config.discovery.recursive_units);
        assert!(!config.discovery.recursive_bundles);
    }

    #[test]
    fn test_optional_role_is_rejected() {
        let err = AuthzConfig::from_toml_str(
            r#"
[[stack.entries]]
kind = "plugin"
name = "acme.auth.Ldap"
role = "optional"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not supported"), "{err}");
    }

    #[test]
    fn test_from_path_resolves_relative_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("authz.toml");
        std::fs::write(&path, "plugin_directory = \"plugins\"\n").unwrap();

        let config = AuthzConfig::from_path(&path).unwrap();
        assert_eq!(config.plugin_directory, Some(dir.path().join("plugins")));

        let missing = AuthzConfig::from_path(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(AuthzError::Io { .. })));
    }
}

use serde::Deserialize;
use serde::Serialize;
use wildmatch::WildMatch;

use crate::error::SecurityViolation;

/// Namespace policy applied to every unit name before the loader reads a
/// single byte for it.
///
/// * `package_blacklist`: namespaces that plugins may never provide or
///   require (the platform runtime, raw I/O, reflection).
/// * `host_namespaces`: namespaces owned by the host application. Names in
///   them are refused unless they match one of the `class_whitelist`
///   patterns, so a plugin cannot impersonate a trusted internal unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub package_blacklist: Vec<String>,
    pub host_namespaces: Vec<String>,
    pub class_whitelist: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            package_blacklist: vec![
                "std".into(),
                "core".into(),
                "alloc".into(),
                "proc_macro".into(),
                "libc".into(),
                "sys".into(),
            ],
            host_namespaces: vec!["grok".into()],
            class_whitelist: vec![
                "grok.configuration.Group".into(),
                "grok.configuration.Project".into(),
                "grok.authz.AuthorizationPlugin".into(),
                "grok.authz.plugins.*".into(),
                "grok.authz.AuthorizationError".into(),
                "grok.util.*".into(),
                "grok.logger.*".into(),
                "grok.Metrics".into(),
            ],
        }
    }
}

impl SecurityPolicy {
    /// Runs both checks; the host namespace check goes first.
    pub fn check(&self, name: &str) -> Result<(), SecurityViolation> {
        self.check_host_namespace(name)?;
        self.check_package(name)
    }

    pub fn check_package(&self, name: &str) -> Result<(), SecurityViolation> {
        match self
            .package_blacklist
            .iter()
            .find(|package| in_namespace(name, package))
        {
            Some(package) => Err(SecurityViolation::BlacklistedPackage {
                name: name.to_string(),
                package: package.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn check_host_namespace(&self, name: &str) -> Result<(), SecurityViolation> {
        let Some(namespace) = self
            .host_namespaces
            .iter()
            .find(|namespace| in_namespace(name, namespace))
        else {
            return Ok(());
        };
        if self.is_whitelisted(name) {
            Ok(())
        } else {
            Err(SecurityViolation::HostNamespace {
                name: name.to_string(),
                namespace: namespace.clone(),
            })
        }
    }

    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.class_whitelist
            .iter()
            .any(|pattern| WildMatch::new(pattern).matches(name))
    }
}

/// `name` lies strictly inside `namespace` ("std.fs" is inside "std",
/// "stdx.fs" and "std" itself are not).
fn in_namespace(name: &str, namespace: &str) -> bool {
    name.strip_prefix(namespace)
        .is_some_and(|rest| rest.starts_with('.'))
}

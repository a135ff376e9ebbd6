use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::PoisonError;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use tracing::debug;

use crate::entity::Group;
use crate::entity::Project;
use crate::plugin::AuthorizationPlugin;
use crate::plugin::Setup;
use crate::plugin::authorization_plugin;
use crate::request::RequestContext;

pub const USER_WHITELIST_PLUGIN: &str = "grok.authz.plugins.UserWhitelistPlugin";

const FILE_PARAM: &str = "file";
const FIELD_PARAM: &str = "fieldName";

inventory::submit! {
    authorization_plugin::<UserWhitelistPlugin>(USER_WHITELIST_PLUGIN)
}

/// Which user attribute is compared against the whitelist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WhitelistField {
    #[default]
    Username,
    Id,
}

impl WhitelistField {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "username" => Ok(WhitelistField::Username),
            "id" => Ok(WhitelistField::Id),
            other => bail!("invalid value \"{other}\" of parameter \"{FIELD_PARAM}\", expected username or id"),
        }
    }
}

#[derive(Debug, Default)]
struct Whitelist {
    field: WhitelistField,
    entries: BTreeSet<String>,
}

/// Allows users listed in a file, one per line.
///
/// Parameters: `file` (required) and `fieldName` (`username` or `id`,
/// default `username`). Requests without a user are denied.
#[derive(Debug, Default)]
pub struct UserWhitelistPlugin {
    whitelist: RwLock<Whitelist>,
}

impl UserWhitelistPlugin {
    pub fn whitelist(&self) -> BTreeSet<String> {
        self.whitelist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    pub fn field(&self) -> WhitelistField {
        self.whitelist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .field
    }

    fn check(&self, request: &RequestContext) -> bool {
        let Some(user) = request.user() else {
            debug!("no user in request, denying");
            return false;
        };
        let whitelist = self.whitelist.read().unwrap_or_else(PoisonError::into_inner);
        let value = match whitelist.field {
            WhitelistField::Username => Some(user.username.as_str()),
            WhitelistField::Id => user.id.as_deref(),
        };
        value.is_some_and(|value| whitelist.entries.contains(value))
    }
}

impl AuthorizationPlugin for UserWhitelistPlugin {
    fn load(&mut self, parameters: &Setup) -> anyhow::Result<()> {
        let field = match parameters.get(FIELD_PARAM) {
            None => WhitelistField::default(),
            Some(value) => {
                let value = value
                    .as_str()
                    .ok_or_else(|| anyhow!("parameter \"{FIELD_PARAM}\" must be a string"))?;
                WhitelistField::parse(value)?
            }
        };

        let file = parameters
            .get(FILE_PARAM)
            .and_then(serde_json::Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Missing parameter \"{FILE_PARAM}\" in the configuration"))?;

        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("Unable to read the file \"{}\"", file.display()))?;
        let entries: BTreeSet<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(file = %file.display(), entries = entries.len(), "whitelist loaded");

        *self.whitelist.get_mut().unwrap_or_else(PoisonError::into_inner) = Whitelist { field, entries };
        Ok(())
    }

    fn is_allowed_project(&self, request: &RequestContext, _project: &Project) -> anyhow::Result<bool> {
        Ok(self.check(request))
    }

    fn is_allowed_group(&self, request: &RequestContext, _group: &Group) -> anyhow::Result<bool> {
        Ok(self.check(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::AuthorizationCapability;
    use crate::request::User;
    use grok_plugin::Capability;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn setup(value: serde_json::Value) -> Setup {
        value.as_object().unwrap().clone()
    }

    fn whitelist_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn test_missing_file_parameter() {
        let mut plugin = UserWhitelistPlugin::default();
        let err = plugin.load(&Setup::new()).unwrap_err();
        assert!(err.to_string().contains("Missing parameter"), "{err}");
    }

    #[test]
    fn test_unreadable_file() {
        let mut plugin = UserWhitelistPlugin::default();
        let err = plugin
            .load(&setup(json!({"file": "/nonexistent/grok/whitelist"})))
            .unwrap_err();
        assert!(err.to_string().contains("Unable to read the file"), "{err}");
    }

    #[test]
    fn test_invalid_field_name() {
        let file = whitelist_file(&["alice"]);
        let mut plugin = UserWhitelistPlugin::default();
        let err = plugin
            .load(&setup(json!({"file": file.path(), "fieldName": "huh"})))
            .unwrap_err();
        assert!(err.to_string().contains("fieldName"), "{err}");
    }

    #[test]
    fn test_whitespace_is_stripped() {
        let file = whitelist_file(&["Moomin", " Fillyjonk", "  Snuffkin", "Snork Maiden  ", "", "Groke "]);
        let mut plugin = UserWhitelistPlugin::default();
        plugin.load(&setup(json!({"file": file.path()}))).unwrap();

        let expected: BTreeSet<String> = ["Fillyjonk", "Groke", "Moomin", "Snork Maiden", "Snuffkin"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(plugin.whitelist(), expected);
        assert_eq!(plugin.field(), WhitelistField::Username);
    }

    #[test]
    fn test_checks_by_username() {
        let file = whitelist_file(&["alice"]);
        let mut plugin = UserWhitelistPlugin::default();
        plugin.load(&setup(json!({"file": file.path()}))).unwrap();

        let alice = RequestContext::new().with_user(User::new("alice"));
        let bob = RequestContext::new().with_user(User::new("bob"));
        assert!(plugin.is_allowed_project(&alice, &Project::new("kernel")).unwrap());
        assert!(plugin.is_allowed_group(&alice, &Group::new("system")).unwrap());
        assert!(!plugin.is_allowed_project(&bob, &Project::new("kernel")).unwrap());
        assert!(!plugin
            .is_allowed_project(&RequestContext::new(), &Project::new("kernel"))
            .unwrap());
    }

    #[test]
    fn test_checks_by_id() {
        let file = whitelist_file(&["id2178"]);
        let mut plugin = UserWhitelistPlugin::default();
        plugin
            .load(&setup(json!({"file": file.path(), "fieldName": "id"})))
            .unwrap();

        let with_id = RequestContext::new().with_user(User::new("alice").with_id("id2178"));
        let without_id = RequestContext::new().with_user(User::new("id2178"));
        assert!(plugin.is_allowed_project(&with_id, &Project::new("kernel")).unwrap());
        assert!(!plugin.is_allowed_project(&without_id, &Project::new("kernel")).unwrap());

        // Readers of a replaced stack may still be checking against it.
        plugin.unload();
        assert!(plugin.is_allowed_project(&with_id, &Project::new("kernel")).unwrap());
    }

    #[test]
    fn test_exported_under_host_namespace() {
        let symbols = grok_plugin::SymbolTable::exported();
        let factory = symbols.resolve(USER_WHITELIST_PLUGIN).unwrap();
        assert_eq!(factory.capability, AuthorizationCapability::NAME);
        assert!(grok_plugin::SecurityPolicy::default().check(USER_WHITELIST_PLUGIN).is_ok());
    }
}

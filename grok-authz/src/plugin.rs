use std::any::Any;

use grok_plugin::Capability;
use grok_plugin::PluginFactory;

use crate::entity::Group;
use crate::entity::Project;
use crate::request::RequestContext;

/// Parameters handed to [`AuthorizationPlugin::load`]. The framework passes
/// them through without interpretation.
pub type Setup = serde_json::Map<String, serde_json::Value>;

/// The contract every authorization plugin implements.
///
/// `load` runs once per reload, before the stack holding the plugin is
/// published, so it has exclusive access. The check methods run
/// concurrently on request threads. `unload` runs after the stack was
/// replaced and may overlap with late checks still holding the old stack;
/// it should only release external resources.
///
/// Errors and panics from any method are contained by the stack: a failing
/// `load` marks the entry failed, a failing check denies that one call.
pub trait AuthorizationPlugin: Send + Sync {
    fn load(&mut self, _parameters: &Setup) -> anyhow::Result<()> {
        Ok(())
    }

    fn unload(&self) {}

    fn is_allowed_project(&self, request: &RequestContext, project: &Project)
    -> anyhow::Result<bool>;

    fn is_allowed_group(&self, request: &RequestContext, group: &Group) -> anyhow::Result<bool>;
}

/// Registry capability for [`AuthorizationPlugin`] implementers.
pub struct AuthorizationCapability;

impl Capability for AuthorizationCapability {
    const NAME: &'static str = "grok.authz.AuthorizationPlugin";
    type Instance = Box<dyn AuthorizationPlugin>;
}

/// Factory exporting `P` under `symbol`.
///
/// ```ignore
/// inventory::submit! {
///     grok_authz::authorization_plugin::<MyPlugin>("acme.auth.MyPlugin")
/// }
/// ```
pub const fn authorization_plugin<P>(symbol: &'static str) -> PluginFactory
where
    P: AuthorizationPlugin + Default + 'static,
{
    PluginFactory::new(symbol, AuthorizationCapability::NAME, construct::<P>)
}

fn construct<P>() -> Box<dyn Any + Send>
where
    P: AuthorizationPlugin + Default + 'static,
{
    Box::new(Box::new(P::default()) as Box<dyn AuthorizationPlugin>)
}

pub mod catalog;
pub mod config;
pub mod entity;
pub mod error;
pub mod framework;
pub mod lifecycle;
pub mod plugin;
pub mod plugins;
pub mod request;
pub mod role;
pub mod scope;
pub mod stack;
pub mod statistics;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience.
pub use catalog::CatalogConfig;
pub use catalog::GroupConfig;
pub use catalog::ProjectCatalog;
pub use config::AuthzConfig;
pub use config::EntryConfig;
pub use config::PluginConfig;
pub use config::StackConfig;
pub use entity::EntityKind;
pub use entity::Group;
pub use entity::Project;
pub use entity::ProtectedEntity;
pub use error::AuthzError;
pub use error::Result;
pub use framework::AuthorizationFramework;
pub use framework::PublishedStack;
pub use lifecycle::EntryStatus;
pub use lifecycle::PluginState;
pub use plugin::AuthorizationCapability;
pub use plugin::AuthorizationPlugin;
pub use plugin::Setup;
pub use plugin::authorization_plugin;
pub use plugins::UserWhitelistPlugin;
pub use request::RequestContext;
pub use request::User;
pub use role::Role;
pub use scope::Scope;
pub use stack::AuthorizationEntity;
pub use stack::AuthorizationStack;
pub use stack::PluginEntry;
pub use statistics::Statistics;
pub use statistics::StatisticsSnapshot;
pub use statistics::Timing;

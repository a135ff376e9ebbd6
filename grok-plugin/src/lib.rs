pub mod capability;
pub mod error;
pub mod loader;
pub mod policy;
pub mod registry;
pub mod symbol;
pub mod unit;

// Re-export key types for convenience.
pub use capability::Capability;
pub use error::LoadError;
pub use error::Result;
pub use error::SecurityViolation;
pub use error::panic_message;
pub use loader::SandboxedLoader;
pub use policy::SecurityPolicy;
pub use registry::DiscoveryOptions;
pub use registry::LoadedPlugin;
pub use registry::PluginRegistry;
pub use registry::ReloadHooks;
pub use registry::ReloadOutcome;
pub use registry::ReloadReport;
pub use symbol::NoParent;
pub use symbol::ParentLoader;
pub use symbol::PluginFactory;
pub use symbol::SymbolTable;
pub use unit::CompiledUnit;
pub use unit::UnitManifest;
pub use unit::UnitName;
pub use unit::UnitOrigin;
